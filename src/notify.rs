use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 256;
const REPLAY_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingEventKind {
    Confirmed,
    Cancelled,
    Rescheduled,
    Completed,
    NoShow,
}

impl BookingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingEventKind::Confirmed => "confirmed",
            BookingEventKind::Cancelled => "cancelled",
            BookingEventKind::Rescheduled => "rescheduled",
            BookingEventKind::Completed => "completed",
            BookingEventKind::NoShow => "no_show",
        }
    }
}

/// Outbound lifecycle event with a full booking snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub seq: u64,
    pub kind: BookingEventKind,
    pub booking: Booking,
}

struct ReplayLog {
    next_seq: u64,
    events: VecDeque<BookingEvent>,
}

/// Broadcast hub for booking lifecycle events, per consultant and tenant-wide.
///
/// Delivery is at-least-once: a consumer that lagged or reconnected catches up
/// from the bounded replay buffer with `events_since`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
    log: Mutex<ReplayLog>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            log: Mutex::new(ReplayLog {
                next_seq: 1,
                events: VecDeque::new(),
            }),
        }
    }

    /// Subscribe to one consultant's events. Creates the channel if needed.
    pub fn subscribe(&self, consultant_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(consultant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every consultant's events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// Sequence and publish an event. Returns the assigned sequence number.
    /// Never fails: nobody listening is not an error.
    pub fn send(&self, kind: BookingEventKind, booking: &Booking) -> u64 {
        let event = {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            let event = BookingEvent {
                seq: log.next_seq,
                kind,
                booking: booking.clone(),
            };
            log.next_seq += 1;
            if log.events.len() == REPLAY_CAPACITY {
                log.events.pop_front();
            }
            log.events.push_back(event.clone());
            event
        };
        if let Some(sender) = self.channels.get(&booking.consultant_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
        event.seq
    }

    /// Buffered events with `seq > after`, oldest first.
    pub fn events_since(&self, after: u64) -> Vec<BookingEvent> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    /// Highest sequence number handed out so far.
    pub fn last_seq(&self) -> u64 {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.next_seq - 1
    }

    /// Remove a channel (e.g. when the consultant is removed).
    pub fn remove(&self, consultant_id: &Ulid) {
        self.channels.remove(consultant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn booking(consultant_id: Ulid) -> Booking {
        let id = Ulid::new();
        Booking {
            id,
            reference: Booking::reference_for(id),
            consultant_id,
            span: Span::new(1_000, 2_000),
            duration_minutes: 30,
            client: ClientContact {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                phone: None,
                timezone: "UTC".into(),
                notes: None,
            },
            status: BookingStatus::Confirmed,
            version: 1,
            supersedes: None,
            superseded_by: None,
            created_at: 0,
            confirmed_at: 0,
            sync: SyncStatus::default(),
            absence_reported: false,
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);
        let mut all = hub.subscribe_all();

        let b = booking(cid);
        let seq = hub.send(BookingEventKind::Confirmed, &b);
        assert_eq!(seq, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.booking, b);
        assert_eq!(received.kind, BookingEventKind::Confirmed);
        assert_eq!(all.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn other_consultants_are_filtered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(BookingEventKind::Cancelled, &booking(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        hub.send(BookingEventKind::Completed, &booking(cid));
        hub.remove(&cid);
        assert_eq!(hub.last_seq(), 1);
    }

    #[test]
    fn replay_buffer_serves_missed_events() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        for _ in 0..5 {
            hub.send(BookingEventKind::Confirmed, &booking(cid));
        }
        let missed = hub.events_since(3);
        assert_eq!(missed.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert!(hub.events_since(5).is_empty());
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let b = booking(cid);
        for _ in 0..REPLAY_CAPACITY + 10 {
            hub.send(BookingEventKind::Confirmed, &b);
        }
        let all = hub.events_since(0);
        assert_eq!(all.len(), REPLAY_CAPACITY);
        assert_eq!(all[0].seq, 11);
    }
}
