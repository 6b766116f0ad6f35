mod availability;
mod conflict;
mod error;
mod ledger;
mod notifications;
mod resolver;
mod schedule;
mod slots;
mod sync;

pub use availability::{busy_spans, free_intervals, merge_overlapping, subtract_intervals};
pub use error::{ConflictReason, EngineError};
pub use ledger::TransitionMeta;
pub use resolver::BookingRequest;
pub use schedule::{ConsultantProfile, validate_weekday_ranges};
pub use slots::{SlotIter, parse_timezone, project_working_hours};
pub use sync::{
    CalendarChange, ChangeKind, PullOutcome, SyncRetryPolicy, after_success, push_pending,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::{BookingEventKind, NotifyHub};
use crate::wal::Wal;

pub type SharedConsultantState = Arc<RwLock<ConsultantState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<u64>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<u64>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond with each record's lsn.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before the non-append command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<Vec<u64>> {
    let mut lsns = Vec::with_capacity(batch.len());
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        match wal.append_buffered(event) {
            Ok(lsn) => lsns.push(lsn),
            Err(e) => {
                append_err = Some(e);
                break;
            }
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err.or(flush_err) {
        return Err(e);
    }
    Ok(lsns)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<Vec<u64>>) {
    for (i, (_, tx)) in batch.into_iter().enumerate() {
        let r = match result {
            Ok(lsns) => Ok(lsns[i]),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events, wal.last_lsn())
                .and_then(|last| wal.swap_compact_file(last));
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's scheduling engine.
pub struct Engine {
    pub state: DashMap<Ulid, SharedConsultantState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// booking id → consultant id
    booking_index: DashMap<Ulid, Ulid>,
    /// client-facing reference → booking id
    reference_index: DashMap<String, Ulid>,
    /// external calendar event id → booking id
    external_index: DashMap<String, Ulid>,
    /// blackout id → consultant id
    blackout_index: DashMap<Ulid, Ulid>,
    /// Held while a consultant is created or removed, and while a compaction
    /// snapshot is taken, so a snapshot never misses a consultant.
    registry: Mutex<()>,
}

/// Apply an event to one consultant's state (no locking; caller holds the lock).
fn apply_to_consultant(cs: &mut ConsultantState, event: &Event) {
    match event {
        Event::ScheduleReplaced { schedule } => cs.schedule = schedule.clone(),
        Event::ConsultantRemoved { .. } => cs.removed = true,
        Event::BookingCommitted { booking } | Event::BookingRestored { booking } => {
            cs.insert_booking(booking.clone())
        }
        Event::BookingTransitioned { id, change, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                apply_status_change(b, change);
            }
        }
        Event::BookingRescheduled {
            id,
            change,
            replacement,
            ..
        } => {
            if let Some(b) = cs.booking_mut(id) {
                apply_status_change(b, change);
                b.superseded_by = Some(replacement.id);
                if b.sync.external_event_id.is_some()
                    && b.sync.external_event_id == replacement.sync.external_event_id
                {
                    // The calendar moved the event itself; it now belongs to the replacement.
                    b.sync.external_event_id = None;
                    b.sync.state = SyncState::Synced;
                }
            }
            cs.insert_booking(replacement.clone());
        }
        Event::SyncRecorded { id, sync, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                b.sync = sync.clone();
            }
        }
        Event::AbsenceReported { id, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                b.absence_reported = true;
            }
        }
        Event::NotificationsDispatched { keys, .. } => {
            cs.dispatched.extend(keys.iter().copied());
        }
    }
}

fn apply_status_change(b: &mut Booking, change: &StatusChange) {
    b.status = change.to;
    b.version = change.version;
    // A released booking's calendar event must be deleted by the next push.
    if matches!(
        change.to,
        BookingStatus::Cancelled | BookingStatus::NoShow | BookingStatus::Rescheduled
    ) && b.sync.external_event_id.is_some()
        && b.sync.state != SyncState::ExternalDeleted
    {
        b.sync.state = SyncState::Unsynced;
        b.sync.attempts = 0;
        b.sync.last_attempt_at = None;
        b.sync.last_error = None;
    }
    b.history.push(change.clone());
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let last_lsn = records.last().map_or(0, |r| r.lsn);
        let wal = Wal::open(&wal_path, last_lsn)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            config,
            booking_index: DashMap::new(),
            reference_index: DashMap::new(),
            external_index: DashMap::new(),
            blackout_index: DashMap::new(),
            registry: Mutex::new(()),
        };

        // We're the sole owner of these Arcs, so try_read/try_write always
        // succeed. Never use blocking_* here: this may run inside an async
        // context (lazy tenant creation).
        for record in &records {
            engine.replay_event(&record.event);
        }
        tracing::debug!(
            "replayed {} WAL records up to lsn {last_lsn}, {} consultants",
            records.len(),
            engine.state.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        let consultant_id = event.consultant_id();
        match event {
            Event::ScheduleReplaced { schedule } if !self.state.contains_key(&consultant_id) => {
                let cs = ConsultantState::new(schedule.clone());
                self.state.insert(consultant_id, Arc::new(RwLock::new(cs)));
            }
            Event::ConsultantRemoved { id } => {
                if let Some((_, rs)) = self.state.remove(id) {
                    let guard = rs.try_read().expect("replay: uncontended read");
                    self.forget_consultant(&guard);
                }
                return;
            }
            _ => {
                let Some(rs) = self.get_consultant(&consultant_id) else {
                    return;
                };
                let mut guard = rs.try_write().expect("replay: uncontended write");
                apply_to_consultant(&mut guard, event);
            }
        }
        self.index_event(event);
    }

    /// Keep the secondary indexes in step with an applied event.
    fn index_event(&self, event: &Event) {
        match event {
            Event::ScheduleReplaced { schedule } => {
                for b in &schedule.blackouts {
                    self.blackout_index.insert(b.id, schedule.consultant_id);
                }
            }
            Event::BookingCommitted { booking } | Event::BookingRestored { booking } => {
                self.index_booking(booking);
            }
            Event::BookingRescheduled { replacement, .. } => {
                self.index_booking(replacement);
            }
            Event::SyncRecorded { id, sync, .. } => {
                if let Some(ext) = &sync.external_event_id {
                    self.external_index.insert(ext.clone(), *id);
                }
            }
            Event::ConsultantRemoved { .. }
            | Event::BookingTransitioned { .. }
            | Event::AbsenceReported { .. }
            | Event::NotificationsDispatched { .. } => {}
        }
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_index.insert(booking.id, booking.consultant_id);
        self.reference_index
            .insert(booking.reference.clone(), booking.id);
        if let Some(ext) = &booking.sync.external_event_id {
            self.external_index.insert(ext.clone(), booking.id);
        }
    }

    /// Drop every index entry pointing into a removed consultant.
    fn forget_consultant(&self, cs: &ConsultantState) {
        for b in &cs.bookings {
            self.booking_index.remove(&b.id);
            self.reference_index.remove(&b.reference);
            if let Some(ext) = &b.sync.external_event_id {
                self.external_index.remove(ext);
            }
        }
        for b in &cs.schedule.blackouts {
            self.blackout_index.remove(&b.id);
        }
    }

    /// Write event to WAL via the background group-commit writer. Returns its lsn.
    async fn wal_append(&self, event: &Event) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append + apply + index + publish in one call.
    async fn persist_and_apply(
        &self,
        cs: &mut ConsultantState,
        event: &Event,
    ) -> Result<u64, EngineError> {
        let lsn = self.wal_append(event).await?;
        apply_to_consultant(cs, event);
        self.index_event(event);
        self.publish(cs, event);
        Ok(lsn)
    }

    /// Emit lifecycle events to subscribers. Failure to deliver never rolls back.
    fn publish(&self, cs: &ConsultantState, event: &Event) {
        match event {
            Event::BookingCommitted { booking } => {
                self.notify.send(BookingEventKind::Confirmed, booking);
            }
            Event::BookingTransitioned { id, change, .. } => {
                let kind = match change.to {
                    BookingStatus::Completed => BookingEventKind::Completed,
                    BookingStatus::Cancelled => BookingEventKind::Cancelled,
                    BookingStatus::NoShow => BookingEventKind::NoShow,
                    _ => return,
                };
                if let Some(b) = cs.booking(id) {
                    self.notify.send(kind, b);
                }
            }
            Event::BookingRescheduled {
                id, replacement, ..
            } => {
                if let Some(b) = cs.booking(id) {
                    self.notify.send(BookingEventKind::Rescheduled, b);
                }
                if let Some(b) = cs.booking(&replacement.id) {
                    self.notify.send(BookingEventKind::Confirmed, b);
                }
            }
            _ => {}
        }
    }

    pub fn get_consultant(&self, id: &Ulid) -> Option<SharedConsultantState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn consultant_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    async fn read_consultant(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ConsultantState>, EngineError> {
        let rs = self
            .get_consultant(&id)
            .ok_or_else(|| EngineError::not_found("consultant", id))?;
        let guard = rs.read_owned().await;
        if guard.removed {
            return Err(EngineError::not_found("consultant", id));
        }
        Ok(guard)
    }

    async fn write_consultant(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ConsultantState>, EngineError> {
        let rs = self
            .get_consultant(&id)
            .ok_or_else(|| EngineError::not_found("consultant", id))?;
        let guard = rs.write_owned().await;
        if guard.removed {
            return Err(EngineError::not_found("consultant", id));
        }
        Ok(guard)
    }

    /// Lookup booking → consultant, acquire the consultant's write lock.
    async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ConsultantState>, EngineError> {
        let consultant_id = self
            .consultant_for_booking(booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        self.write_consultant(consultant_id).await
    }

    /// Compact the WAL into one snapshot record per schedule and per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;

        let consultants: Vec<SharedConsultantState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        // Read locks stay held until the swap, so no commit can land between
        // the snapshot and the rewrite.
        let mut guards = Vec::with_capacity(consultants.len());
        for rs in consultants {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for cs in guards.iter().filter(|g| !g.removed) {
            events.push(Event::ScheduleReplaced {
                schedule: cs.schedule.clone(),
            });
            for booking in &cs.bookings {
                events.push(Event::BookingRestored {
                    booking: booking.clone(),
                });
            }
            if !cs.dispatched.is_empty() {
                let mut keys: Vec<(Ulid, NotificationKind)> =
                    cs.dispatched.iter().copied().collect();
                keys.sort();
                events.push(Event::NotificationsDispatched {
                    consultant_id: cs.schedule.consultant_id,
                    keys,
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        tracing::info!("compacted WAL to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
