mod memory;

pub use memory::MemoryCalendar;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, SyncRetryPolicy, after_success, push_pending};
use crate::model::*;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar unavailable: {0}")]
    Unavailable(String),
    #[error("event {0} not found")]
    NotFound(String),
    #[error("calendar rejected request: {0}")]
    Rejected(String),
}

/// The fields the engine writes into an external event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    /// Idempotency key stored in the event's custom field.
    pub booking_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub summary: String,
    pub description: String,
}

impl EventDraft {
    fn for_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            start: booking.start(),
            end: booking.end(),
            summary: format!("{} ({})", booking.client.name, booking.reference),
            description: booking.client.notes.clone().unwrap_or_default(),
        }
    }
}

/// An event as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub event_id: String,
    pub booking_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub summary: String,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Look an event up by the booking id in its custom field.
    async fn find_event(
        &self,
        calendar_id: &str,
        booking_id: Ulid,
    ) -> Result<Option<ExternalEvent>, CalendarError>;

    /// Returns the new event id.
    async fn create_event(
        &self,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<String, CalendarError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<(), CalendarError>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), CalendarError>;

    /// Busy spans inside `window`, for admins checking external commitments.
    async fn free_busy(&self, calendar_id: &str, window: Span) -> Result<Vec<Span>, CalendarError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created(String),
    Updated(String),
    Deleted,
    NoCalendar,
    NothingToDo,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Created(_) => "created",
            SyncOutcome::Updated(_) => "updated",
            SyncOutcome::Deleted => "deleted",
            SyncOutcome::NoCalendar => "no_calendar",
            SyncOutcome::NothingToDo => "nothing_to_do",
        }
    }
}

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Pushes ledger state out to the consultant's external calendar.
pub struct CalendarSync {
    engine: Arc<Engine>,
    provider: Arc<dyn CalendarProvider>,
    policy: SyncRetryPolicy,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl CalendarSync {
    pub fn new(engine: Arc<Engine>, provider: Arc<dyn CalendarProvider>) -> Self {
        let policy = SyncRetryPolicy::from_config(&engine.config);
        Self {
            engine,
            provider,
            policy,
            locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bring the external event in line with the booking. A provider failure is
    /// recorded in the booking's sync metadata and returned as `EngineError::Sync`;
    /// the booking status itself is never touched.
    pub async fn push_to_external(&self, booking_id: Ulid) -> Result<SyncOutcome, EngineError> {
        let lock = self.locks.entry(booking_id).or_default().clone();
        let result = {
            let _serialized = lock.lock().await;
            self.push_serialized(booking_id).await
        };
        drop(lock);
        // Only the map still holds it: no push is running or waiting.
        self.locks
            .remove_if(&booking_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn push_serialized(&self, booking_id: Ulid) -> Result<SyncOutcome, EngineError> {
        let booking = self.engine.get_booking(booking_id).await?;
        let schedule = self.engine.get_schedule(booking.consultant_id).await?;
        let Some(calendar_id) = schedule.calendar_id.as_deref() else {
            return Ok(SyncOutcome::NoCalendar);
        };
        if !push_pending(&booking) {
            return Ok(SyncOutcome::NothingToDo);
        }

        let result = match booking.status {
            BookingStatus::Confirmed => self.upsert(calendar_id, &booking).await,
            _ => self.delete(calendar_id, &booking).await,
        };

        match result {
            Ok((event_id, outcome)) => {
                let sync = after_success(&booking.sync, event_id, now_ms());
                self.engine
                    .record_sync(booking_id, booking.version, &booking.sync, sync)
                    .await?;
                metrics::counter!(crate::observability::SYNC_PUSHES_TOTAL, "outcome" => outcome.as_str())
                    .increment(1);
                tracing::debug!("pushed booking {booking_id}: {}", outcome.as_str());
                Ok(outcome)
            }
            Err(e) => {
                let sync = self.policy.after_failure(&booking.sync, e.to_string(), now_ms());
                tracing::warn!(
                    "calendar push for booking {booking_id} failed (attempt {}): {e}",
                    sync.attempts
                );
                if sync.needs_reconciliation && !booking.sync.needs_reconciliation {
                    tracing::warn!("booking {booking_id} flagged for reconciliation");
                }
                self.engine
                    .record_sync(booking_id, booking.version, &booking.sync, sync)
                    .await?;
                metrics::counter!(crate::observability::SYNC_PUSHES_TOTAL, "outcome" => "failed")
                    .increment(1);
                Err(EngineError::Sync(e.to_string()))
            }
        }
    }

    /// Create or update; a push without a known event id looks the booking up
    /// first so a retried create never duplicates.
    async fn upsert(
        &self,
        calendar_id: &str,
        booking: &Booking,
    ) -> Result<(Option<String>, SyncOutcome), CalendarError> {
        let draft = EventDraft::for_booking(booking);
        let known = match &booking.sync.external_event_id {
            Some(id) => Some(id.clone()),
            None => self
                .provider
                .find_event(calendar_id, booking.id)
                .await?
                .map(|e| e.event_id),
        };
        if let Some(event_id) = known {
            match self.provider.update_event(calendar_id, &event_id, &draft).await {
                Ok(()) => return Ok((Some(event_id.clone()), SyncOutcome::Updated(event_id))),
                Err(CalendarError::NotFound(_)) => {
                    tracing::debug!("event {event_id} vanished, recreating for {}", booking.id);
                }
                Err(e) => return Err(e),
            }
        }
        let event_id = self.provider.create_event(calendar_id, &draft).await?;
        Ok((Some(event_id.clone()), SyncOutcome::Created(event_id)))
    }

    /// Delete the event of a booking that no longer holds time. A missing
    /// event counts as success.
    async fn delete(
        &self,
        calendar_id: &str,
        booking: &Booking,
    ) -> Result<(Option<String>, SyncOutcome), CalendarError> {
        let known = match &booking.sync.external_event_id {
            Some(id) => Some(id.clone()),
            None => self
                .provider
                .find_event(calendar_id, booking.id)
                .await?
                .map(|e| e.event_id),
        };
        if let Some(event_id) = &known {
            match self.provider.delete_event(calendar_id, event_id).await {
                Ok(()) | Err(CalendarError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok((known, SyncOutcome::Deleted))
    }

    /// Push every booking whose retry is due at `now`. Returns how many pushes
    /// succeeded.
    pub async fn retry_due(&self, now: Ms) -> usize {
        let mut pushed = 0;
        for booking in self.engine.sync_backlog(now).await {
            match self.push_to_external(booking.id).await {
                Ok(_) => pushed += 1,
                Err(e) => tracing::debug!("retry of booking {} failed: {e}", booking.id),
            }
        }
        pushed
    }

    pub async fn free_busy(&self, consultant_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        let schedule = self.engine.get_schedule(consultant_id).await?;
        let Some(calendar_id) = schedule.calendar_id.as_deref() else {
            return Ok(Vec::new());
        };
        self.provider
            .free_busy(calendar_id, window)
            .await
            .map_err(|e| EngineError::Sync(e.to_string()))
    }
}

/// Run the adapter in-process: every lifecycle event triggers a push, and
/// failed pushes are retried on the backoff schedule.
pub fn spawn_push_worker(sync: Arc<CalendarSync>) -> JoinHandle<()> {
    let mut events = sync.engine.notify.subscribe_all();
    let mut retry = tokio::time::interval(sync.policy.base.max(Duration::from_secs(1)));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        let id = event.booking.id;
                        if let Err(e) = sync.push_to_external(id).await {
                            tracing::debug!("push for booking {id} deferred: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("push worker lagged by {skipped} events, sweeping backlog");
                        sync.retry_due(now_ms()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = retry.tick() => {
                    sync.retry_due(now_ms()).await;
                }
            }
        }
    })
}
