use std::time::Duration;

use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::ledger::TransitionMeta;
use super::{Engine, EngineError};

/// What the external calendar reports about one of our events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Moved { start: Ms, end: Ms },
    Deleted,
    /// The consultant marked the client absent in the calendar.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarChange {
    pub external_event_id: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The event id is not one of ours.
    Ignored,
    /// Nothing to do: terminal booking or unchanged time.
    NoOp(Booking),
    Cancelled(Booking),
    Rescheduled { old: Booking, new: Booking },
    /// The move collided with another booking; the ledger time stands.
    ReconciliationFlagged(Booking),
    AbsenceRecorded(Booking),
}

impl PullOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullOutcome::Ignored => "ignored",
            PullOutcome::NoOp(_) => "noop",
            PullOutcome::Cancelled(_) => "cancelled",
            PullOutcome::Rescheduled { .. } => "rescheduled",
            PullOutcome::ReconciliationFlagged(_) => "reconciliation",
            PullOutcome::AbsenceRecorded(_) => "absence_recorded",
        }
    }

    /// The booking the outcome is about (the replacement for a reschedule).
    pub fn booking(&self) -> Option<&Booking> {
        match self {
            PullOutcome::Ignored => None,
            PullOutcome::NoOp(b)
            | PullOutcome::Cancelled(b)
            | PullOutcome::ReconciliationFlagged(b)
            | PullOutcome::AbsenceRecorded(b) => Some(b),
            PullOutcome::Rescheduled { new, .. } => Some(new),
        }
    }
}

/// Exponential backoff for failed pushes: `base * 2^(attempts-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl SyncRetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: config.sync_backoff_base,
            max_delay: config.sync_backoff_max,
            max_attempts: config.max_sync_attempts,
        }
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Sync metadata after a failed push: one more attempt, flagged for a human
    /// once the attempts run out.
    pub fn after_failure(&self, current: &SyncStatus, error: String, now: Ms) -> SyncStatus {
        let attempts = current.attempts + 1;
        let mut sync = SyncStatus {
            state: SyncState::SyncFailed,
            attempts,
            last_attempt_at: Some(now),
            last_error: Some(error),
            ..current.clone()
        };
        if self.exhausted(attempts) && !sync.needs_reconciliation {
            sync.needs_reconciliation = true;
            sync.reconciliation_note = Some(format!(
                "calendar push failed {attempts} times: {}",
                sync.last_error.as_deref().unwrap_or_default()
            ));
        }
        sync
    }

    /// Whether a push may be attempted at `now`.
    pub fn is_due(&self, sync: &SyncStatus, now: Ms) -> bool {
        if self.exhausted(sync.attempts) {
            return false;
        }
        match sync.last_attempt_at {
            None => true,
            Some(at) => now >= at + self.delay_for(sync.attempts).as_millis() as Ms,
        }
    }
}

/// Sync metadata after a successful push. A reconciliation flag stays until a
/// human resolves it.
pub fn after_success(current: &SyncStatus, external_event_id: Option<String>, now: Ms) -> SyncStatus {
    SyncStatus {
        state: SyncState::Synced,
        external_event_id: external_event_id.or_else(|| current.external_event_id.clone()),
        attempts: 0,
        last_attempt_at: Some(now),
        last_error: None,
        ..current.clone()
    }
}

/// Fold a push result computed from `observed` into sync metadata that another
/// writer changed in the meantime. The other writer's reconciliation flag and
/// state win; the push never reports `synced` over a state it did not see.
fn merge_concurrent(current: &SyncStatus, observed: &SyncStatus, written: SyncStatus) -> SyncStatus {
    let state = match (current.state, written.state) {
        (SyncState::ExternalDeleted, _) => SyncState::ExternalDeleted,
        (_, SyncState::Synced) => SyncState::Unsynced,
        (_, state) => state,
    };
    let raised_here = written.needs_reconciliation && !observed.needs_reconciliation;
    let (needs_reconciliation, reconciliation_note) = if current.needs_reconciliation {
        (true, current.reconciliation_note.clone())
    } else if raised_here {
        (true, written.reconciliation_note)
    } else {
        (false, None)
    };
    SyncStatus {
        state,
        external_event_id: current.external_event_id.clone().or(written.external_event_id),
        attempts: if state == SyncState::Unsynced { 0 } else { written.attempts },
        last_attempt_at: written.last_attempt_at,
        last_error: written.last_error,
        needs_reconciliation,
        reconciliation_note,
    }
}

/// Whether the external calendar is behind the ledger for this booking.
pub fn push_pending(booking: &Booking) -> bool {
    let stale = matches!(booking.sync.state, SyncState::Unsynced | SyncState::SyncFailed);
    match booking.status {
        BookingStatus::Confirmed => stale,
        BookingStatus::Cancelled | BookingStatus::NoShow | BookingStatus::Rescheduled => {
            stale && booking.sync.external_event_id.is_some()
        }
        BookingStatus::Pending | BookingStatus::Completed => false,
    }
}

impl Engine {
    /// Apply a change reported by the external calendar.
    pub async fn pull_from_external(
        &self,
        change: CalendarChange,
    ) -> Result<PullOutcome, EngineError> {
        let Some(id) = self
            .external_index
            .get(&change.external_event_id)
            .map(|e| *e.value())
        else {
            tracing::debug!("ignoring change for unknown event {}", change.external_event_id);
            return Ok(PullOutcome::Ignored);
        };
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if booking.sync.external_event_id.as_deref() != Some(change.external_event_id.as_str()) {
            return Ok(PullOutcome::Ignored);
        }
        if booking.status.is_terminal() {
            return Ok(PullOutcome::NoOp(booking));
        }

        let meta = TransitionMeta::new(Actor::Calendar);
        match change.kind {
            ChangeKind::Deleted => {
                let cancelled = self
                    .transition_locked(
                        &mut guard,
                        id,
                        booking.version,
                        BookingStatus::Cancelled,
                        &meta.with_reason("deleted in external calendar"),
                    )
                    .await?;
                let sync = SyncStatus {
                    state: SyncState::ExternalDeleted,
                    last_attempt_at: Some(now_ms()),
                    ..cancelled.sync
                };
                let cancelled = self.record_sync_locked(&mut guard, id, sync).await?;
                Ok(PullOutcome::Cancelled(cancelled))
            }
            ChangeKind::Moved { start, end } => {
                if start == booking.start() && end == booking.end() {
                    return Ok(PullOutcome::NoOp(booking));
                }
                let span = Span { start, end };
                validate_span(&span)?;
                if span.duration_ms() % MINUTE_MS != 0 {
                    return Err(EngineError::validation(format!(
                        "calendar move to [{start}, {end}) is not a whole number of minutes"
                    )));
                }
                match self
                    .reschedule_locked(&mut guard, id, booking.version, span, &meta, true)
                    .await
                {
                    Ok((old, new)) => Ok(PullOutcome::Rescheduled { old, new }),
                    Err(EngineError::Conflict { blocking, .. }) => {
                        let note = match blocking {
                            Some(other) => format!(
                                "calendar moved event to [{start}, {end}), overlapping booking {other}; ledger time kept"
                            ),
                            None => format!(
                                "calendar moved event to [{start}, {end}), which conflicts; ledger time kept"
                            ),
                        };
                        tracing::warn!("booking {id} needs reconciliation: {note}");
                        let sync = SyncStatus {
                            state: SyncState::Unsynced,
                            attempts: 0,
                            last_error: None,
                            needs_reconciliation: true,
                            reconciliation_note: Some(note),
                            ..booking.sync
                        };
                        let flagged = self.record_sync_locked(&mut guard, id, sync).await?;
                        Ok(PullOutcome::ReconciliationFlagged(flagged))
                    }
                    Err(e) => Err(e),
                }
            }
            ChangeKind::Absent => {
                if !booking.absence_reported {
                    let event = Event::AbsenceReported {
                        id,
                        consultant_id: booking.consultant_id,
                    };
                    self.persist_and_apply(&mut guard, &event).await?;
                }
                let updated = guard
                    .booking(&id)
                    .cloned()
                    .ok_or_else(|| EngineError::not_found("booking", id))?;
                Ok(PullOutcome::AbsenceRecorded(updated))
            }
        }
    }

    /// Record the result of a push. `observed_version` and `observed` are the
    /// booking version and sync metadata the push acted on. If a transition
    /// landed meanwhile, a success is downgraded to `unsynced` so the next push
    /// sees the new status; if the sync metadata itself moved, the two are
    /// merged so a concurrent reconciliation flag survives.
    pub async fn record_sync(
        &self,
        id: Ulid,
        observed_version: u64,
        observed: &SyncStatus,
        mut sync: SyncStatus,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let (current_version, current_sync) = guard
            .booking(&id)
            .map(|b| (b.version, b.sync.clone()))
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if current_sync != *observed {
            sync = merge_concurrent(&current_sync, observed, sync);
        }
        if current_version != observed_version && sync.state == SyncState::Synced {
            sync.state = SyncState::Unsynced;
            sync.attempts = 0;
        }
        self.record_sync_locked(&mut guard, id, sync).await
    }

    async fn record_sync_locked(
        &self,
        cs: &mut ConsultantState,
        id: Ulid,
        sync: SyncStatus,
    ) -> Result<Booking, EngineError> {
        let event = Event::SyncRecorded {
            id,
            consultant_id: cs.schedule.consultant_id,
            sync,
        };
        self.persist_and_apply(cs, &event).await?;
        cs.booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// Clear a reconciliation flag once a human has looked at it.
    pub async fn resolve_reconciliation(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if !booking.sync.needs_reconciliation {
            return Ok(booking.clone());
        }
        let sync = SyncStatus {
            needs_reconciliation: false,
            reconciliation_note: None,
            attempts: 0,
            ..booking.sync.clone()
        };
        self.record_sync_locked(&mut guard, id, sync).await
    }

    pub async fn booking_by_external_event(
        &self,
        external_event_id: &str,
    ) -> Result<Booking, EngineError> {
        let id = self
            .external_index
            .get(external_event_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("external event", external_event_id))?;
        self.get_booking(id).await
    }

    /// Bookings whose push is due at `now` under the configured retry policy.
    /// Consultants without a calendar are skipped.
    pub async fn sync_backlog(&self, now: Ms) -> Vec<Booking> {
        let policy = SyncRetryPolicy::from_config(&self.config);
        let consultants: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut due = Vec::new();
        for rs in consultants {
            let cs = rs.read().await;
            if cs.removed || cs.schedule.calendar_id.is_none() {
                continue;
            }
            due.extend(
                cs.bookings
                    .iter()
                    .filter(|b| push_pending(b) && policy.is_due(&b.sync, now))
                    .cloned(),
            );
        }
        due.sort_by_key(|b| (b.span.start, b.id));
        due
    }

    /// Every booking flagged for human reconciliation.
    pub async fn needs_reconciliation(&self) -> Vec<Booking> {
        let consultants: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut flagged = Vec::new();
        for rs in consultants {
            let cs = rs.read().await;
            if cs.removed {
                continue;
            }
            flagged.extend(
                cs.bookings
                    .iter()
                    .filter(|b| b.sync.needs_reconciliation)
                    .cloned(),
            );
        }
        flagged.sort_by_key(|b| (b.span.start, b.id));
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SyncRetryPolicy {
        SyncRetryPolicy {
            base: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            max_attempts: 5,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::ZERO);
        assert_eq!(p.delay_for(1), Duration::from_secs(30));
        assert_eq!(p.delay_for(2), Duration::from_secs(60));
        assert_eq!(p.delay_for(4), Duration::from_secs(240));
        assert_eq!(p.delay_for(6), Duration::from_secs(600));
        assert_eq!(p.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn due_respects_backoff_and_attempt_cap() {
        let p = policy();
        let mut sync = SyncStatus {
            state: SyncState::SyncFailed,
            attempts: 2,
            last_attempt_at: Some(1_000_000),
            ..SyncStatus::default()
        };
        assert!(!p.is_due(&sync, 1_000_000 + 59_999));
        assert!(p.is_due(&sync, 1_000_000 + 60_000));
        sync.attempts = 5;
        assert!(!p.is_due(&sync, i64::MAX / 2));
        assert!(p.is_due(&SyncStatus::default(), 0));
    }

    #[test]
    fn failures_accumulate_until_flagged() {
        let p = SyncRetryPolicy {
            max_attempts: 2,
            ..policy()
        };
        let first = p.after_failure(&SyncStatus::default(), "timeout".into(), 10);
        assert_eq!(first.state, SyncState::SyncFailed);
        assert_eq!(first.attempts, 1);
        assert!(!first.needs_reconciliation);

        let second = p.after_failure(&first, "timeout".into(), 20);
        assert_eq!(second.attempts, 2);
        assert!(second.needs_reconciliation);
        assert_eq!(
            second.reconciliation_note.as_deref(),
            Some("calendar push failed 2 times: timeout")
        );

        let ok = after_success(&second, Some("evt-3".into()), 30);
        assert_eq!(ok.state, SyncState::Synced);
        assert_eq!(ok.attempts, 0);
        assert_eq!(ok.last_error, None);
        assert_eq!(ok.external_event_id.as_deref(), Some("evt-3"));
        assert!(ok.needs_reconciliation);
    }

    #[test]
    fn concurrent_flag_survives_a_stale_push_result() {
        let observed = SyncStatus {
            external_event_id: Some("evt-1".into()),
            ..SyncStatus::default()
        };
        let flagged = SyncStatus {
            needs_reconciliation: true,
            reconciliation_note: Some("moved over another booking".into()),
            ..observed.clone()
        };
        let merged = merge_concurrent(&flagged, &observed, after_success(&observed, None, 50));
        assert_eq!(merged.state, SyncState::Unsynced);
        assert!(merged.needs_reconciliation);
        assert_eq!(merged.reconciliation_note, flagged.reconciliation_note);
        assert_eq!(merged.external_event_id.as_deref(), Some("evt-1"));

        // A flag cleared by a human meanwhile is not brought back.
        let resolved = observed.clone();
        let stale = SyncStatus {
            state: SyncState::Unsynced,
            ..flagged.clone()
        };
        let merged = merge_concurrent(&resolved, &stale, after_success(&stale, None, 60));
        assert!(!merged.needs_reconciliation);
        assert_eq!(merged.reconciliation_note, None);

        let deleted = SyncStatus {
            state: SyncState::ExternalDeleted,
            ..observed.clone()
        };
        let merged = merge_concurrent(&deleted, &observed, after_success(&observed, None, 70));
        assert_eq!(merged.state, SyncState::ExternalDeleted);
    }

    #[test]
    fn pending_push_depends_on_status() {
        let id = Ulid::new();
        let mut b = Booking {
            id,
            reference: Booking::reference_for(id),
            consultant_id: Ulid::new(),
            span: Span::new(0, 30 * MINUTE_MS),
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
        };
        assert!(push_pending(&b));
        b.sync.state = SyncState::Synced;
        assert!(!push_pending(&b));

        // Cancelled without an external event: nothing to delete.
        b.status = BookingStatus::Cancelled;
        b.sync.state = SyncState::Unsynced;
        assert!(!push_pending(&b));
        b.sync.external_event_id = Some("evt-1".into());
        assert!(push_pending(&b));
        b.sync.state = SyncState::ExternalDeleted;
        assert!(!push_pending(&b));
    }
}
