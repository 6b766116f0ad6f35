use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{booking_span, check_no_conflict, now_ms};
use super::error::ConflictReason;
use super::ledger::{TransitionMeta, check_transition};
use super::slots::{parse_timezone, schedule_fits};
use super::{Engine, EngineError};

/// A request to put a new booking into `confirmed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen id for idempotent retries; generated when absent.
    pub id: Option<Ulid>,
    pub consultant_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub client: ClientContact,
    /// `Client` requests must also fit the schedule; `Admin`/`Calendar` only
    /// have to be conflict-free.
    pub origin: Actor,
}

fn validate_client(client: &ClientContact) -> Result<(), EngineError> {
    if client.name.trim().is_empty() {
        return Err(EngineError::validation("client name is required"));
    }
    if client.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("client name too long"));
    }
    let email = client.email.trim();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("client email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => return Err(EngineError::validation(format!("invalid email: {email}"))),
    }
    if let Some(phone) = &client.phone
        && phone.len() > MAX_LABEL_LEN
    {
        return Err(EngineError::LimitExceeded("client phone too long"));
    }
    if let Some(notes) = &client.notes
        && notes.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    parse_timezone(&client.timezone)?;
    Ok(())
}

/// A freshly committed booking: history records the pending and confirmed steps.
fn new_booking(
    id: Ulid,
    consultant_id: Ulid,
    span: Span,
    duration_minutes: u32,
    client: ClientContact,
    actor: Actor,
    supersedes: Option<Ulid>,
    now: Ms,
) -> Booking {
    Booking {
        id,
        reference: Booking::reference_for(id),
        consultant_id,
        span,
        duration_minutes,
        client,
        status: BookingStatus::Confirmed,
        version: 1,
        supersedes,
        superseded_by: None,
        created_at: now,
        confirmed_at: now,
        sync: SyncStatus::default(),
        absence_reported: false,
        history: vec![
            StatusChange {
                from: None,
                to: BookingStatus::Pending,
                version: 0,
                at: now,
                actor,
                reason: None,
            },
            StatusChange {
                from: Some(BookingStatus::Pending),
                to: BookingStatus::Confirmed,
                version: 1,
                at: now,
                actor,
                reason: None,
            },
        ],
    }
}

impl Engine {
    /// Acquire the consultant's write lock within `commit_timeout`.
    async fn lock_for_commit(
        &self,
        consultant_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ConsultantState>, EngineError> {
        let rs = self
            .get_consultant(&consultant_id)
            .ok_or_else(|| EngineError::not_found("consultant", consultant_id))?;
        let guard = tokio::time::timeout(self.config.commit_timeout, rs.write_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "timeout")
                    .increment(1);
                tracing::debug!("commit lock timeout for consultant {consultant_id}");
                EngineError::Conflict {
                    consultant_id,
                    reason: ConflictReason::Timeout,
                    blocking: None,
                }
            })?;
        if guard.removed {
            return Err(EngineError::not_found("consultant", consultant_id));
        }
        Ok(guard)
    }

    /// Pick an id whose reference is not taken yet.
    fn fresh_booking_id(&self, requested: Option<Ulid>) -> Result<Ulid, EngineError> {
        if let Some(id) = requested {
            if self.booking_index.contains_key(&id)
                || self.reference_index.contains_key(&Booking::reference_for(id))
            {
                return Err(EngineError::AlreadyExists(id));
            }
            return Ok(id);
        }
        loop {
            let id = Ulid::new();
            if !self.reference_index.contains_key(&Booking::reference_for(id)) {
                return Ok(id);
            }
        }
    }

    /// The only way a booking becomes `confirmed`. Check and insert happen under
    /// one exclusive lock: the first writer wins, the loser sees `slot_taken`.
    pub async fn commit_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        self.validate_duration(req.duration_minutes)?;
        let span = booking_span(req.start, req.duration_minutes)?;
        validate_client(&req.client)?;

        let mut guard = self.lock_for_commit(req.consultant_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CONSULTANT {
            return Err(EngineError::LimitExceeded("too many bookings for consultant"));
        }
        let id = self.fresh_booking_id(req.id)?;
        let now = now_ms();
        if req.origin == Actor::Client {
            schedule_fits(&guard.schedule, &span, now)?;
        }
        if let Err(e) = check_no_conflict(&guard, &span, None) {
            metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "slot_taken")
                .increment(1);
            tracing::debug!("commit rejected for consultant {}: {e}", req.consultant_id);
            return Err(e);
        }

        let booking = new_booking(
            id,
            req.consultant_id,
            span,
            req.duration_minutes,
            req.client,
            req.origin,
            None,
            now,
        );
        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "confirmed")
            .increment(1);
        Ok(booking)
    }

    pub async fn cancel_booking(
        &self,
        id: Ulid,
        expected_version: u64,
        meta: TransitionMeta,
    ) -> Result<Booking, EngineError> {
        self.transition(id, expected_version, BookingStatus::Cancelled, meta)
            .await
    }

    /// Move a booking: the old one becomes `rescheduled` and a replacement with
    /// `supersedes = old.id` is confirmed, as one WAL record. The new time is
    /// checked for conflicts ignoring the booking being replaced.
    /// Returns `(old, replacement)`.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        expected_version: u64,
        new_start: Ms,
        new_duration_minutes: u32,
        meta: TransitionMeta,
    ) -> Result<(Booking, Booking), EngineError> {
        self.validate_duration(new_duration_minutes)?;
        let span = booking_span(new_start, new_duration_minutes)?;
        let consultant_id = self
            .consultant_for_booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let mut guard = self.lock_for_commit(consultant_id).await?;
        self.reschedule_locked(&mut guard, id, expected_version, span, &meta, false)
            .await
    }

    /// Reschedule with the lock held. `carry_external` hands the old booking's
    /// calendar event to the replacement (the calendar already moved it).
    pub(super) async fn reschedule_locked(
        &self,
        cs: &mut ConsultantState,
        id: Ulid,
        expected_version: u64,
        span: Span,
        meta: &TransitionMeta,
        carry_external: bool,
    ) -> Result<(Booking, Booking), EngineError> {
        let now = now_ms();
        let old = cs
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let change = check_transition(old, expected_version, BookingStatus::Rescheduled, meta, now)?;
        if meta.actor == Actor::Client {
            schedule_fits(&cs.schedule, &span, now)?;
        }
        if let Err(e) = check_no_conflict(cs, &span, Some(id)) {
            metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "slot_taken")
                .increment(1);
            tracing::debug!("reschedule of {id} rejected: {e}");
            return Err(e);
        }

        let duration_minutes = (span.duration_ms() / MINUTE_MS) as u32;
        let mut replacement = new_booking(
            self.fresh_booking_id(None)?,
            old.consultant_id,
            span,
            duration_minutes,
            old.client.clone(),
            meta.actor,
            Some(id),
            now,
        );
        if carry_external && old.sync.external_event_id.is_some() {
            replacement.sync = SyncStatus {
                state: SyncState::Synced,
                external_event_id: old.sync.external_event_id.clone(),
                last_attempt_at: Some(now),
                ..SyncStatus::default()
            };
        }

        let event = Event::BookingRescheduled {
            id,
            consultant_id: cs.schedule.consultant_id,
            change,
            replacement: replacement.clone(),
        };
        self.persist_and_apply(cs, &event).await?;
        metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "confirmed")
            .increment(1);
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => "rescheduled")
            .increment(1);

        let old = cs
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        Ok((old, replacement))
    }

    /// Manual admin flag. The ledger refuses it before the scheduled end.
    pub async fn mark_no_show(
        &self,
        id: Ulid,
        expected_version: u64,
        meta: TransitionMeta,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        self.transition_locked(&mut guard, id, expected_version, BookingStatus::NoShow, &meta)
            .await
    }
}
