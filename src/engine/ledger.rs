use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// Who is asking for a transition and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionMeta {
    pub actor: Actor,
    pub reason: Option<String>,
}

impl TransitionMeta {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Version and state-machine checks shared by every status mutation.
/// Returns the history entry the transition will append.
pub(super) fn check_transition(
    booking: &Booking,
    expected_version: u64,
    to: BookingStatus,
    meta: &TransitionMeta,
    at: Ms,
) -> Result<StatusChange, EngineError> {
    if booking.version != expected_version {
        return Err(EngineError::VersionConflict {
            id: booking.id,
            expected: expected_version,
            actual: booking.version,
        });
    }
    if !booking.status.can_transition_to(to) {
        tracing::error!(
            "invalid transition for booking {}: {} -> {to}",
            booking.id,
            booking.status
        );
        return Err(EngineError::InvalidTransition {
            id: booking.id,
            from: booking.status,
            to,
        });
    }
    if matches!(to, BookingStatus::Completed | BookingStatus::NoShow) && at < booking.end() {
        return Err(EngineError::validation(format!(
            "booking {} cannot become {to} before its scheduled end",
            booking.id
        )));
    }
    Ok(StatusChange {
        from: Some(booking.status),
        to,
        version: booking.version + 1,
        at,
        actor: meta.actor,
        reason: meta.reason.clone(),
    })
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let consultant_id = self
            .consultant_for_booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let guard = self.read_consultant(consultant_id).await?;
        guard
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    pub async fn get_booking_by_reference(&self, reference: &str) -> Result<Booking, EngineError> {
        let id = self
            .reference_index
            .get(reference)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("booking reference", reference))?;
        self.get_booking(id).await
    }

    /// Every booking of a consultant, optionally restricted to those overlapping `range`.
    pub async fn list_bookings(
        &self,
        consultant_id: Ulid,
        range: Option<Span>,
    ) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_consultant(consultant_id).await?;
        Ok(match range {
            Some(range) => guard.overlapping(&range).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    /// Optimistically-versioned status transition.
    ///
    /// `confirmed`, `pending` and `rescheduled` targets belong to the resolver
    /// and are rejected here.
    pub async fn transition(
        &self,
        id: Ulid,
        expected_version: u64,
        to: BookingStatus,
        meta: TransitionMeta,
    ) -> Result<Booking, EngineError> {
        if matches!(
            to,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Rescheduled
        ) {
            let from = self.get_booking(id).await?.status;
            tracing::error!("invalid transition for booking {id}: {from} -> {to} (resolver only)");
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        let mut guard = self.resolve_booking_write(&id).await?;
        self.transition_locked(&mut guard, id, expected_version, to, &meta)
            .await
    }

    /// Transition with the consultant's write lock already held.
    pub(super) async fn transition_locked(
        &self,
        cs: &mut ConsultantState,
        id: Ulid,
        expected_version: u64,
        to: BookingStatus,
        meta: &TransitionMeta,
    ) -> Result<Booking, EngineError> {
        let booking = cs
            .booking(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let change = check_transition(booking, expected_version, to, meta, now_ms())?;
        let event = Event::BookingTransitioned {
            id,
            consultant_id: cs.schedule.consultant_id,
            change,
        };
        self.persist_and_apply(cs, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => to.as_str())
            .increment(1);
        tracing::debug!("booking {id} -> {to} by {}", meta.actor.as_str());
        cs.booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }
}
