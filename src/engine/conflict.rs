use ulid::Ulid;

use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Rejects instants outside the supported range before any arithmetic on them.
pub(crate) fn validate_instant(at: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `[start, start + duration)`, validated.
pub(crate) fn booking_span(start: Ms, duration_minutes: u32) -> Result<Span, EngineError> {
    validate_instant(start)?;
    let end = (duration_minutes as Ms)
        .checked_mul(MINUTE_MS)
        .and_then(|d| start.checked_add(d))
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    let span = Span { start, end };
    validate_span(&span)?;
    Ok(span)
}

/// A candidate `[s, e)` conflicts with a time-holding booking `[bs, be)` iff it
/// intersects `[bs - buffer, be + buffer)`. Only the existing booking is widened,
/// by the consultant's single buffer, not both ranges: a 10:00-11:00 booking with
/// a 15-minute buffer blocks candidates that start before 11:15 or end after
/// 09:45, and nothing wider. Equivalently, the candidate widened by the buffer
/// intersects the booking itself, which is what we search for.
pub(crate) fn check_no_conflict(
    state: &ConsultantState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let buffer = state.schedule.buffer_ms();
    let search = span.expand(buffer);
    if let Some(existing) = state
        .occupying(&search)
        .find(|b| Some(b.id) != exclude)
    {
        return Err(EngineError::Conflict {
            consultant_id: state.schedule.consultant_id,
            reason: ConflictReason::SlotTaken,
            blocking: Some(existing.id),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;
    const H: Ms = HOUR_MS;

    fn state_with(buffer_minutes: u32, booked: Span) -> ConsultantState {
        let cid = Ulid::new();
        let mut schedule = ConsultantSchedule::new(cid, "UTC");
        schedule.buffer_minutes = buffer_minutes;
        let mut cs = ConsultantState::new(schedule);
        let id = Ulid::new();
        cs.insert_booking(Booking {
            id,
            reference: Booking::reference_for(id),
            consultant_id: cid,
            span: booked,
            duration_minutes: (booked.duration_ms() / M) as u32,
            client: ClientContact {
                name: "Lin".into(),
                email: "lin@example.com".into(),
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
        });
        cs
    }

    #[test]
    fn buffer_gap_is_enforced_on_both_sides() {
        // 10:00-11:00 with a 15 minute buffer.
        let cs = state_with(15, Span::new(10 * H, 11 * H));
        let blocked = [
            Span::new(11 * H, 12 * H),
            Span::new(11 * H + 14 * M, 12 * H),
            Span::new(9 * H, 9 * H + 46 * M),
            Span::new(10 * H + 15 * M, 10 * H + 45 * M),
        ];
        for span in blocked {
            assert!(check_no_conflict(&cs, &span, None).is_err(), "{span:?}");
        }
        let allowed = [
            Span::new(11 * H + 15 * M, 12 * H + 15 * M),
            Span::new(8 * H + 45 * M, 9 * H + 45 * M),
        ];
        for span in allowed {
            assert!(check_no_conflict(&cs, &span, None).is_ok(), "{span:?}");
        }
    }

    #[test]
    fn conflict_names_the_blocking_booking() {
        let cs = state_with(0, Span::new(10 * H, 11 * H));
        let held = cs.bookings[0].id;
        match check_no_conflict(&cs, &Span::new(10 * H, 11 * H), None) {
            Err(EngineError::Conflict {
                reason: ConflictReason::SlotTaken,
                blocking,
                ..
            }) => assert_eq!(blocking, Some(held)),
            other => panic!("expected slot_taken, got {other:?}"),
        }
        assert!(check_no_conflict(&cs, &Span::new(10 * H, 11 * H), Some(held)).is_ok());
    }

    #[test]
    fn span_validation() {
        let ok = Span {
            start: crate::limits::MIN_VALID_TIMESTAMP_MS + H,
            end: crate::limits::MIN_VALID_TIMESTAMP_MS + 2 * H,
        };
        assert!(validate_span(&ok).is_ok());
        let inverted = Span {
            start: ok.end,
            end: ok.start,
        };
        assert!(matches!(
            validate_span(&inverted),
            Err(EngineError::Validation(_))
        ));
        let ancient = Span { start: 0, end: H };
        assert!(matches!(
            validate_span(&ancient),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
