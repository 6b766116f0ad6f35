use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;

use super::conflict::now_ms;
use super::ledger::TransitionMeta;
use super::{Engine, EngineError};

/// Render an instant as local wall-clock time in `tz`, falling back to UTC.
fn local_time(at: Ms, tz: &str) -> String {
    let Some(utc) = Utc.timestamp_millis_opt(at).single() else {
        return at.to_string();
    };
    match tz.parse::<Tz>() {
        Ok(tz) => utc.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
        Err(_) => utc.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}

fn job(
    booking: &Booking,
    schedule: &ConsultantSchedule,
    kind: NotificationKind,
    due_at: Ms,
) -> NotificationJob {
    let tz = booking.client.timezone.as_str();
    let mut payload = json!({
        "kind": kind.label(),
        "reference": booking.reference,
        "client_name": booking.client.name,
        "consultant_id": booking.consultant_id.to_string(),
        "consultant_name": schedule.display_name,
        "start": booking.start(),
        "end": booking.end(),
        "start_local": local_time(booking.start(), tz),
        "end_local": local_time(booking.end(), tz),
        "timezone": tz,
        "duration_minutes": booking.duration_minutes,
    });
    if let Some(replacement) = booking.superseded_by {
        payload["replacement_id"] = json!(replacement.to_string());
    }
    NotificationJob {
        booking_id: booking.id,
        reference: booking.reference.clone(),
        consultant_id: booking.consultant_id,
        kind,
        recipient: booking.client.email.clone(),
        due_at,
        payload,
    }
}

/// When the booking entered its current status.
fn status_changed_at(booking: &Booking) -> Ms {
    booking
        .history
        .last()
        .map_or(booking.confirmed_at, |change| change.at)
}

/// Jobs for one consultant due at `as_of` that have not been dispatched yet.
fn due_for_consultant(cs: &ConsultantState, as_of: Ms, config: &EngineConfig) -> Vec<NotificationJob> {
    let mut jobs = Vec::new();
    let mut push = |booking: &Booking, kind: NotificationKind, due_at: Ms| {
        if due_at <= as_of && !cs.dispatched.contains(&(booking.id, kind)) {
            jobs.push(job(booking, &cs.schedule, kind, due_at));
        }
    };
    for booking in &cs.bookings {
        match booking.status {
            BookingStatus::Confirmed => {
                push(booking, NotificationKind::Confirmation, booking.confirmed_at);
                if as_of >= booking.start() {
                    continue;
                }
                for &minutes_before in &config.reminder_offsets_minutes {
                    let boundary = booking.start() - minutes_before as Ms * MINUTE_MS;
                    // A booking made inside the offset never gets that reminder.
                    if boundary > booking.confirmed_at {
                        push(booking, NotificationKind::Reminder { minutes_before }, boundary);
                    }
                }
            }
            BookingStatus::Completed => {
                // Confirmed and ended between two passes: the confirmation is still owed.
                push(booking, NotificationKind::Confirmation, booking.confirmed_at);
                let due_at = booking.end() + config.follow_up_after_minutes as Ms * MINUTE_MS;
                push(booking, NotificationKind::FollowUp, due_at);
            }
            BookingStatus::NoShow => {
                push(booking, NotificationKind::Confirmation, booking.confirmed_at);
            }
            BookingStatus::Cancelled => {
                push(booking, NotificationKind::Cancellation, status_changed_at(booking));
            }
            BookingStatus::Rescheduled => {
                push(booking, NotificationKind::Reschedule, status_changed_at(booking));
            }
            BookingStatus::Pending => {}
        }
    }
    jobs
}

impl Engine {
    /// Pure read: every job due at `as_of` that has not been dispatched.
    pub async fn due_notifications(&self, as_of: Ms) -> Vec<NotificationJob> {
        let consultants: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut jobs = Vec::new();
        for rs in consultants {
            let cs = rs.read().await;
            if cs.removed {
                continue;
            }
            jobs.extend(due_for_consultant(&cs, as_of, &self.config));
        }
        jobs.sort_by_key(|j| (j.due_at, j.booking_id));
        jobs
    }

    /// The batch pass an external scheduler triggers: close out bookings whose
    /// end has passed, then hand out the due jobs exactly once.
    pub async fn run_notification_pass(
        &self,
        as_of: Ms,
    ) -> Result<Vec<NotificationJob>, EngineError> {
        self.close_out_ended(as_of).await?;

        let consultants: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut jobs = Vec::new();
        for consultant_id in consultants {
            let mut guard = match self.write_consultant(consultant_id).await {
                Ok(guard) => guard,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let due = due_for_consultant(&guard, as_of, &self.config);
            if due.is_empty() {
                continue;
            }
            let event = Event::NotificationsDispatched {
                consultant_id,
                keys: due.iter().map(NotificationJob::dedup_key).collect(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            jobs.extend(due);
        }

        for j in &jobs {
            metrics::counter!(crate::observability::NOTIFICATION_JOBS_TOTAL, "kind" => j.kind.label())
                .increment(1);
        }
        jobs.sort_by_key(|j| (j.due_at, j.booking_id));
        if !jobs.is_empty() {
            tracing::info!("notification pass at {as_of}: {} jobs", jobs.len());
        }
        Ok(jobs)
    }

    /// Confirmed bookings whose end is at or before `as_of` become `completed`,
    /// or `no_show` when the calendar reported the client absent. Another
    /// instance getting there first is not an error. A future `as_of` never
    /// closes out a booking whose end has not actually passed.
    async fn close_out_ended(&self, as_of: Ms) -> Result<(), EngineError> {
        let cutoff = as_of.min(now_ms());
        let consultants: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut ended = Vec::new();
        for rs in consultants {
            let cs = rs.read().await;
            if cs.removed {
                continue;
            }
            ended.extend(
                cs.bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed && b.end() <= cutoff)
                    .map(|b| (b.id, b.version, b.absence_reported)),
            );
        }

        for (id, version, absent) in ended {
            let to = if absent {
                BookingStatus::NoShow
            } else {
                BookingStatus::Completed
            };
            let meta = TransitionMeta::new(Actor::Scheduler).with_reason("scheduled end passed");
            match self.transition(id, version, to, meta).await {
                Ok(_) => {}
                Err(
                    EngineError::VersionConflict { .. }
                    | EngineError::InvalidTransition { .. }
                    | EngineError::NotFound(_),
                ) => {
                    tracing::debug!("booking {id} already closed out elsewhere");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(booking: Booking) -> ConsultantState {
        let mut cs = ConsultantState::new(ConsultantSchedule::new(booking.consultant_id, "UTC"));
        cs.insert_booking(booking);
        cs
    }

    fn booking(start: Ms, confirmed_at: Ms) -> Booking {
        let id = Ulid::new();
        Booking {
            id,
            reference: Booking::reference_for(id),
            consultant_id: Ulid::new(),
            span: Span::new(start, start + 60 * MINUTE_MS),
            duration_minutes: 60,
            client: ClientContact {
                name: "Lena".into(),
                email: "lena@example.com".into(),
                phone: None,
                timezone: "Europe/Berlin".into(),
                notes: None,
            },
            status: BookingStatus::Confirmed,
            version: 1,
            supersedes: None,
            superseded_by: None,
            created_at: confirmed_at,
            confirmed_at,
            sync: SyncStatus::default(),
            absence_reported: false,
            history: Vec::new(),
        }
    }

    const START: Ms = 1_767_261_600_000; // 2026-01-01T10:00:00Z

    fn kinds(jobs: &[NotificationJob]) -> Vec<String> {
        jobs.iter().map(|j| j.kind.label()).collect()
    }

    #[test]
    fn booking_made_three_hours_out_skips_day_reminder() {
        let b = booking(START, START - 3 * HOUR_MS);
        let cs = state_with(b);
        let config = EngineConfig::default();

        let jobs = due_for_consultant(&cs, START - 2 * HOUR_MS, &config);
        assert_eq!(kinds(&jobs), vec!["confirmation", "reminder_2h"]);
        let jobs = due_for_consultant(&cs, START - 150 * MINUTE_MS, &config);
        assert_eq!(kinds(&jobs), vec!["confirmation"]);
    }

    #[test]
    fn both_reminders_for_early_booking() {
        let b = booking(START, START - 7 * DAY_MS);
        let cs = state_with(b);
        let jobs = due_for_consultant(&cs, START - HOUR_MS, &EngineConfig::default());
        assert_eq!(kinds(&jobs), vec!["confirmation", "reminder_24h", "reminder_2h"]);
        // Past the start, reminders are no longer due.
        let jobs = due_for_consultant(&cs, START + MINUTE_MS, &EngineConfig::default());
        assert_eq!(kinds(&jobs), vec!["confirmation"]);
    }

    #[test]
    fn dispatched_keys_are_skipped() {
        let b = booking(START, START - 7 * DAY_MS);
        let id = b.id;
        let mut cs = state_with(b);
        cs.dispatched.insert((id, NotificationKind::Confirmation));
        let jobs = due_for_consultant(&cs, START - HOUR_MS, &EngineConfig::default());
        assert_eq!(kinds(&jobs), vec!["reminder_24h", "reminder_2h"]);
    }

    #[test]
    fn follow_up_waits_for_offset() {
        let mut b = booking(START, START - 7 * DAY_MS);
        b.status = BookingStatus::Completed;
        let end = b.end();
        let id = b.id;
        let mut cs = state_with(b);
        cs.dispatched.insert((id, NotificationKind::Confirmation));
        let config = EngineConfig::default();
        assert!(due_for_consultant(&cs, end + HOUR_MS, &config).is_empty());
        let jobs = due_for_consultant(&cs, end + DAY_MS, &config);
        assert_eq!(kinds(&jobs), vec!["follow_up"]);
        assert_eq!(jobs[0].due_at, end + DAY_MS);
    }

    #[test]
    fn ended_booking_still_owes_its_confirmation() {
        let mut b = booking(START, START - HOUR_MS);
        b.status = BookingStatus::Completed;
        let end = b.end();
        let cs = state_with(b);
        let jobs = due_for_consultant(&cs, end + DAY_MS, &EngineConfig::default());
        assert_eq!(kinds(&jobs), vec!["confirmation", "follow_up"]);

        let mut absent = booking(START, START - HOUR_MS);
        absent.status = BookingStatus::NoShow;
        let cs = state_with(absent);
        let jobs = due_for_consultant(&cs, end, &EngineConfig::default());
        assert_eq!(kinds(&jobs), vec!["confirmation"]);
    }

    #[test]
    fn payload_renders_client_local_time() {
        let b = booking(START, START - DAY_MS);
        let cs = state_with(b);
        let jobs = due_for_consultant(&cs, START, &EngineConfig::default());
        let payload = &jobs[0].payload;
        assert_eq!(payload["start_local"], "2026-01-01 11:00 CET");
        assert_eq!(payload["timezone"], "Europe/Berlin");
        assert_eq!(jobs[0].recipient, "lena@example.com");
    }
}
