use std::sync::Arc;

use chrono::Weekday;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::slots::parse_timezone;
use super::{Engine, EngineError};

/// The scalar part of a schedule, as written by admin tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsultantProfile {
    pub consultant_id: Ulid,
    pub timezone: String,
    pub display_name: Option<String>,
    pub buffer_minutes: u32,
    pub min_advance_hours: u32,
    pub max_advance_days: u32,
    pub calendar_id: Option<String>,
}

impl ConsultantProfile {
    pub fn new(consultant_id: Ulid, timezone: impl Into<String>) -> Self {
        let defaults = ConsultantSchedule::new(consultant_id, "UTC");
        Self {
            consultant_id,
            timezone: timezone.into(),
            display_name: None,
            buffer_minutes: defaults.buffer_minutes,
            min_advance_hours: defaults.min_advance_hours,
            max_advance_days: defaults.max_advance_days,
            calendar_id: None,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        parse_timezone(&self.timezone)?;
        if let Some(name) = &self.display_name
            && name.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("display name too long"));
        }
        if let Some(cal) = &self.calendar_id
            && (cal.is_empty() || cal.len() > MAX_LABEL_LEN)
        {
            return Err(EngineError::validation("calendar id must be 1..256 bytes"));
        }
        if self.buffer_minutes > MAX_BUFFER_MINUTES {
            return Err(EngineError::validation(format!(
                "buffer_minutes must be at most {MAX_BUFFER_MINUTES}"
            )));
        }
        if self.max_advance_days == 0 || self.max_advance_days > MAX_ADVANCE_DAYS {
            return Err(EngineError::validation(format!(
                "max_advance_days must be in 1..={MAX_ADVANCE_DAYS}"
            )));
        }
        if self.min_advance_hours as i64 * HOUR_MS >= self.max_advance_days as i64 * DAY_MS {
            return Err(EngineError::validation(
                "min_advance_hours leaves no bookable window",
            ));
        }
        Ok(())
    }

    fn apply_to(&self, schedule: &mut ConsultantSchedule) {
        schedule.timezone = self.timezone.clone();
        schedule.display_name = self.display_name.clone();
        schedule.buffer_minutes = self.buffer_minutes;
        schedule.min_advance_hours = self.min_advance_hours;
        schedule.max_advance_days = self.max_advance_days;
        schedule.calendar_id = self.calendar_id.clone();
    }
}

/// Ranges of one weekday must be sorted, non-overlapping, non-empty and end by 24:00.
pub fn validate_weekday_ranges(ranges: &[LocalRange]) -> Result<(), EngineError> {
    if ranges.len() > MAX_RANGES_PER_WEEKDAY {
        return Err(EngineError::LimitExceeded("too many ranges for one weekday"));
    }
    for r in ranges {
        if r.end_minute > LocalRange::END_OF_DAY {
            return Err(EngineError::validation(format!("{r}: end after 24:00")));
        }
        if r.start_minute >= r.end_minute {
            return Err(EngineError::validation(format!("{r}: start must be before end")));
        }
    }
    for pair in ranges.windows(2) {
        if pair[1].start_minute < pair[0].end_minute {
            return Err(EngineError::validation(format!(
                "{} and {} overlap or are out of order",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

impl Engine {
    /// Create a consultant, or replace the rules of an existing one (hours and
    /// blackouts are kept). Only future slot generation is affected.
    pub async fn upsert_consultant(&self, profile: ConsultantProfile) -> Result<(), EngineError> {
        profile.validate()?;
        let id = profile.consultant_id;
        if self.replace_profile(&profile).await? {
            return Ok(());
        }

        let _registry = self.registry.lock().await;
        // Lost a creation race: update what the winner created.
        if self.replace_profile(&profile).await? {
            return Ok(());
        }
        if self.state.len() >= MAX_CONSULTANTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many consultants"));
        }
        let mut schedule = ConsultantSchedule::new(id, profile.timezone.clone());
        profile.apply_to(&mut schedule);
        let event = Event::ScheduleReplaced {
            schedule: schedule.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ConsultantState::new(schedule))));
        self.index_event(&event);
        tracing::info!("consultant {id} created");
        Ok(())
    }

    /// Update an existing consultant's rules. `false` when there is none.
    async fn replace_profile(&self, profile: &ConsultantProfile) -> Result<bool, EngineError> {
        let Some(rs) = self.get_consultant(&profile.consultant_id) else {
            return Ok(false);
        };
        let mut guard = rs.write_owned().await;
        if guard.removed {
            return Ok(false);
        }
        let mut schedule = guard.schedule.clone();
        profile.apply_to(&mut schedule);
        let event = Event::ScheduleReplaced { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Remove a consultant. Refused while they still hold upcoming confirmed bookings.
    pub async fn remove_consultant(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guard = self.write_consultant(id).await?;
        let now = now_ms();
        if guard
            .bookings
            .iter()
            .any(|b| b.status == BookingStatus::Confirmed && b.end() > now)
        {
            return Err(EngineError::validation(
                "consultant still has upcoming confirmed bookings",
            ));
        }
        let event = Event::ConsultantRemoved { id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.state.remove(&id);
        self.forget_consultant(&guard);
        self.notify.remove(&id);
        tracing::info!("consultant {id} removed");
        Ok(())
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<ConsultantSchedule, EngineError> {
        Ok(self.read_consultant(id).await?.schedule.clone())
    }

    pub async fn list_consultants(&self) -> Vec<ConsultantSchedule> {
        let all: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(all.len());
        for rs in all {
            let guard = rs.read().await;
            if !guard.removed {
                out.push(guard.schedule.clone());
            }
        }
        out.sort_by_key(|s| s.consultant_id);
        out
    }

    /// Replace one weekday's working hours. An empty list clears the day.
    pub async fn set_weekday_hours(
        &self,
        id: Ulid,
        day: Weekday,
        ranges: Vec<LocalRange>,
    ) -> Result<(), EngineError> {
        validate_weekday_ranges(&ranges)?;
        let mut guard = self.write_consultant(id).await?;
        let mut schedule = guard.schedule.clone();
        schedule.weekly_hours.set(day, ranges);
        let event = Event::ScheduleReplaced { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(())
    }

    pub async fn add_blackout(
        &self,
        consultant_id: Ulid,
        blackout: Blackout,
    ) -> Result<(), EngineError> {
        validate_span(&blackout.span)?;
        if let Some(label) = &blackout.label
            && label.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("blackout label too long"));
        }
        if self.blackout_index.contains_key(&blackout.id) {
            return Err(EngineError::AlreadyExists(blackout.id));
        }
        let mut guard = self.write_consultant(consultant_id).await?;
        if guard.schedule.blackouts.len() >= MAX_BLACKOUTS_PER_CONSULTANT {
            return Err(EngineError::LimitExceeded("too many blackouts"));
        }
        let mut schedule = guard.schedule.clone();
        schedule.insert_blackout(blackout);
        let event = Event::ScheduleReplaced { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(())
    }

    /// Remove a blackout by id. Returns the consultant it belonged to.
    pub async fn remove_blackout(&self, blackout_id: Ulid) -> Result<Ulid, EngineError> {
        let consultant_id = self
            .blackout_index
            .get(&blackout_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("blackout", blackout_id))?;
        let mut guard = self.write_consultant(consultant_id).await?;
        let mut schedule = guard.schedule.clone();
        if schedule.remove_blackout(blackout_id).is_none() {
            return Err(EngineError::not_found("blackout", blackout_id));
        }
        let event = Event::ScheduleReplaced { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        self.blackout_index.remove(&blackout_id);
        Ok(consultant_id)
    }

    /// Mark the consultant offline for `span`: an `offline` blackout.
    pub async fn set_offline(&self, consultant_id: Ulid, span: Span) -> Result<Ulid, EngineError> {
        let id = Ulid::new();
        self.add_blackout(
            consultant_id,
            Blackout {
                id,
                span,
                kind: BlackoutKind::Offline,
                label: None,
            },
        )
        .await?;
        Ok(id)
    }

    /// Back online: drop every `offline` blackout. Returns how many were removed.
    pub async fn set_online(&self, consultant_id: Ulid) -> Result<usize, EngineError> {
        let mut guard = self.write_consultant(consultant_id).await?;
        let mut schedule = guard.schedule.clone();
        let (offline, kept): (Vec<Blackout>, Vec<Blackout>) = schedule
            .blackouts
            .into_iter()
            .partition(|b| b.kind == BlackoutKind::Offline);
        if offline.is_empty() {
            return Ok(0);
        }
        schedule.blackouts = kept;
        let event = Event::ScheduleReplaced { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        for b in &offline {
            self.blackout_index.remove(&b.id);
        }
        Ok(offline.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_ranges_accept_sorted_disjoint() {
        let ranges = vec![LocalRange::new(540, 720), LocalRange::new(780, 1440)];
        assert!(validate_weekday_ranges(&ranges).is_ok());
        // Touching ranges are fine: half-open.
        let touching = vec![LocalRange::new(540, 720), LocalRange::new(720, 900)];
        assert!(validate_weekday_ranges(&touching).is_ok());
    }

    #[test]
    fn weekday_ranges_reject_bad_input() {
        let overlapping = vec![LocalRange::new(540, 720), LocalRange::new(700, 900)];
        assert!(matches!(
            validate_weekday_ranges(&overlapping),
            Err(EngineError::Validation(_))
        ));
        let inverted = vec![LocalRange::new(720, 540)];
        assert!(validate_weekday_ranges(&inverted).is_err());
        let empty = vec![LocalRange::new(600, 600)];
        assert!(validate_weekday_ranges(&empty).is_err());
        let past_midnight = vec![LocalRange::new(600, 1441)];
        assert!(validate_weekday_ranges(&past_midnight).is_err());
        let too_many: Vec<_> = (0..=MAX_RANGES_PER_WEEKDAY as u16)
            .map(|i| LocalRange::new(i * 50, i * 50 + 10))
            .collect();
        assert!(matches!(
            validate_weekday_ranges(&too_many),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn profile_validation() {
        let id = Ulid::new();
        assert!(ConsultantProfile::new(id, "Europe/Berlin").validate().is_ok());
        assert!(ConsultantProfile::new(id, "Mars/Olympus").validate().is_err());

        let mut p = ConsultantProfile::new(id, "UTC");
        p.buffer_minutes = MAX_BUFFER_MINUTES + 1;
        assert!(p.validate().is_err());

        let mut p = ConsultantProfile::new(id, "UTC");
        p.max_advance_days = 0;
        assert!(p.validate().is_err());

        let mut p = ConsultantProfile::new(id, "UTC");
        p.max_advance_days = 1;
        p.min_advance_hours = 24;
        assert!(p.validate().is_err());
    }
}
