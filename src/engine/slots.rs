use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{blackout_spans, free_intervals, merge_overlapping, subtract_intervals};
use super::conflict::{now_ms, validate_instant};
use super::{Engine, EngineError};

/// Longest DST gap we step across when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 3 * 60;

pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse()
        .map_err(|_| EngineError::validation(format!("unknown timezone: {name}")))
}

#[derive(Clone, Copy)]
enum Edge {
    Start,
    End,
}

/// Resolve a local wall-clock minute on `date` to an instant.
/// Nonexistent times (spring-forward gap) move forward to the first valid
/// minute; ambiguous times (fall-back) take the earliest instant for starts
/// and the latest for ends.
fn resolve_local(tz: &Tz, date: NaiveDate, minute: u16, edge: Edge) -> Option<Ms> {
    let mut naive = date.and_hms_opt(0, 0, 0)? + Duration::minutes(minute as i64);
    for _ in 0..=MAX_GAP_MINUTES {
        let resolved = tz.from_local_datetime(&naive);
        let instant = match edge {
            Edge::Start => resolved.earliest(),
            Edge::End => resolved.latest(),
        };
        if let Some(dt) = instant {
            return Some(dt.timestamp_millis());
        }
        naive += Duration::minutes(1);
    }
    None
}

fn local_date(tz: &Tz, instant: Ms) -> Option<NaiveDate> {
    tz.timestamp_millis_opt(instant)
        .single()
        .map(|dt| dt.date_naive())
}

/// Project the weekly hours onto absolute instants overlapping `window`,
/// clipped to it. Output is sorted and merged.
pub fn project_working_hours(schedule: &ConsultantSchedule, tz: &Tz, window: &Span) -> Vec<Span> {
    let (Some(first), Some(last)) = (local_date(tz, window.start), local_date(tz, window.end))
    else {
        return Vec::new();
    };
    let mut spans = Vec::new();
    // A day's hours can spill into the neighbouring UTC day, so look one day wider.
    let mut date = first.pred_opt().unwrap_or(first);
    let stop = last.succ_opt().unwrap_or(last);
    while date <= stop {
        for range in schedule.weekly_hours.get(date.weekday()) {
            let start = resolve_local(tz, date, range.start_minute, Edge::Start);
            let end = resolve_local(tz, date, range.end_minute, Edge::End);
            if let (Some(start), Some(end)) = (start, end) {
                let start = start.max(window.start);
                let end = end.min(window.end);
                if start < end {
                    spans.push(Span::new(start, end));
                }
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Free schedule time around `span` (hours minus blackouts, bookings ignored).
pub(super) fn schedule_fits(
    schedule: &ConsultantSchedule,
    span: &Span,
    now: Ms,
) -> Result<(), EngineError> {
    if !schedule.booking_window(now).contains_span(span) {
        return Err(EngineError::validation(
            "requested time is outside the advance-notice window",
        ));
    }
    let tz = parse_timezone(&schedule.timezone)?;
    let around = Span::new(span.start - DAY_MS, span.end + DAY_MS);
    let working = project_working_hours(schedule, &tz, &around);
    let open = subtract_intervals(&working, &blackout_spans(schedule, &around));
    if !open.iter().any(|free| free.contains_span(span)) {
        return Err(EngineError::validation(
            "requested time is outside working hours or blacked out",
        ));
    }
    Ok(())
}

/// Round `t` up to the next multiple of `step` (epoch-aligned).
fn align_up(t: Ms, step: Ms) -> Ms {
    let rem = t.rem_euclid(step);
    if rem == 0 { t } else { t + step - rem }
}

/// Lazy, ordered, finite stream of bookable slots over an immutable snapshot
/// of free intervals. Cloning is cheap; `resume_after` restarts past a slot
/// the client already saw.
#[derive(Debug, Clone)]
pub struct SlotIter {
    consultant_id: Ulid,
    free: Arc<[Span]>,
    next_free: usize,
    cursor: Ms,
    duration_minutes: u32,
    step: Ms,
    computed_at: Ms,
}

impl SlotIter {
    fn new(
        consultant_id: Ulid,
        free: Vec<Span>,
        duration_minutes: u32,
        granularity_minutes: u32,
        computed_at: Ms,
    ) -> Self {
        let cursor = free.first().map_or(0, |s| s.start);
        Self {
            consultant_id,
            free: free.into(),
            next_free: 0,
            cursor,
            duration_minutes,
            step: granularity_minutes.max(1) as Ms * MINUTE_MS,
            computed_at,
        }
    }

    /// Continue with slots starting strictly after `last_start`.
    pub fn resume_after(&self, last_start: Ms) -> SlotIter {
        let mut it = self.clone();
        let from = last_start + 1;
        it.cursor = from;
        it.next_free = self.free.partition_point(|s| s.end <= from);
        it
    }

    /// The free intervals slots are drawn from.
    pub fn free_intervals(&self) -> &[Span] {
        &self.free
    }

    pub fn computed_at(&self) -> Ms {
        self.computed_at
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let duration = self.duration_minutes as Ms * MINUTE_MS;
        while let Some(free) = self.free.get(self.next_free) {
            let start = align_up(self.cursor.max(free.start), self.step);
            if start + duration <= free.end {
                self.cursor = start + self.step;
                return Some(Slot {
                    consultant_id: self.consultant_id,
                    start,
                    end: start + duration,
                    duration_minutes: self.duration_minutes,
                    computed_at: self.computed_at,
                });
            }
            self.next_free += 1;
        }
        None
    }
}

impl Engine {
    pub(super) fn validate_duration(&self, duration_minutes: u32) -> Result<(), EngineError> {
        if duration_minutes == 0 || !self.config.is_allowed_duration(duration_minutes) {
            return Err(EngineError::validation(format!(
                "duration {duration_minutes} is not one of {:?}",
                self.config.allowed_durations
            )));
        }
        Ok(())
    }

    /// Bookable slots of `duration_minutes` for one consultant in `[range_start, range_end)`.
    pub async fn generate_slots(
        &self,
        consultant_id: Ulid,
        range_start: Ms,
        range_end: Ms,
        duration_minutes: u32,
    ) -> Result<SlotIter, EngineError> {
        self.validate_duration(duration_minutes)?;
        validate_instant(range_start)?;
        validate_instant(range_end)?;
        if range_start >= range_end {
            return Err(EngineError::validation("range start must be before range end"));
        }
        if range_end - range_start > MAX_QUERY_WINDOW_DAYS * DAY_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let guard = self.read_consultant(consultant_id).await?;
        let now = now_ms();
        let window = guard.schedule.booking_window(now);
        let start = range_start.max(window.start);
        let end = range_end.min(window.end);
        if start >= end {
            return Err(EngineError::validation(
                "range is outside the advance-notice bounds",
            ));
        }
        let query = Span::new(start, end);

        let tz = parse_timezone(&guard.schedule.timezone)?;
        let working = project_working_hours(&guard.schedule, &tz, &query);
        let free = free_intervals(&guard, &working, &query, None);

        Ok(SlotIter::new(
            consultant_id,
            free,
            duration_minutes,
            self.config.slot_granularity_minutes,
            now,
        ))
    }
}
