use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Free time for one consultant inside `query`:
/// working spans, minus blackouts, minus every time-holding booking
/// widened by the buffer on both sides.
///
/// `working` must already be projected into absolute instants.
/// `exclude` skips one booking (the one being rescheduled).
pub fn free_intervals(
    state: &ConsultantState,
    working: &[Span],
    query: &Span,
    exclude: Option<Ulid>,
) -> Vec<Span> {
    let mut free: Vec<Span> = working
        .iter()
        .filter(|s| s.overlaps(query))
        .map(|s| Span::new(s.start.max(query.start), s.end.min(query.end)))
        .collect();
    free.sort_by_key(|s| s.start);
    free = merge_overlapping(&free);

    let blocked = blackout_spans(&state.schedule, query);
    if !blocked.is_empty() {
        free = subtract_intervals(&free, &blocked);
    }

    let busy = busy_spans(state, query, exclude);
    if !busy.is_empty() {
        free = subtract_intervals(&free, &busy);
    }

    free
}

/// Blackouts overlapping `query`, sorted and merged.
pub fn blackout_spans(schedule: &ConsultantSchedule, query: &Span) -> Vec<Span> {
    let right_bound = schedule
        .blackouts
        .partition_point(|b| b.span.start < query.end);
    let spans: Vec<Span> = schedule.blackouts[..right_bound]
        .iter()
        .filter(|b| b.span.end > query.start)
        .map(|b| b.span)
        .collect();
    merge_overlapping(&spans)
}

/// Time-holding bookings near `query`, each expanded by the buffer, sorted and merged.
pub fn busy_spans(state: &ConsultantState, query: &Span, exclude: Option<Ulid>) -> Vec<Span> {
    let buffer = state.schedule.buffer_ms();
    let search = query.expand(buffer);
    let mut busy: Vec<Span> = state
        .occupying(&search)
        .filter(|b| Some(b.id) != exclude)
        .map(|b| b.span.expand(buffer))
        .collect();
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
