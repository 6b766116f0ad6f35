use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use ulid::Ulid;

use super::{CalendarError, CalendarProvider, EventDraft, ExternalEvent};
use crate::model::Span;

/// In-process calendar keyed by `(calendar_id, event_id)`.
///
/// Failure injection: `fail_next(n)` makes the next `n` calls fail before doing
/// anything; `lose_next_response(n)` lets the next `n` writes land but reports
/// them as failed, like a timeout after the provider committed.
#[derive(Default)]
pub struct MemoryCalendar {
    events: Mutex<HashMap<String, HashMap<String, ExternalEvent>>>,
    next_id: AtomicU64,
    fail_next: AtomicU32,
    lose_next: AtomicU32,
    calls: AtomicU64,
}

/// Decrement `counter` if positive; true when a unit was taken.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_response(&self, n: u32) {
        self.lose_next.store(n, Ordering::SeqCst);
    }

    /// Every event in a calendar, ordered by start.
    pub fn events(&self, calendar_id: &str) -> Vec<ExternalEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = events
            .get(calendar_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| (a.start, &a.event_id).cmp(&(b.start, &b.event_id)));
        list
    }

    /// Total provider calls, successful or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Simulate a human editing the calendar directly.
    pub fn insert_foreign_event(&self, calendar_id: &str, start: i64, end: i64, summary: &str) -> String {
        let event_id = self.fresh_id();
        let event = ExternalEvent {
            event_id: event_id.clone(),
            booking_id: None,
            start,
            end,
            summary: summary.to_string(),
        };
        self.lock()
            .entry(calendar_id.to_string())
            .or_default()
            .insert(event_id.clone(), event);
        event_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, ExternalEvent>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_id(&self) -> String {
        format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn begin(&self) -> Result<(), CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.fail_next) {
            return Err(CalendarError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn finish<T>(&self, value: T) -> Result<T, CalendarError> {
        if take(&self.lose_next) {
            return Err(CalendarError::Unavailable("response lost".into()));
        }
        Ok(value)
    }
}

#[async_trait]
impl CalendarProvider for MemoryCalendar {
    async fn find_event(
        &self,
        calendar_id: &str,
        booking_id: Ulid,
    ) -> Result<Option<ExternalEvent>, CalendarError> {
        self.begin()?;
        Ok(self.lock().get(calendar_id).and_then(|c| {
            c.values()
                .find(|e| e.booking_id == Some(booking_id))
                .cloned()
        }))
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<String, CalendarError> {
        self.begin()?;
        if draft.start >= draft.end {
            return Err(CalendarError::Rejected("event ends before it starts".into()));
        }
        let event_id = self.fresh_id();
        let event = ExternalEvent {
            event_id: event_id.clone(),
            booking_id: Some(draft.booking_id),
            start: draft.start,
            end: draft.end,
            summary: draft.summary.clone(),
        };
        self.lock()
            .entry(calendar_id.to_string())
            .or_default()
            .insert(event_id.clone(), event);
        self.finish(event_id)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<(), CalendarError> {
        self.begin()?;
        {
            let mut events = self.lock();
            let event = events
                .get_mut(calendar_id)
                .and_then(|c| c.get_mut(event_id))
                .ok_or_else(|| CalendarError::NotFound(event_id.to_string()))?;
            event.start = draft.start;
            event.end = draft.end;
            event.summary = draft.summary.clone();
            event.booking_id = Some(draft.booking_id);
        }
        self.finish(())
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), CalendarError> {
        self.begin()?;
        let removed = self
            .lock()
            .get_mut(calendar_id)
            .and_then(|c| c.remove(event_id));
        if removed.is_none() {
            return Err(CalendarError::NotFound(event_id.to_string()));
        }
        self.finish(())
    }

    async fn free_busy(&self, calendar_id: &str, window: Span) -> Result<Vec<Span>, CalendarError> {
        self.begin()?;
        let mut busy: Vec<Span> = self
            .events(calendar_id)
            .into_iter()
            .map(|e| Span::new(e.start, e.end))
            .filter(|s| s.overlaps(&window))
            .collect();
        busy.sort_by_key(|s| s.start);
        Ok(crate::engine::merge_overlapping(&busy))
    }
}
