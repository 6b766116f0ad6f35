use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the engine uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow the span by `by` on both sides.
    pub fn expand(&self, by: Ms) -> Span {
        Span {
            start: self.start - by,
            end: self.end + by,
        }
    }
}

// ── Schedule ─────────────────────────────────────────────────────

/// Local wall-clock range in minutes since midnight. `end_minute` may be 1440 (24:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRange {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl LocalRange {
    pub const END_OF_DAY: u16 = 24 * 60;

    pub fn new(start_minute: u16, end_minute: u16) -> Self {
        Self {
            start_minute,
            end_minute,
        }
    }

    /// Parse `"09:00"`-style bounds. `"24:00"` is accepted as an end.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self::new(parse_clock(start)?, parse_clock(end)?))
    }
}

impl fmt::Display for LocalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        )
    }
}

/// `HH:MM` → minutes since midnight.
pub fn parse_clock(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.trim().to_lowercase().as_str() {
        "mon" | "monday" | "1" => Some(Weekday::Mon),
        "tue" | "tuesday" | "2" => Some(Weekday::Tue),
        "wed" | "wednesday" | "3" => Some(Weekday::Wed),
        "thu" | "thursday" | "4" => Some(Weekday::Thu),
        "fri" | "friday" | "5" => Some(Weekday::Fri),
        "sat" | "saturday" | "6" => Some(Weekday::Sat),
        "sun" | "sunday" | "7" | "0" => Some(Weekday::Sun),
        _ => None,
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Working hours per weekday, Monday first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: [Vec<LocalRange>; 7],
}

impl WeeklyHours {
    pub fn get(&self, day: Weekday) -> &[LocalRange] {
        &self.days[day.num_days_from_monday() as usize]
    }

    pub fn set(&mut self, day: Weekday, ranges: Vec<LocalRange>) {
        self.days[day.num_days_from_monday() as usize] = ranges;
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(|d| d.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, &[LocalRange])> {
        WEEKDAYS
            .iter()
            .zip(self.days.iter())
            .map(|(day, ranges)| (*day, ranges.as_slice()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlackoutKind {
    Holiday,
    Block,
    /// Consultant toggled offline; removed as a group when they come back online.
    Offline,
}

impl BlackoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlackoutKind::Holiday => "holiday",
            BlackoutKind::Block => "block",
            BlackoutKind::Offline => "offline",
        }
    }
}

impl FromStr for BlackoutKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "holiday" => Ok(BlackoutKind::Holiday),
            "block" => Ok(BlackoutKind::Block),
            "offline" => Ok(BlackoutKind::Offline),
            other => Err(format!("unknown blackout kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub span: Span,
    pub kind: BlackoutKind,
    pub label: Option<String>,
}

/// Everything the slot generator needs to know about one consultant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultantSchedule {
    pub consultant_id: Ulid,
    pub display_name: Option<String>,
    /// IANA zone; the reference frame for `weekly_hours`.
    pub timezone: String,
    pub weekly_hours: WeeklyHours,
    /// Sorted by `span.start`.
    pub blackouts: Vec<Blackout>,
    pub buffer_minutes: u32,
    pub min_advance_hours: u32,
    pub max_advance_days: u32,
    pub calendar_id: Option<String>,
}

impl ConsultantSchedule {
    pub fn new(consultant_id: Ulid, timezone: impl Into<String>) -> Self {
        Self {
            consultant_id,
            display_name: None,
            timezone: timezone.into(),
            weekly_hours: WeeklyHours::default(),
            blackouts: Vec::new(),
            buffer_minutes: 0,
            min_advance_hours: 0,
            max_advance_days: 60,
            calendar_id: None,
        }
    }

    pub fn buffer_ms(&self) -> Ms {
        self.buffer_minutes as Ms * MINUTE_MS
    }

    /// `[now + min_advance, now + max_advance]` as a span.
    pub fn booking_window(&self, now: Ms) -> Span {
        Span {
            start: now + self.min_advance_hours as Ms * HOUR_MS,
            end: now + self.max_advance_days as Ms * DAY_MS,
        }
    }

    pub fn insert_blackout(&mut self, blackout: Blackout) {
        let pos = self
            .blackouts
            .binary_search_by_key(&blackout.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.blackouts.insert(pos, blackout);
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<Blackout> {
        let pos = self.blackouts.iter().position(|b| b.id == id)?;
        Some(self.blackouts.remove(pos))
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Rescheduled => "rescheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::NoShow
                | BookingStatus::Rescheduled
        )
    }

    /// Statuses that occupy the consultant's time for conflict purposes.
    pub fn holds_time(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Completed)
    }

    /// The booking state machine.
    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (Confirmed, Rescheduled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "no_show" => Ok(BookingStatus::NoShow),
            "rescheduled" => Ok(BookingStatus::Rescheduled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncState {
    #[default]
    Unsynced,
    Synced,
    SyncFailed,
    ExternalDeleted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Synced => "synced",
            SyncState::SyncFailed => "sync_failed",
            SyncState::ExternalDeleted => "external_deleted",
        }
    }
}

/// Calendar mirror bookkeeping. Not versioned: only status transitions bump `Booking::version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub external_event_id: Option<String>,
    pub attempts: u32,
    pub last_attempt_at: Option<Ms>,
    pub last_error: Option<String>,
    pub needs_reconciliation: bool,
    pub reconciliation_note: Option<String>,
}

/// Who caused a ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    Client,
    Admin,
    Calendar,
    Scheduler,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Client => "client",
            Actor::Admin => "admin",
            Actor::Calendar => "calendar",
            Actor::Scheduler => "scheduler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// `None` for the creation entry.
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    /// Booking version after this change.
    pub version: u64,
    pub at: Ms,
    pub actor: Actor,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Display only; every computation uses instants.
    pub timezone: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Client-facing handle, distinct from `id`.
    pub reference: String,
    pub consultant_id: Ulid,
    pub span: Span,
    pub duration_minutes: u32,
    pub client: ClientContact,
    pub status: BookingStatus,
    pub version: u64,
    pub supersedes: Option<Ulid>,
    pub superseded_by: Option<Ulid>,
    pub created_at: Ms,
    pub confirmed_at: Ms,
    pub sync: SyncStatus,
    pub absence_reported: bool,
    pub history: Vec<StatusChange>,
}

impl Booking {
    pub fn reference_for(id: Ulid) -> String {
        let s = id.to_string();
        format!("BK-{}", &s[s.len() - 8..])
    }

    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn end(&self) -> Ms {
        self.span.end
    }

    pub fn holds_time(&self) -> bool {
        self.status.holds_time()
    }
}

/// A generation-time snapshot; re-validated at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub consultant_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    pub computed_at: Ms,
}

/// In-memory state of one consultant: schedule, every booking ever made
/// (sorted by start) and the notification keys already handed out.
#[derive(Debug, Clone)]
pub struct ConsultantState {
    pub schedule: ConsultantSchedule,
    pub bookings: Vec<Booking>,
    pub dispatched: HashSet<(Ulid, NotificationKind)>,
    /// Set under the write lock when the consultant is removed, so writers
    /// that were queued on the lock see it.
    pub removed: bool,
}

impl ConsultantState {
    pub fn new(schedule: ConsultantSchedule) -> Self {
        Self {
            schedule,
            bookings: Vec::new(),
            dispatched: HashSet::new(),
            removed: false,
        }
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Bookings that hold the consultant's time and overlap `query`.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.holds_time())
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationKind {
    Confirmation,
    Reminder { minutes_before: u32 },
    FollowUp,
    Cancellation,
    Reschedule,
}

impl NotificationKind {
    pub fn label(&self) -> String {
        match self {
            NotificationKind::Confirmation => "confirmation".into(),
            NotificationKind::Reminder { minutes_before } if minutes_before % 60 == 0 => {
                format!("reminder_{}h", minutes_before / 60)
            }
            NotificationKind::Reminder { minutes_before } => format!("reminder_{minutes_before}m"),
            NotificationKind::FollowUp => "follow_up".into(),
            NotificationKind::Cancellation => "cancellation".into(),
            NotificationKind::Reschedule => "reschedule".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationJob {
    pub booking_id: Ulid,
    pub reference: String,
    pub consultant_id: Ulid,
    pub kind: NotificationKind,
    pub recipient: String,
    pub due_at: Ms,
    pub payload: serde_json::Value,
}

impl NotificationJob {
    pub fn dedup_key(&self) -> (Ulid, NotificationKind) {
        (self.booking_id, self.kind)
    }
}

// ── Ledger events ────────────────────────────────────────────────

/// WAL record payload. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Full replacement of a consultant's schedule (hours, blackouts, rules).
    ScheduleReplaced {
        schedule: ConsultantSchedule,
    },
    ConsultantRemoved {
        id: Ulid,
    },
    BookingCommitted {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        consultant_id: Ulid,
        change: StatusChange,
    },
    /// Old booking → `rescheduled` and its replacement, as one record.
    BookingRescheduled {
        id: Ulid,
        consultant_id: Ulid,
        change: StatusChange,
        replacement: Booking,
    },
    SyncRecorded {
        id: Ulid,
        consultant_id: Ulid,
        sync: SyncStatus,
    },
    AbsenceReported {
        id: Ulid,
        consultant_id: Ulid,
    },
    NotificationsDispatched {
        consultant_id: Ulid,
        keys: Vec<(Ulid, NotificationKind)>,
    },
    /// Compaction snapshot of one booking, history included.
    BookingRestored {
        booking: Booking,
    },
}

impl Event {
    /// Consultant whose state this event mutates.
    pub fn consultant_id(&self) -> Ulid {
        match self {
            Event::ScheduleReplaced { schedule } => schedule.consultant_id,
            Event::ConsultantRemoved { id } => *id,
            Event::BookingCommitted { booking } | Event::BookingRestored { booking } => {
                booking.consultant_id
            }
            Event::BookingTransitioned { consultant_id, .. }
            | Event::BookingRescheduled { consultant_id, .. }
            | Event::SyncRecorded { consultant_id, .. }
            | Event::AbsenceReported { consultant_id, .. }
            | Event::NotificationsDispatched { consultant_id, .. } => *consultant_id,
        }
    }
}
