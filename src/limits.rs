use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_CONSULTANTS_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_CONSULTANT: usize = 100_000;
pub const MAX_BLACKOUTS_PER_CONSULTANT: usize = 4_096;
pub const MAX_RANGES_PER_WEEKDAY: usize = 24;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_EMAIL_LEN: usize = 320;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_ADVANCE_DAYS: u32 = 730;
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Widest window a single slot query may scan.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;
/// Upper bound on slots materialized for one wire-level query.
pub const MAX_SLOTS_PER_QUERY: usize = 10_000;

pub const MAX_BATCH_SIZE: usize = 256;
