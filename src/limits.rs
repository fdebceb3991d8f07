use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SERVICES_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_SERVICE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

const DAY_MS: Ms = 86_400_000;

/// Longest single reservation (about ten years).
pub const MAX_SPAN_DURATION_MS: Ms = 3_660 * DAY_MS;
/// Widest calendar / overlap query window.
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * DAY_MS;
/// Largest buffer before or after a rental.
pub const MAX_BUFFER_MS: Ms = 90 * DAY_MS;

pub const MAX_CALENDAR_SLOTS: usize = 10_000;
pub const MAX_CONFLICTS_REPORTED: usize = 50;
pub const MAX_RESERVATIONS_PER_BOOKING: usize = 100;
