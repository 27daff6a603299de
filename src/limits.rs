//! Hard caps on client-controlled sizes. Anything over these is rejected
//! with `EngineError::LimitExceeded` before touching state or the WAL.

pub const MAX_INSTRUCTORS: usize = 100_000;

/// Schedule entries, time-off, custom availability and bookings combined.
pub const MAX_ENTITIES_PER_INSTRUCTOR: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_REASON_LEN: usize = 1024;

/// Widest date range a single slot query may cover.
pub const MAX_QUERY_DAYS: i64 = 92;

/// Longest single lesson.
pub const MAX_LESSON_MINUTES: u32 = 12 * 60;

/// Longest time-off period in days.
pub const MAX_TIME_OFF_DAYS: i64 = 366;
