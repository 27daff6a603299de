use chrono::{NaiveDate, Weekday};
use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a proposed booking interval was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// start >= end.
    InvalidRange,
    /// Not inside any working window for its date.
    OutsideAvailability,
    /// Overlaps this existing booking.
    DoubleBooked(Ulid),
    /// The store's exclusion constraint rejected the insert.
    StorageConflict(Ulid),
}

impl ConflictReason {
    /// Callers treat both flavours of "someone else got there first" the same.
    pub fn is_double_booking(&self) -> bool {
        matches!(self, ConflictReason::DoubleBooked(_) | ConflictReason::StorageConflict(_))
    }

    /// Stable label for metrics and client messages.
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::InvalidRange => "invalid_range",
            ConflictReason::OutsideAvailability => "outside_availability",
            ConflictReason::DoubleBooked(_) => "double_booked",
            ConflictReason::StorageConflict(_) => "storage_conflict",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::InvalidRange => write!(f, "invalid range: start must be before end"),
            ConflictReason::OutsideAvailability => {
                write!(f, "outside availability: interval is not inside a working window")
            }
            ConflictReason::DoubleBooked(id) => write!(f, "double booked: overlaps booking {id}"),
            ConflictReason::StorageConflict(id) => {
                write!(f, "storage conflict: overlaps booking {id}")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(ConflictReason),
    InvalidTimeRange,
    InvalidDateRange,
    InvalidDuration,
    DuplicateScheduleDay(Weekday),
    DuplicateCustomDate(NaiveDate),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl From<ConflictReason> for EngineError {
    fn from(reason: ConflictReason) -> Self {
        EngineError::Conflict(reason)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(reason) => write!(f, "booking conflict: {reason}"),
            EngineError::InvalidTimeRange => write!(f, "start time must be before end time"),
            EngineError::InvalidDateRange => write!(f, "start date must not be after end date"),
            EngineError::InvalidDuration => write!(f, "duration must be a positive number of minutes"),
            EngineError::DuplicateScheduleDay(day) => {
                write!(f, "schedule entry for {day} already exists")
            }
            EngineError::DuplicateCustomDate(date) => {
                write!(f, "custom availability for {date} already exists")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot remove instructor {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
