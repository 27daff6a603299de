use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` in local business time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span covering `start..end` on a single calendar date.
    pub fn on_date(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self::new(date.and_time(start), date.and_time(end))
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every date in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

// ── Schedule entities ────────────────────────────────────────────

/// Recurring availability for one day of the week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyScheduleEntry {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub active: bool,
}

/// Blocked period. Without times the whole of every date in range is blocked;
/// with times only `[start_time, end_time)` of each date is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffException {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: Option<String>,
}

impl TimeOffException {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn is_full_day(&self) -> bool {
        self.start_time.is_none() || self.end_time.is_none()
    }

    /// The blocked span on `date`, or `None` if the exception doesn't touch it.
    pub fn blocked_on(&self, date: NaiveDate) -> Option<Span> {
        if !self.covers(date) {
            return None;
        }
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some(Span::on_date(date, s, e)),
            _ => {
                let start = date.and_time(NaiveTime::MIN);
                let end = date.succ_opt().map_or(NaiveDateTime::MAX, |d| d.and_time(NaiveTime::MIN));
                Some(Span::new(start, end))
            }
        }
    }
}

/// One-off working hours for a single date. Replaces the weekly entry when active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAvailability {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Whether a booking in this status holds the instructor's time.
    pub fn occupies_time(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub student_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: NaiveDateTime,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.occupies_time()
    }
}

// ── Instructor aggregate ─────────────────────────────────────────

/// Everything the scheduling core knows about one instructor.
#[derive(Debug, Clone)]
pub struct InstructorState {
    pub id: Ulid,
    pub name: Option<String>,
    pub schedule: Vec<WeeklyScheduleEntry>,
    /// Sorted by `start_date`.
    pub time_off: Vec<TimeOffException>,
    /// Sorted by `date`.
    pub custom: Vec<CustomAvailability>,
    /// All bookings including cancelled ones, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl InstructorState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            schedule: Vec::new(),
            time_off: Vec::new(),
            custom: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.schedule.len() + self.time_off.len() + self.custom.len() + self.bookings.len()
    }

    // ── Weekly schedule ──────────────────────────────────────

    pub fn list_schedule_entries(&self) -> &[WeeklyScheduleEntry] {
        &self.schedule
    }

    pub fn schedule_entry_for(&self, day: Weekday) -> Option<&WeeklyScheduleEntry> {
        self.schedule.iter().find(|e| e.day == day)
    }

    pub fn upsert_schedule_entry(&mut self, entry: WeeklyScheduleEntry) {
        self.schedule.retain(|e| e.id != entry.id);
        self.schedule.push(entry);
        self.schedule
            .sort_by_key(|e| e.day.num_days_from_monday());
    }

    pub fn remove_schedule_entry(&mut self, id: Ulid) -> Option<WeeklyScheduleEntry> {
        let pos = self.schedule.iter().position(|e| e.id == id)?;
        Some(self.schedule.remove(pos))
    }

    // ── Time off ─────────────────────────────────────────────

    /// Exceptions touching any date of `range`.
    pub fn list_time_off(&self, range: &DateRange) -> impl Iterator<Item = &TimeOffException> {
        let right_bound = self.time_off.partition_point(|t| t.start_date <= range.end);
        let start = range.start;
        self.time_off[..right_bound]
            .iter()
            .filter(move |t| t.end_date >= start)
    }

    pub fn insert_time_off(&mut self, exception: TimeOffException) {
        let pos = self
            .time_off
            .partition_point(|t| t.start_date <= exception.start_date);
        self.time_off.insert(pos, exception);
    }

    pub fn remove_time_off(&mut self, id: Ulid) -> Option<TimeOffException> {
        let pos = self.time_off.iter().position(|t| t.id == id)?;
        Some(self.time_off.remove(pos))
    }

    // ── Custom availability ──────────────────────────────────

    pub fn list_custom_availability(&self, range: &DateRange) -> &[CustomAvailability] {
        let lo = self.custom.partition_point(|c| c.date < range.start);
        let hi = self.custom.partition_point(|c| c.date <= range.end);
        &self.custom[lo..hi]
    }

    pub fn custom_for(&self, date: NaiveDate) -> Option<&CustomAvailability> {
        self.custom
            .binary_search_by_key(&date, |c| c.date)
            .ok()
            .map(|i| &self.custom[i])
    }

    pub fn upsert_custom_availability(&mut self, entry: CustomAvailability) {
        self.custom.retain(|c| c.id != entry.id);
        let pos = self.custom.partition_point(|c| c.date < entry.date);
        self.custom.insert(pos, entry);
    }

    pub fn remove_custom_availability(&mut self, id: Ulid) -> Option<CustomAvailability> {
        let pos = self.custom.iter().position(|c| c.id == id)?;
        Some(self.custom.remove(pos))
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Bookings (any status) whose span overlaps `query`.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Non-cancelled bookings starting on a date inside `range`.
    pub fn list_active_bookings(&self, range: &DateRange) -> impl Iterator<Item = &Booking> {
        let start = range.start.and_time(NaiveTime::MIN);
        let lo = self.bookings.partition_point(|b| b.span.start < start);
        let end = range.end;
        self.bookings[lo..]
            .iter()
            .take_while(move |b| b.span.start.date() <= end)
            .filter(|b| b.is_active())
    }

    /// Storage-level exclusion constraint: the first non-cancelled booking
    /// whose interval overlaps `span`.
    pub fn exclusion_conflict(&self, span: &Span) -> Option<Ulid> {
        self.overlapping_bookings(span)
            .find(|b| b.is_active())
            .map(|b| b.id)
    }

    /// Insert keeping sort order by `span.start`. Rejects with the id of the
    /// conflicting booking if the exclusion constraint would be violated.
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), Ulid> {
        if booking.is_active()
            && let Some(other) = self.exclusion_conflict(&booking.span)
        {
            return Err(other);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
        Ok(())
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn set_booking_status(&mut self, id: Ulid, status: BookingStatus) -> Option<&Booking> {
        let booking = self.bookings.iter_mut().find(|b| b.id == id)?;
        booking.status = status;
        Some(booking)
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| b.is_active())
    }
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InstructorRegistered {
        id: Ulid,
        name: Option<String>,
    },
    InstructorRemoved {
        id: Ulid,
    },
    ScheduleEntrySet {
        entry: WeeklyScheduleEntry,
    },
    ScheduleEntryRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    TimeOffAdded {
        exception: TimeOffException,
    },
    TimeOffRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    CustomAvailabilitySet {
        entry: CustomAvailability,
    },
    CustomAvailabilityRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        instructor_id: Ulid,
        status: BookingStatus,
    },
}

impl Event {
    /// The instructor this event belongs to.
    pub fn instructor_id(&self) -> Ulid {
        match self {
            Event::InstructorRegistered { id, .. } | Event::InstructorRemoved { id } => *id,
            Event::ScheduleEntrySet { entry } => entry.instructor_id,
            Event::TimeOffAdded { exception } => exception.instructor_id,
            Event::CustomAvailabilitySet { entry } => entry.instructor_id,
            Event::BookingCreated { booking } => booking.instructor_id,
            Event::ScheduleEntryRemoved { instructor_id, .. }
            | Event::TimeOffRemoved { instructor_id, .. }
            | Event::CustomAvailabilityRemoved { instructor_id, .. }
            | Event::BookingStatusChanged { instructor_id, .. } => *instructor_id,
        }
    }

    /// Short name used as the `kind` field of notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::InstructorRegistered { .. } => "instructor_registered",
            Event::InstructorRemoved { .. } => "instructor_removed",
            Event::ScheduleEntrySet { .. } => "schedule_entry_set",
            Event::ScheduleEntryRemoved { .. } => "schedule_entry_removed",
            Event::TimeOffAdded { .. } => "time_off_added",
            Event::TimeOffRemoved { .. } => "time_off_removed",
            Event::CustomAvailabilitySet { .. } => "custom_availability_set",
            Event::CustomAvailabilityRemoved { .. } => "custom_availability_removed",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructorInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub schedule_entries: usize,
    pub active_bookings: usize,
}
