use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::generate_slots;
use super::conflict::validate_booking;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable slots per date for `[from, to]`. `duration_minutes` defaults
    /// to the policy's lesson length. Reads take no write lock; the booking
    /// writer re-validates, so a slightly stale answer is harmless.
    pub async fn available_slots(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration_minutes: Option<u32>,
    ) -> Result<BTreeMap<NaiveDate, Vec<Span>>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidDateRange);
        }
        let range = DateRange::new(from, to);
        if range.len_days() > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let minutes = duration_minutes.unwrap_or(self.policy.lesson_minutes);
        if minutes == 0 {
            return Err(EngineError::InvalidDuration);
        }
        if minutes > MAX_LESSON_MINUTES {
            return Err(EngineError::LimitExceeded("lesson too long"));
        }

        let guard = self.instructor_read(&instructor_id).await?;
        let slots = generate_slots(
            &guard,
            &range,
            Duration::minutes(minutes as i64),
            self.policy.buffer(),
        );
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        Ok(slots)
    }

    /// Slots for the policy's rolling window starting at `today`.
    pub async fn available_slots_from(
        &self,
        instructor_id: Ulid,
        today: NaiveDate,
        duration_minutes: Option<u32>,
    ) -> Result<BTreeMap<NaiveDate, Vec<Span>>, EngineError> {
        let (from, to) = self.policy.window_from(today);
        self.available_slots(instructor_id, from, to, duration_minutes).await
    }

    /// Would `[start, end)` be bookable right now? Ok(()) or the conflict reason.
    pub async fn validate_booking(
        &self,
        instructor_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<(), EngineError> {
        let guard = self.instructor_read(&instructor_id).await?;
        validate_booking(&guard, &Span { start, end }).map_err(EngineError::Conflict)
    }

    pub fn list_instructors(&self) -> Vec<InstructorInfo> {
        self.state
            .iter()
            .filter_map(|entry| {
                let st = entry.value().clone();
                // skip instructors mid-write rather than block the listing
                let guard = st.try_read().ok()?;
                Some(InstructorInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    schedule_entries: guard.schedule.len(),
                    active_bookings: guard.bookings.iter().filter(|b| b.is_active()).count(),
                })
            })
            .collect()
    }

    pub async fn list_schedule_entries(&self, instructor_id: Ulid) -> Result<Vec<WeeklyScheduleEntry>, EngineError> {
        let guard = self.instructor_read(&instructor_id).await?;
        Ok(guard.list_schedule_entries().to_vec())
    }

    pub async fn list_time_off(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TimeOffException>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidDateRange);
        }
        let guard = self.instructor_read(&instructor_id).await?;
        Ok(guard.list_time_off(&DateRange::new(from, to)).cloned().collect())
    }

    pub async fn list_custom_availability(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CustomAvailability>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidDateRange);
        }
        let guard = self.instructor_read(&instructor_id).await?;
        Ok(guard.list_custom_availability(&DateRange::new(from, to)).to_vec())
    }

    /// Non-cancelled bookings starting within `[from, to]`.
    pub async fn list_active_bookings(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidDateRange);
        }
        let guard = self.instructor_read(&instructor_id).await?;
        Ok(guard.list_active_bookings(&DateRange::new(from, to)).cloned().collect())
    }

    /// Every booking for the instructor, cancelled ones included.
    pub async fn get_bookings(&self, instructor_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let guard = self.instructor_read(&instructor_id).await?;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let instructor_id = self
            .get_instructor_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.instructor_read(&instructor_id).await?;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }
}
