use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_booking;
use super::{ConflictReason, Engine, EngineError, WalCommand};

fn check_times(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start < end {
        Ok(())
    } else {
        Err(EngineError::InvalidTimeRange)
    }
}

fn check_capacity(st: &InstructorState) -> Result<(), EngineError> {
    if st.entity_count() >= MAX_ENTITIES_PER_INSTRUCTOR {
        return Err(EngineError::LimitExceeded("too many entries for instructor"));
    }
    Ok(())
}

impl Engine {
    // ── Instructors ──────────────────────────────────────────

    pub async fn register_instructor(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("instructor name too long"));
        }
        let _registry = self.registry.write().await;
        if self.state.len() >= MAX_INSTRUCTORS {
            return Err(EngineError::LimitExceeded("too many instructors"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::InstructorRegistered { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(InstructorState::new(id, name))));
        self.notify.send(id, &event);
        info!(instructor = %id, "instructor registered");
        Ok(())
    }

    /// Removal is refused while the instructor still has non-cancelled bookings.
    pub async fn remove_instructor(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.write().await;
        let guard = self.instructor_write(&id).await?;
        if guard.has_active_bookings() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::InstructorRemoved { id };
        self.wal_append(&event).await?;
        self.forget_entities(&guard);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(instructor = %id, "instructor removed");
        Ok(())
    }

    // ── Weekly schedule ──────────────────────────────────────

    pub async fn add_schedule_entry(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    ) -> Result<(), EngineError> {
        check_times(start, end)?;
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.instructor_write(&instructor_id).await?;
        check_capacity(&guard)?;
        if guard.schedule_entry_for(day).is_some() {
            return Err(EngineError::DuplicateScheduleDay(day));
        }

        let entry = WeeklyScheduleEntry { id, instructor_id, day, start, end, active };
        self.persist_and_apply(&mut guard, &Event::ScheduleEntrySet { entry }).await
    }

    /// Replace the day, hours and active flag of an existing entry.
    pub async fn update_schedule_entry(
        &self,
        id: Ulid,
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    ) -> Result<Ulid, EngineError> {
        check_times(start, end)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.schedule.iter().any(|e| e.id == id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.schedule_entry_for(day).is_some_and(|e| e.id != id) {
            return Err(EngineError::DuplicateScheduleDay(day));
        }

        let instructor_id = guard.id;
        let entry = WeeklyScheduleEntry { id, instructor_id, day, start, end, active };
        self.persist_and_apply(&mut guard, &Event::ScheduleEntrySet { entry }).await?;
        Ok(instructor_id)
    }

    pub async fn set_schedule_entry_active(&self, id: Ulid, active: bool) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let mut entry = guard
            .schedule
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        entry.active = active;
        let instructor_id = guard.id;
        self.persist_and_apply(&mut guard, &Event::ScheduleEntrySet { entry }).await?;
        Ok(instructor_id)
    }

    pub async fn remove_schedule_entry(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.schedule.iter().any(|e| e.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let instructor_id = guard.id;
        let event = Event::ScheduleEntryRemoved { id, instructor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(instructor_id)
    }

    // ── Time off ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn add_time_off(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        if start_date > end_date {
            return Err(EngineError::InvalidDateRange);
        }
        if (end_date - start_date).num_days() >= MAX_TIME_OFF_DAYS {
            return Err(EngineError::LimitExceeded("time off period too long"));
        }
        match (start_time, end_time) {
            (None, None) => {}
            (Some(s), Some(e)) => check_times(s, e)?,
            _ => return Err(EngineError::InvalidTimeRange),
        }
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.instructor_write(&instructor_id).await?;
        check_capacity(&guard)?;

        let exception = TimeOffException {
            id,
            instructor_id,
            start_date,
            end_date,
            start_time,
            end_time,
            reason,
        };
        self.persist_and_apply(&mut guard, &Event::TimeOffAdded { exception }).await
    }

    pub async fn remove_time_off(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.time_off.iter().any(|t| t.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let instructor_id = guard.id;
        let event = Event::TimeOffRemoved { id, instructor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(instructor_id)
    }

    // ── Custom availability ──────────────────────────────────

    pub async fn add_custom_availability(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    ) -> Result<(), EngineError> {
        check_times(start, end)?;
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.instructor_write(&instructor_id).await?;
        check_capacity(&guard)?;
        if guard.custom_for(date).is_some() {
            return Err(EngineError::DuplicateCustomDate(date));
        }

        let entry = CustomAvailability { id, instructor_id, date, start, end, active };
        self.persist_and_apply(&mut guard, &Event::CustomAvailabilitySet { entry }).await
    }

    pub async fn update_custom_availability(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    ) -> Result<Ulid, EngineError> {
        check_times(start, end)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.custom.iter().any(|c| c.id == id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.custom_for(date).is_some_and(|c| c.id != id) {
            return Err(EngineError::DuplicateCustomDate(date));
        }

        let instructor_id = guard.id;
        let entry = CustomAvailability { id, instructor_id, date, start, end, active };
        self.persist_and_apply(&mut guard, &Event::CustomAvailabilitySet { entry }).await?;
        Ok(instructor_id)
    }

    pub async fn remove_custom_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.custom.iter().any(|c| c.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let instructor_id = guard.id;
        let event = Event::CustomAvailabilityRemoved { id, instructor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(instructor_id)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Create a pending booking for `[start, start + duration_minutes)`.
    ///
    /// Validation runs against live state while the instructor's write lock is
    /// held, so two students racing for the same slot can't both succeed.
    /// Nothing is written unless every check passes.
    pub async fn create_booking(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        student_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: u32,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        if duration_minutes > MAX_LESSON_MINUTES {
            return Err(EngineError::LimitExceeded("lesson too long"));
        }
        if self.entity_to_instructor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let end = start
            .checked_add_signed(Duration::minutes(duration_minutes as i64))
            .ok_or(EngineError::Conflict(ConflictReason::InvalidRange))?;
        let span = Span { start, end };

        let mut guard = self.instructor_write(&instructor_id).await?;
        check_capacity(&guard)?;

        if let Err(reason) = validate_booking(&guard, &span) {
            return Err(self.reject_booking(instructor_id, reason));
        }
        // Storage exclusion backstop, checked before anything reaches the WAL.
        if let Some(other) = guard.exclusion_conflict(&span) {
            return Err(self.reject_booking(instructor_id, ConflictReason::StorageConflict(other)));
        }

        let booking = Booking {
            id,
            instructor_id,
            student_id,
            span,
            status: BookingStatus::Pending,
            created_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking = %id, instructor = %instructor_id, student = %student_id, start = %start, "booking created");
        Ok(booking)
    }

    fn reject_booking(&self, instructor_id: Ulid, reason: ConflictReason) -> EngineError {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL, "reason" => reason.label())
            .increment(1);
        warn!(instructor = %instructor_id, "booking rejected: {reason}");
        EngineError::Conflict(reason)
    }

    /// Move a booking to `status`, enforcing the allowed transitions.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?.status;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from: current, to: status });
        }

        let instructor_id = guard.id;
        let event = Event::BookingStatusChanged { id, instructor_id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(booking = %id, "booking {current} -> {status}");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Confirmed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Completed).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        // The registry gate and every read guard stay held until the swap
        // completes, so no write can land in the old file after the snapshot.
        let registry = self.registry.write().await;
        let instructors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(instructors.len());
        for st in instructors {
            guards.push(st.read_owned().await);
        }
        for guard in &guards {
            if !seen.insert(guard.id) {
                continue;
            }
            events.push(Event::InstructorRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(
                guard
                    .schedule
                    .iter()
                    .map(|entry| Event::ScheduleEntrySet { entry: entry.clone() }),
            );
            events.extend(
                guard
                    .time_off
                    .iter()
                    .map(|exception| Event::TimeOffAdded { exception: exception.clone() }),
            );
            events.extend(
                guard
                    .custom
                    .iter()
                    .map(|entry| Event::CustomAvailabilitySet { entry: entry.clone() }),
            );
            // Bookings carry their current status, cancelled ones included.
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|booking| Event::BookingCreated { booking: booking.clone() }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        drop(registry);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
