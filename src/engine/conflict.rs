use crate::model::*;

use super::availability::working_windows;
use super::ConflictReason;

/// Wall-clock "now" in local business time. Only the outer layers call this;
/// the engine itself takes `now`/`today` as parameters.
pub fn local_now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Full check for a proposed booking, short-circuiting on the first failure:
/// range, then availability, then existing bookings.
pub(crate) fn validate_booking(state: &InstructorState, span: &Span) -> Result<(), ConflictReason> {
    if span.start >= span.end {
        return Err(ConflictReason::InvalidRange);
    }
    check_within_availability(state, span)?;
    check_no_double_booking(state, span)
}

/// The span must sit inside a single working window of its start date.
pub(crate) fn check_within_availability(state: &InstructorState, span: &Span) -> Result<(), ConflictReason> {
    let inside = working_windows(state, span.start.date())
        .iter()
        .any(|w| w.contains_span(span));
    if inside {
        Ok(())
    } else {
        Err(ConflictReason::OutsideAvailability)
    }
}

/// Any non-cancelled booking overlapping `span` is a conflict. Abutting is fine.
pub(crate) fn check_no_double_booking(state: &InstructorState, span: &Span) -> Result<(), ConflictReason> {
    for booking in state.overlapping_bookings(span) {
        if booking.is_active() && booking.span.overlaps(span) {
            return Err(ConflictReason::DoubleBooked(booking.id));
        }
    }
    Ok(())
}
