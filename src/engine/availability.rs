use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};

use crate::model::*;

use super::conflict::check_no_double_booking;

// ── Working windows ──────────────────────────────────────────────

/// Free working time on `date`, before bookings are taken into account.
///
/// Custom availability OVERRIDES: an active entry for the date replaces the
/// weekly entry outright, even if narrower. Time-off ACCUMULATES: every
/// exception touching the date is subtracted.
pub fn working_windows(state: &InstructorState, date: NaiveDate) -> Vec<Span> {
    let base = match state.custom_for(date).filter(|c| c.active) {
        Some(custom) => Span::on_date(date, custom.start, custom.end),
        None => match state.schedule_entry_for(date.weekday()).filter(|e| e.active) {
            Some(entry) => Span::on_date(date, entry.start, entry.end),
            None => return Vec::new(),
        },
    };

    let day = DateRange::new(date, date);
    let mut blocked: Vec<Span> = state
        .list_time_off(&day)
        .filter_map(|t| t.blocked_on(date))
        .collect();
    if blocked.is_empty() {
        return vec![base];
    }
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&[base], &blocked)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Slot generation ──────────────────────────────────────────────

/// Fixed-length candidates inside `window`, spaced `duration + buffer` apart.
pub fn candidate_slots(window: &Span, duration: Duration, buffer: Duration) -> Vec<Span> {
    let mut slots = Vec::new();
    if duration <= Duration::zero() {
        return slots;
    }
    let mut t = window.start;
    while let Some(end) = t.checked_add_signed(duration).filter(|end| *end <= window.end) {
        slots.push(Span::new(t, end));
        match end.checked_add_signed(buffer) {
            Some(next) => t = next,
            None => break,
        }
    }
    slots
}

/// Bookable slots per date for one instructor over an inclusive date range.
///
/// Every date in range is present in the result, with an empty list when
/// nothing is bookable. Candidates that collide with a non-cancelled booking
/// are dropped silently; the walk is not re-aligned around them.
pub fn generate_slots(
    state: &InstructorState,
    range: &DateRange,
    duration: Duration,
    buffer: Duration,
) -> BTreeMap<NaiveDate, Vec<Span>> {
    let mut out = BTreeMap::new();
    for date in range.days() {
        let mut slots = Vec::new();
        for window in working_windows(state, date) {
            for candidate in candidate_slots(&window, duration, buffer) {
                if check_no_double_booking(state, &candidate).is_ok() {
                    slots.push(candidate);
                }
            }
        }
        out.insert(date, slots);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, NaiveTime, Weekday};
    use ulid::Ulid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_time(t(h, m))
    }

    // 2025-03-03 is a Monday.
    fn monday() -> NaiveDate {
        d(2025, 3, 3)
    }

    fn instructor_with_week(day: Weekday, start: NaiveTime, end: NaiveTime) -> InstructorState {
        let mut st = InstructorState::new(Ulid::new(), None);
        st.upsert_schedule_entry(WeeklyScheduleEntry {
            id: Ulid::new(),
            instructor_id: st.id,
            day,
            start,
            end,
            active: true,
        });
        st
    }

    fn add_booking(st: &mut InstructorState, span: Span, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        st.insert_booking(Booking {
            id,
            instructor_id: st.id,
            student_id: Ulid::new(),
            span,
            status,
            created_at: span.start,
        })
        .unwrap();
        id
    }

    fn add_time_off(st: &mut InstructorState, from: NaiveDate, to: NaiveDate, times: Option<(NaiveTime, NaiveTime)>) {
        st.insert_time_off(TimeOffException {
            id: Ulid::new(),
            instructor_id: st.id,
            start_date: from,
            end_date: to,
            start_time: times.map(|x| x.0),
            end_time: times.map(|x| x.1),
            reason: None,
        });
    }

    fn slots_on(st: &InstructorState, date: NaiveDate) -> Vec<Span> {
        let out = generate_slots(st, &DateRange::new(date, date), Duration::minutes(60), Duration::minutes(15));
        out[&date].clone()
    }

    // ── subtract_intervals / merge_overlapping ────────────

    #[test]
    fn subtract_middle_punch() {
        let m = monday();
        let base = vec![Span::new(at(m, 8, 0), at(m, 17, 0))];
        let remove = vec![Span::new(at(m, 12, 0), at(m, 13, 0))];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(
            result,
            vec![Span::new(at(m, 8, 0), at(m, 12, 0)), Span::new(at(m, 13, 0), at(m, 17, 0))]
        );
    }

    #[test]
    fn subtract_full_overlap() {
        let m = monday();
        let base = vec![Span::new(at(m, 8, 0), at(m, 12, 0))];
        let remove = vec![Span::new(at(m, 0, 0), at(m, 23, 0))];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_no_overlap() {
        let m = monday();
        let base = vec![Span::new(at(m, 8, 0), at(m, 12, 0))];
        let remove = vec![Span::new(at(m, 12, 0), at(m, 13, 0))];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let m = monday();
        let spans = vec![
            Span::new(at(m, 9, 0), at(m, 10, 0)),
            Span::new(at(m, 10, 0), at(m, 11, 0)),
            Span::new(at(m, 10, 30), at(m, 12, 0)),
            Span::new(at(m, 14, 0), at(m, 15, 0)),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(at(m, 9, 0), at(m, 12, 0)), Span::new(at(m, 14, 0), at(m, 15, 0))]
        );
    }

    // ── candidate_slots ───────────────────────────────────

    #[test]
    fn candidates_advance_by_duration_plus_buffer() {
        let m = monday();
        let window = Span::new(at(m, 8, 0), at(m, 12, 0));
        let slots = candidate_slots(&window, Duration::minutes(60), Duration::minutes(15));
        assert_eq!(
            slots,
            vec![
                Span::new(at(m, 8, 0), at(m, 9, 0)),
                Span::new(at(m, 9, 15), at(m, 10, 15)),
                Span::new(at(m, 10, 30), at(m, 11, 30)),
            ]
        );
    }

    #[test]
    fn candidate_may_end_exactly_at_window_end() {
        let m = monday();
        let window = Span::new(at(m, 8, 0), at(m, 10, 15));
        let slots = candidate_slots(&window, Duration::minutes(60), Duration::minutes(15));
        assert_eq!(slots.last().unwrap().end, at(m, 10, 15));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn window_shorter_than_lesson_yields_nothing() {
        let m = monday();
        let window = Span::new(at(m, 8, 0), at(m, 8, 45));
        assert!(candidate_slots(&window, Duration::minutes(60), Duration::minutes(15)).is_empty());
    }

    #[test]
    fn zero_buffer_packs_back_to_back() {
        let m = monday();
        let window = Span::new(at(m, 8, 0), at(m, 10, 0));
        let slots = candidate_slots(&window, Duration::minutes(30), Duration::zero());
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[1].start, slots[0].end);
    }

    // ── generate_slots ────────────────────────────────────

    #[test]
    fn monday_morning_scenario() {
        let st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        let m = monday();
        assert_eq!(
            slots_on(&st, m),
            vec![
                Span::new(at(m, 8, 0), at(m, 9, 0)),
                Span::new(at(m, 9, 15), at(m, 10, 15)),
                Span::new(at(m, 10, 30), at(m, 11, 30)),
            ]
        );
    }

    #[test]
    fn every_date_present_even_when_empty() {
        let st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        let range = DateRange::new(monday(), d(2025, 3, 9));
        let out = generate_slots(&st, &range, Duration::minutes(60), Duration::minutes(15));
        assert_eq!(out.len(), 7);
        assert_eq!(out[&monday()].len(), 3);
        for date in range.days().skip(1) {
            assert!(out[&date].is_empty(), "{date} should be empty");
        }
    }

    #[test]
    fn inactive_weekly_entry_gives_no_slots() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        st.schedule[0].active = false;
        assert!(slots_on(&st, monday()).is_empty());
    }

    #[test]
    fn custom_override_replaces_weekly_pattern() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(17, 0));
        st.upsert_custom_availability(CustomAvailability {
            id: Ulid::new(),
            instructor_id: st.id,
            date: monday(),
            start: t(10, 0),
            end: t(12, 0),
            active: true,
        });
        let m = monday();
        let window = Span::new(at(m, 10, 0), at(m, 12, 0));
        let slots = slots_on(&st, m);
        assert!(!slots.is_empty());
        for s in &slots {
            assert!(window.contains_span(s), "{s:?} escapes the custom window");
        }
        // the following Monday still follows the weekly pattern
        let next = d(2025, 3, 10);
        assert_eq!(slots_on(&st, next).first().unwrap().start, at(next, 8, 0));
    }

    #[test]
    fn inactive_custom_falls_back_to_weekly() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        st.upsert_custom_availability(CustomAvailability {
            id: Ulid::new(),
            instructor_id: st.id,
            date: monday(),
            start: t(10, 0),
            end: t(12, 0),
            active: false,
        });
        assert_eq!(slots_on(&st, monday()).len(), 3);
    }

    #[test]
    fn custom_availability_on_unscheduled_day() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        let saturday = d(2025, 3, 8);
        st.upsert_custom_availability(CustomAvailability {
            id: Ulid::new(),
            instructor_id: st.id,
            date: saturday,
            start: t(9, 0),
            end: t(11, 0),
            active: true,
        });
        assert_eq!(slots_on(&st, saturday), vec![Span::new(at(saturday, 9, 0), at(saturday, 10, 0))]);
    }

    #[test]
    fn full_day_time_off_zeroes_date() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(17, 0));
        add_time_off(&mut st, monday(), monday(), None);
        let out = generate_slots(&st, &DateRange::new(monday(), monday()), Duration::minutes(60), Duration::minutes(15));
        assert!(out.contains_key(&monday()));
        assert!(out[&monday()].is_empty());
    }

    #[test]
    fn time_off_also_blocks_custom_availability() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(17, 0));
        st.upsert_custom_availability(CustomAvailability {
            id: Ulid::new(),
            instructor_id: st.id,
            date: monday(),
            start: t(10, 0),
            end: t(12, 0),
            active: true,
        });
        add_time_off(&mut st, d(2025, 3, 1), d(2025, 3, 5), None);
        assert!(slots_on(&st, monday()).is_empty());
    }

    #[test]
    fn partial_time_off_carves_window() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(14, 0));
        add_time_off(&mut st, monday(), monday(), Some((t(10, 0), t(12, 0))));
        let m = monday();
        // 08:00-10:00 → one slot; 12:00-14:00 → one slot, restarting at 12:00
        assert_eq!(
            slots_on(&st, m),
            vec![Span::new(at(m, 8, 0), at(m, 9, 0)), Span::new(at(m, 12, 0), at(m, 13, 0))]
        );
    }

    #[test]
    fn overlapping_time_off_merged() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        add_time_off(&mut st, monday(), monday(), Some((t(8, 0), t(9, 30))));
        add_time_off(&mut st, monday(), monday(), Some((t(9, 0), t(10, 30))));
        let m = monday();
        assert_eq!(slots_on(&st, m), vec![Span::new(at(m, 10, 30), at(m, 11, 30))]);
    }

    #[test]
    fn bookings_remove_overlapping_candidates() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        let m = monday();
        let booked = Span::new(at(m, 9, 30), at(m, 10, 0));
        add_booking(&mut st, booked, BookingStatus::Confirmed);
        let slots = slots_on(&st, m);
        assert_eq!(
            slots,
            vec![Span::new(at(m, 8, 0), at(m, 9, 0)), Span::new(at(m, 10, 30), at(m, 11, 30))]
        );
        assert!(slots.iter().all(|s| !s.overlaps(&booked)));
    }

    #[test]
    fn cancelled_bookings_free_their_slot() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(12, 0));
        let m = monday();
        add_booking(&mut st, Span::new(at(m, 9, 15), at(m, 10, 15)), BookingStatus::Cancelled);
        assert_eq!(slots_on(&st, m).len(), 3);
    }

    #[test]
    fn slots_are_ordered_disjoint_and_buffered() {
        let mut st = instructor_with_week(Weekday::Mon, t(7, 0), t(19, 0));
        add_time_off(&mut st, monday(), monday(), Some((t(12, 0), t(12, 40))));
        let slots = slots_on(&st, monday());
        assert!(slots.len() > 4);
        for pair in slots.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(a.end <= b.start);
            assert!(!a.overlaps(&b));
        }
        // inside one uninterrupted window the gap is exactly the buffer
        let morning: Vec<_> = slots.iter().filter(|s| s.end.time() <= t(12, 0)).collect();
        for pair in morning.windows(2) {
            assert_eq!(pair[1].start - pair[0].end, Duration::minutes(15));
        }
    }

    #[test]
    fn generation_is_idempotent() {
        let mut st = instructor_with_week(Weekday::Mon, t(8, 0), t(17, 0));
        let m = monday();
        add_booking(&mut st, Span::new(at(m, 10, 0), at(m, 11, 0)), BookingStatus::Pending);
        let range = DateRange::new(m, d(2025, 3, 16));
        let a = generate_slots(&st, &range, Duration::minutes(60), Duration::minutes(15));
        let b = generate_slots(&st, &range, Duration::minutes(60), Duration::minutes(15));
        assert_eq!(a, b);
    }

    #[test]
    fn duration_plus_buffer_longer_than_window_is_not_an_error() {
        let st = instructor_with_week(Weekday::Mon, t(8, 0), t(9, 0));
        let out = generate_slots(&st, &DateRange::new(monday(), monday()), Duration::minutes(90), Duration::minutes(15));
        assert!(out[&monday()].is_empty());
    }

    #[test]
    fn candidates_stop_at_last_representable_instant() {
        let end = NaiveDateTime::MAX;
        let start = end.checked_sub_signed(Duration::minutes(120)).unwrap();
        let slots = candidate_slots(&Span::new(start, end), Duration::minutes(60), Duration::minutes(15));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start, start);
    }
}
