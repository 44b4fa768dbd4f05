use crate::model::*;

// ── Free-slot algorithm ───────────────────────────────────────────

/// Gaps inside `window` not covered by any blocking booking of the practitioner.
/// Gaps shorter than `min_duration` are dropped.
pub fn free_slots(practitioner: &PractitionerState, window: &Span, min_duration: Option<Ms>) -> Vec<Span> {
    let mut busy: Vec<Span> = practitioner
        .overlapping(window)
        .filter(|b| b.is_blocking())
        .map(|b| b.span)
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let mut free = subtract_intervals(&[*window], &busy);
    if let Some(min) = min_duration {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove every span of `to_remove` (sorted, disjoint) from `base` (sorted).
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn practitioner(spans: &[(Ms, Ms, BookingStatus)]) -> PractitionerState {
        let mut ps = PractitionerState::new(Ulid::new(), None);
        for &(start, end, status) in spans {
            ps.insert_booking(Booking {
                id: Ulid::new(),
                practitioner_id: ps.id,
                subject_id: Ulid::new(),
                span: Span::new(start, end),
                status,
                notes: None,
            });
        }
        ps
    }

    #[test]
    fn empty_agenda_is_fully_free() {
        let ps = practitioner(&[]);
        assert_eq!(free_slots(&ps, &Span::new(0, 1000), None), vec![Span::new(0, 1000)]);
    }

    #[test]
    fn bookings_are_carved_out() {
        let ps = practitioner(&[
            (100, 200, BookingStatus::Scheduled),
            (400, 500, BookingStatus::Confirmed),
        ]);
        assert_eq!(
            free_slots(&ps, &Span::new(0, 1000), None),
            vec![Span::new(0, 100), Span::new(200, 400), Span::new(500, 1000)]
        );
    }

    #[test]
    fn cancelled_bookings_leave_the_slot_free() {
        let ps = practitioner(&[(100, 200, BookingStatus::Cancelled)]);
        assert_eq!(free_slots(&ps, &Span::new(0, 1000), None), vec![Span::new(0, 1000)]);
    }

    #[test]
    fn bookings_straddling_the_window_are_clipped() {
        let ps = practitioner(&[
            (0, 150, BookingStatus::Scheduled),
            (900, 1200, BookingStatus::Scheduled),
        ]);
        assert_eq!(
            free_slots(&ps, &Span::new(100, 1000), None),
            vec![Span::new(150, 900)]
        );
    }

    #[test]
    fn min_duration_drops_short_gaps() {
        let ps = practitioner(&[
            (100, 200, BookingStatus::Scheduled),
            (250, 500, BookingStatus::Scheduled),
        ]);
        assert_eq!(
            free_slots(&ps, &Span::new(0, 1000), Some(100)),
            vec![Span::new(0, 100), Span::new(500, 1000)]
        );
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[
            Span::new(0, 100),
            Span::new(100, 200),
            Span::new(150, 300),
            Span::new(400, 500),
        ]);
        assert_eq!(merged, vec![Span::new(0, 300), Span::new(400, 500)]);
    }

    #[test]
    fn subtract_fully_covered_base() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(0, 300)]);
        assert!(result.is_empty());
    }
}
