use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn a start + duration into the booking's effective interval, rejecting
/// non-positive or oversized durations and out-of-range timestamps.
pub fn proposed_span(start: Ms, duration_minutes: i64) -> Result<Span, EngineError> {
    if duration_minutes <= 0 {
        return Err(EngineError::InvalidInterval(format!(
            "duration must be positive, got {duration_minutes} minutes"
        )));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::InvalidInterval(format!(
            "duration {duration_minutes} minutes exceeds {MAX_DURATION_MINUTES}"
        )));
    }
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::InvalidInterval(format!(
            "start {start} out of range"
        )));
    }
    match Span::from_minutes(start, duration_minutes) {
        Some(span) if span.end <= MAX_VALID_TIMESTAMP_MS => Ok(span),
        _ => Err(EngineError::InvalidInterval(format!(
            "start {start} plus {duration_minutes} minutes out of range"
        ))),
    }
}

/// Decide whether `[proposed_start, proposed_start + duration)` can be booked
/// for `practitioner_id` given `existing` bookings.
///
/// Bookings of other practitioners and cancelled bookings are ignored.
/// When several bookings conflict, the one with the earliest start wins
/// (ties broken by id) so the answer does not depend on input order.
pub fn check_availability(
    practitioner_id: Ulid,
    proposed_start: Ms,
    duration_minutes: i64,
    existing: &[Booking],
) -> Result<Option<Conflict>, EngineError> {
    let proposed = proposed_span(proposed_start, duration_minutes)?;
    Ok(first_conflict(
        existing
            .iter()
            .filter(|b| b.practitioner_id == practitioner_id),
        &proposed,
        None,
    ))
}

/// Earliest blocking booking overlapping `proposed`, skipping `exclude`.
pub(crate) fn first_conflict<'a>(
    bookings: impl Iterator<Item = &'a Booking>,
    proposed: &Span,
    exclude: Option<Ulid>,
) -> Option<Conflict> {
    bookings
        .filter(|b| b.is_blocking() && Some(b.id) != exclude)
        .filter(|b| proposed.start < b.span.end && proposed.end > b.span.start)
        .min_by_key(|b| (b.span.start, b.id))
        .map(|b| Conflict {
            booking_id: b.id,
            span: b.span,
        })
}

/// Fail with `SchedulingConflict` if `span` collides with any blocking
/// booking of the locked practitioner.
pub(crate) fn check_no_conflict(
    ps: &PractitionerState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(ps.overlapping(span), span, exclude) {
        Some(conflict) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                "conflict for practitioner {}: [{}, {}) blocked by {}",
                ps.id,
                span.start,
                span.end,
                conflict.booking_id
            );
            Err(EngineError::SchedulingConflict {
                booking_id: conflict.booking_id,
                span: conflict.span,
            })
        }
        None => Ok(()),
    }
}
