use crate::model::*;

use super::EngineError;

/// Build a span from caller input, rejecting empty or out-of-range intervals.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if start >= end {
        return Err(EngineError::Validation("interval must end after it starts".into()));
    }
    Ok(Span::new(start, end))
}

/// First slot that occupies any part of `span` at time `now`.
///
/// Occupying means Confirmed, or Pending and not yet expired. Expired claims
/// are inert whether or not reclamation has removed them yet.
pub(crate) fn find_conflict<'a>(
    vs: &'a VehicleSlots,
    span: &Span,
    now: Ms,
) -> Option<&'a ReservationSlot> {
    vs.overlapping(span)
        .find(|slot| slot.state(now).blocks())
}

pub(crate) fn check_no_conflict(vs: &VehicleSlots, span: &Span, now: Ms) -> Result<(), EngineError> {
    match find_conflict(vs, span, now) {
        Some(slot) => Err(EngineError::Conflict {
            vehicle_id: vs.vehicle_id,
            slot_id: slot.id,
        }),
        None => Ok(()),
    }
}
