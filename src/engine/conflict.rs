use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Outcome of looking for a vehicle to put under a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VehicleFit {
    /// Index into the fleet of the first vehicle free for the whole span.
    Free(usize),
    /// Every vehicle is taken; carries a booking that blocks the first one.
    Exhausted(Ulid),
    NoFleet,
}

/// Walk the fleet in the order given (ascending id) and take the first
/// vehicle whose timeline has no active reservation overlapping `span`.
pub(crate) fn first_free_vehicle<'a>(
    fleet: impl IntoIterator<Item = &'a Timeline>,
    span: &Span,
) -> VehicleFit {
    let mut blocker = None;
    for (idx, timeline) in fleet.into_iter().enumerate() {
        match timeline.first_conflict(span) {
            None => return VehicleFit::Free(idx),
            Some(r) => {
                blocker.get_or_insert(r.booking_id);
            }
        }
    }
    match blocker {
        Some(booking_id) => VehicleFit::Exhausted(booking_id),
        None => VehicleFit::NoFleet,
    }
}
