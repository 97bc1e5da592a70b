use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{AvailabilityIndex, ConflictError, EngineError, ValidationError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start() < MIN_VALID_TIMESTAMP_MS || span.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_reference(id: Ulid, field: &'static str) -> Result<(), ValidationError> {
    if id.is_nil() {
        return Err(ValidationError::MissingReference(field));
    }
    Ok(())
}

pub(crate) fn validate_text(
    text: Option<&str>,
    field: &'static str,
    max: usize,
) -> Result<(), ValidationError> {
    match text {
        Some(t) if t.len() > max => Err(ValidationError::TextTooLong {
            field,
            len: t.len(),
            max,
        }),
        _ => Ok(()),
    }
}

/// Can the index's therapist take `candidate`?
///
/// Any overlap with an active reservation or a time block of any kind is a
/// hard conflict. `exclude` names a reservation being relocated; its own entry
/// is ignored so a move never collides with the slot it is vacating.
pub fn check_availability(
    index: &AvailabilityIndex,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), ConflictError> {
    let conflicts: Vec<Interval> = index
        .overlapping(candidate)
        .filter(|i| i.is_blocking())
        .filter(|i| !(i.is_reservation() && Some(i.id) == exclude))
        .cloned()
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(ConflictError {
            therapist_id: index.therapist_id(),
            candidate: *candidate,
            conflicts,
        })
    }
}

pub fn is_free(index: &AvailabilityIndex, candidate: &Span, exclude: Option<Ulid>) -> bool {
    check_availability(index, candidate, exclude).is_ok()
}
