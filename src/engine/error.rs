use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::store::StoreError;

/// Malformed input. Always recoverable by the caller; never a scheduling conflict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("span end {end} must be after start {start}")]
    InvertedSpan { start: Ms, end: Ms },
    #[error("duration must be positive, got {0} ms")]
    NonPositiveDuration(Ms),
    #[error("missing required reference: {0}")]
    MissingReference(&'static str),
    #[error("{field} too long: {len} > {max}")]
    TextTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("moving span by {0} ms overflows the time range")]
    ShiftOverflow(Ms),
    #[error("{field} must not be negative, got {amount}")]
    NegativeAmount { field: &'static str, amount: i64 },
    #[error("transaction has no line items")]
    EmptyTransaction,
    #[error("availability index belongs to therapist {index}, not {therapist_id}")]
    WrongIndex { index: Ulid, therapist_id: Ulid },
}

/// The candidate span overlaps active reservations or time blocks.
/// Carries every blocking entry so callers can say what it collides with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("therapist {therapist_id} is not free for {candidate}: conflicts with {}", describe(.conflicts))]
pub struct ConflictError {
    pub therapist_id: Ulid,
    pub candidate: Span,
    pub conflicts: Vec<Interval>,
}

impl ConflictError {
    pub fn conflicting_ids(&self) -> Vec<Ulid> {
        self.conflicts.iter().map(|c| c.id).collect()
    }
}

fn describe(conflicts: &[Interval]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Closeout computed a total but could not close every qualifying transaction.
/// Only `still_open` needs retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error(
    "closeout for {date} incomplete: computed {computed_total}, closed {closed_count} worth {closed_total}, {} still open ({cause})",
    .still_open.len()
)]
pub struct PartialCloseoutError {
    pub date: NaiveDate,
    pub computed_total: i64,
    pub closed_total: i64,
    pub closed_count: usize,
    pub closed_ids: Vec<Ulid>,
    pub still_open: Vec<Ulid>,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("reservation {id} is {status} and can no longer change")]
    Terminal { id: Ulid, status: ReservationStatus },
    #[error("reservation {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("reservation {0} was relocated concurrently; retry")]
    Contended(Ulid),
    #[error(transparent)]
    PartialCloseout(#[from] PartialCloseoutError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// HTTP status an API boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => 400,
            EngineError::NotFound(_) | EngineError::Terminal { .. } => 404,
            EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::Contended(_) => 409,
            EngineError::PartialCloseout(_) => 500,
            EngineError::Store(_) => 503,
        }
    }

    /// Short label for metrics.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "invalid",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) | EngineError::Terminal { .. } => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Contended(_) => "contended",
            EngineError::PartialCloseout(_) => "partial",
            EngineError::Store(_) => "store_error",
        }
    }

    pub fn as_conflict(&self) -> Option<&ConflictError> {
        match self {
            EngineError::Conflict(c) => Some(c),
            _ => None,
        }
    }
}
