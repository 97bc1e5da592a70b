use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::ValidationError;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;

/// Half-open interval `[start, end)` with `end > start` guaranteed.
///
/// The fields are private so a `Span` can only come out of a constructor that
/// enforces ordering. Deserialization goes through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSpan", into = "RawSpan")]
pub struct Span {
    start: Ms,
    end: Ms,
}

#[derive(Serialize, Deserialize)]
struct RawSpan {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawSpan> for Span {
    type Error = ValidationError;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::new(raw.start, raw.end)
    }
}

impl From<Span> for RawSpan {
    fn from(span: Span) -> Self {
        RawSpan {
            start: span.start,
            end: span.end,
        }
    }
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvertedSpan { start, end });
        }
        Ok(Self { start, end })
    }

    /// `[start, start + duration)`.
    pub fn starting_at(start: Ms, duration: Ms) -> Result<Self, ValidationError> {
        if duration <= 0 {
            return Err(ValidationError::NonPositiveDuration(duration));
        }
        let end = start
            .checked_add(duration)
            .ok_or(ValidationError::ShiftOverflow(duration))?;
        Ok(Self { start, end })
    }

    /// For callers that already hold `start < end` by construction
    /// (interval algebra over existing spans).
    pub(crate) fn from_ordered(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Whole minutes, rounded down.
    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Same duration, moved by `delta`.
    pub fn shift(&self, delta: Ms) -> Result<Self, ValidationError> {
        let start = self
            .start
            .checked_add(delta)
            .ok_or(ValidationError::ShiftOverflow(delta))?;
        let end = self
            .end
            .checked_add(delta)
            .ok_or(ValidationError::ShiftOverflow(delta))?;
        Ok(Self { start, end })
    }

    /// Same duration, starting at `start`.
    pub fn with_start(&self, start: Ms) -> Result<Self, ValidationError> {
        Span::starting_at(start, self.duration_ms())
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Active reservations occupy calendar space.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// `pending → confirmed → completed`, and `pending|confirmed → cancelled`.
    pub fn can_transition_to(self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Confirmed, Completed) | (Pending, Cancelled) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A service performed by a therapist for a client over a span.
/// Client, service and therapist are opaque ids owned by other systems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub therapist_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    /// Minor currency units.
    pub total_price: i64,
}

impl Reservation {
    pub fn start_time(&self) -> Ms {
        self.span.start()
    }

    pub fn end_time(&self) -> Ms {
        self.span.end()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

// ── Time blocks ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeBlockKind {
    Break,
    Vacation,
    SickLeave,
    Other,
}

impl fmt::Display for TimeBlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeBlockKind::Break => "BREAK",
            TimeBlockKind::Vacation => "VACATION",
            TimeBlockKind::SickLeave => "SICK_LEAVE",
            TimeBlockKind::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// Declared unavailability for one therapist. Every kind blocks bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBlock {
    pub id: Ulid,
    pub therapist_id: Ulid,
    pub span: Span,
    pub kind: TimeBlockKind,
    pub reason: Option<String>,
}

// ── Index entries ────────────────────────────────────────────────

/// What occupies an interval on a therapist's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// Reservation with its status at index build time.
    Booked(ReservationStatus),
    /// Staff-declared time block.
    Blocked(TimeBlockKind),
}

/// A single occupied interval, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn from_reservation(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            span: reservation.span,
            kind: IntervalKind::Booked(reservation.status),
        }
    }

    pub fn from_time_block(block: &TimeBlock) -> Self {
        Self {
            id: block.id,
            span: block.span,
            kind: IntervalKind::Blocked(block.kind),
        }
    }

    pub fn is_reservation(&self) -> bool {
        matches!(self.kind, IntervalKind::Booked(_))
    }

    pub fn is_time_block(&self) -> bool {
        matches!(self.kind, IntervalKind::Blocked(_))
    }

    /// Active reservations and every time block occupy the calendar.
    pub fn is_blocking(&self) -> bool {
        match self.kind {
            IntervalKind::Booked(status) => status.is_active(),
            IntervalKind::Blocked(_) => true,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IntervalKind::Booked(status) => {
                write!(f, "reservation {} ({status}) {}", self.id, self.span)
            }
            IntervalKind::Blocked(kind) => write!(f, "time block {} ({kind}) {}", self.id, self.span),
        }
    }
}

// ── Point of sale ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Service,
    Product,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub kind: LineKind,
    pub item_id: Ulid,
    /// Minor currency units.
    pub unit_price: i64,
    pub quantity: u32,
}

impl LineItem {
    /// `None` when price times quantity leaves `i64`.
    pub fn amount(&self) -> Option<i64> {
        self.unit_price.checked_mul(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Ulid,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    pub status: TransactionStatus,
    pub created_at: Ms,
}

impl Transaction {
    /// Sum of line amounts, `None` on overflow.
    pub fn total(&self) -> Option<i64> {
        self.items
            .iter()
            .try_fold(0i64, |acc, item| acc.checked_add(item.amount()?))
    }

    pub fn is_open(&self) -> bool {
        self.status == TransactionStatus::Open
    }
}

// ── Journal ──────────────────────────────────────────────────────

/// Every accepted mutation, flat. This is both the journal record format and
/// the change-feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        from_therapist_id: Ulid,
        therapist_id: Ulid,
        span: Span,
    },
    ReservationStatusChanged {
        id: Ulid,
        therapist_id: Ulid,
        status: ReservationStatus,
    },
    TimeBlockCreated {
        block: TimeBlock,
    },
    TimeBlockUpdated {
        block: TimeBlock,
    },
    TimeBlockDeleted {
        id: Ulid,
        therapist_id: Ulid,
    },
    TransactionRecorded {
        transaction: Transaction,
    },
    TransactionClosed {
        id: Ulid,
    },
}

impl Event {
    /// Therapists whose calendars this event touches.
    pub fn therapist_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ReservationCreated { reservation } => vec![reservation.therapist_id],
            Event::ReservationRescheduled {
                from_therapist_id,
                therapist_id,
                ..
            } => {
                if from_therapist_id == therapist_id {
                    vec![*therapist_id]
                } else {
                    vec![*from_therapist_id, *therapist_id]
                }
            }
            Event::ReservationStatusChanged { therapist_id, .. }
            | Event::TimeBlockDeleted { therapist_id, .. } => vec![*therapist_id],
            Event::TimeBlockCreated { block } | Event::TimeBlockUpdated { block } => {
                vec![block.therapist_id]
            }
            Event::TransactionRecorded { .. } | Event::TransactionClosed { .. } => Vec::new(),
        }
    }
}
