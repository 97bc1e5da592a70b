//! Persistence collaborator port.
//!
//! The engine decides; a store remembers. Anything that can load a
//! therapist's rows and apply single-row writes can back the scheduler.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal error: {0}")]
    Journal(#[from] std::io::Error),
    #[error("no such row: {0}")]
    Missing(Ulid),
    #[error("row already exists: {0}")]
    Duplicate(Ulid),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result of an atomic open → closed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call performed the transition.
    Closed,
    /// Someone else already closed it; nothing changed.
    AlreadyClosed,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Every reservation row for the therapist, any status.
    async fn reservations_for(&self, therapist_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Single write of therapist + start + end together.
    async fn reschedule_reservation(
        &self,
        id: Ulid,
        therapist_id: Ulid,
        span: Span,
    ) -> Result<(), StoreError>;

    async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<(), StoreError>;

    async fn time_block(&self, id: Ulid) -> Result<Option<TimeBlock>, StoreError>;

    async fn time_blocks_for(&self, therapist_id: Ulid) -> Result<Vec<TimeBlock>, StoreError>;

    async fn insert_time_block(&self, block: &TimeBlock) -> Result<(), StoreError>;

    async fn update_time_block(&self, block: &TimeBlock) -> Result<(), StoreError>;

    /// Returns the deleted row, `None` if it did not exist.
    async fn delete_time_block(&self, id: Ulid) -> Result<Option<TimeBlock>, StoreError>;

    async fn record_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    /// Transactions whose `created_at` falls inside `span`, any status.
    async fn transactions_created_within(&self, span: Span) -> Result<Vec<Transaction>, StoreError>;

    /// Atomic compare-and-set from open to closed.
    async fn close_transaction(&self, id: Ulid) -> Result<CloseOutcome, StoreError>;
}
