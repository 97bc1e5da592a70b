use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_reference, validate_span, validate_text};
use super::{EngineError, Scheduler, observe};

/// A stored time block and the active reservations it now overlaps.
/// Blocks are accepted regardless; `affected` is for warning staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBlockPlaced {
    pub block: TimeBlock,
    pub affected: Vec<Reservation>,
}

pub fn plan_time_block(
    id: Ulid,
    therapist_id: Ulid,
    span: Span,
    kind: TimeBlockKind,
    reason: Option<String>,
) -> Result<TimeBlock, EngineError> {
    validate_reference(therapist_id, "therapist_id")?;
    validate_text(reason.as_deref(), "reason", MAX_REASON_LEN)?;
    validate_span(&span)?;
    Ok(TimeBlock {
        id,
        therapist_id,
        span,
        kind,
        reason,
    })
}

/// Active reservations of `therapist_id` overlapping `span`, start-sorted.
pub fn affected_reservations(
    reservations: &[Reservation],
    therapist_id: Ulid,
    span: &Span,
) -> Vec<Reservation> {
    let mut hits: Vec<Reservation> = reservations
        .iter()
        .filter(|r| r.therapist_id == therapist_id && r.is_active() && r.span.overlaps(span))
        .cloned()
        .collect();
    hits.sort_by_key(|r| (r.start_time(), r.id));
    hits
}

impl Scheduler {
    /// Mark a therapist unavailable. Does not reject on existing reservations.
    pub async fn create_time_block(
        &self,
        therapist_id: Ulid,
        span: Span,
        kind: TimeBlockKind,
        reason: Option<String>,
    ) -> Result<TimeBlockPlaced, EngineError> {
        observe(
            "create_time_block",
            self.create_time_block_inner(therapist_id, span, kind, reason),
        )
        .await
    }

    async fn create_time_block_inner(
        &self,
        therapist_id: Ulid,
        span: Span,
        kind: TimeBlockKind,
        reason: Option<String>,
    ) -> Result<TimeBlockPlaced, EngineError> {
        let block = plan_time_block(Ulid::new(), therapist_id, span, kind, reason)?;
        let _guards = self.lock_therapists(&[therapist_id]).await;
        let (reservations, blocks) = self.load_rows(therapist_id).await?;
        if reservations.len() + blocks.len() >= MAX_INTERVALS_PER_THERAPIST {
            return Err(EngineError::LimitExceeded("too many intervals on therapist"));
        }

        self.store.insert_time_block(&block).await?;
        self.publish(&Event::TimeBlockCreated {
            block: block.clone(),
        });
        let affected = affected_reservations(&reservations, therapist_id, &block.span);
        log_placed(&block, &affected, "time block created");
        Ok(TimeBlockPlaced { block, affected })
    }

    /// Replace a block's span, kind and reason. The therapist never changes.
    pub async fn update_time_block(
        &self,
        id: Ulid,
        span: Span,
        kind: TimeBlockKind,
        reason: Option<String>,
    ) -> Result<TimeBlockPlaced, EngineError> {
        observe(
            "update_time_block",
            self.update_time_block_inner(id, span, kind, reason),
        )
        .await
    }

    async fn update_time_block_inner(
        &self,
        id: Ulid,
        span: Span,
        kind: TimeBlockKind,
        reason: Option<String>,
    ) -> Result<TimeBlockPlaced, EngineError> {
        let existing = self
            .store
            .time_block(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        let block = plan_time_block(id, existing.therapist_id, span, kind, reason)?;
        let _guards = self.lock_therapists(&[existing.therapist_id]).await;

        self.store.update_time_block(&block).await.map_err(|e| match e {
            crate::store::StoreError::Missing(id) => EngineError::NotFound(id),
            other => other.into(),
        })?;
        self.publish(&Event::TimeBlockUpdated {
            block: block.clone(),
        });
        let reservations = self.store.reservations_for(block.therapist_id).await?;
        let affected = affected_reservations(&reservations, block.therapist_id, &block.span);
        log_placed(&block, &affected, "time block updated");
        Ok(TimeBlockPlaced { block, affected })
    }

    /// Remove a block, freeing its span. Always allowed.
    pub async fn delete_time_block(&self, id: Ulid) -> Result<TimeBlock, EngineError> {
        observe("delete_time_block", self.delete_time_block_inner(id)).await
    }

    async fn delete_time_block_inner(&self, id: Ulid) -> Result<TimeBlock, EngineError> {
        let existing = self
            .store
            .time_block(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        let _guards = self.lock_therapists(&[existing.therapist_id]).await;

        let deleted = self
            .store
            .delete_time_block(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        self.publish(&Event::TimeBlockDeleted {
            id,
            therapist_id: deleted.therapist_id,
        });
        info!(time_block_id = %id, therapist_id = %deleted.therapist_id, "time block deleted");
        Ok(deleted)
    }

    /// Reservations a block over `span` would collide with, for warning staff
    /// before (or after) placing it.
    pub async fn find_affected_reservations(
        &self,
        therapist_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, EngineError> {
        let reservations = self.store.reservations_for(therapist_id).await?;
        Ok(affected_reservations(&reservations, therapist_id, &span))
    }
}

fn log_placed(block: &TimeBlock, affected: &[Reservation], message: &'static str) {
    info!(
        time_block_id = %block.id,
        therapist_id = %block.therapist_id,
        kind = %block.kind,
        span = %block.span,
        "{message}"
    );
    if !affected.is_empty() {
        warn!(
            time_block_id = %block.id,
            affected = affected.len(),
            "time block overlaps existing reservations"
        );
    }
}
