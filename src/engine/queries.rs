use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_availability;
use super::{AvailabilityIndex, EngineError, Scheduler};

fn check_window(window: &Span) -> Result<(), EngineError> {
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Scheduler {
    /// Current index for a therapist, rebuilt from the store.
    pub async fn index(&self, therapist_id: Ulid) -> Result<AvailabilityIndex, EngineError> {
        self.load_index(therapist_id).await
    }

    /// Everything occupying the therapist's calendar inside `window`, start-sorted.
    pub async fn agenda(&self, therapist_id: Ulid, window: Span) -> Result<Vec<Interval>, EngineError> {
        check_window(&window)?;
        let index = self.load_index(therapist_id).await?;
        Ok(index.query(&window))
    }

    /// Bookable gaps inside `window`.
    pub async fn free_slots(
        &self,
        therapist_id: Ulid,
        window: Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(&window)?;
        let index = self.load_index(therapist_id).await?;
        Ok(index.free_slots(&window, min_duration))
    }

    /// Preview a decision without writing: would `candidate` be accepted?
    /// Advisory only, the answer can change before a subsequent write.
    pub async fn check(
        &self,
        therapist_id: Ulid,
        candidate: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let index = self.load_index(therapist_id).await?;
        check_availability(&index, &candidate, exclude)?;
        Ok(())
    }
}
