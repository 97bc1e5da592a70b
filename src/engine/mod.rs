mod conflict;
mod error;
mod index;
mod queries;
mod reservations;
mod time_blocks;

pub use conflict::{check_availability, is_free};
pub use error::{ConflictError, EngineError, PartialCloseoutError, ValidationError};
pub use index::AvailabilityIndex;
pub use reservations::{
    CreateReservation, Rescheduled, plan_create, plan_move, plan_resize, plan_transition,
};
pub use time_blocks::{TimeBlockPlaced, affected_reservations, plan_time_block};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_LOCK_ATTEMPTS;
use crate::model::*;
use crate::notify::ScheduleHub;
use crate::observability;
use crate::store::ScheduleStore;

type TherapistGuard = OwnedMutexGuard<()>;

/// The only entry point allowed to accept or reject calendar writes.
///
/// Holds no calendar state of its own: every decision re-reads the affected
/// therapist's rows from the store and rebuilds the index, under that
/// therapist's lock, so read-decide-write is serialized per therapist.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    notify: Arc<ScheduleHub>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self::with_notify(store, Arc::new(ScheduleHub::new()))
    }

    pub fn with_notify(store: Arc<dyn ScheduleStore>, notify: Arc<ScheduleHub>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            notify,
        }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<ScheduleHub> {
        &self.notify
    }

    pub(crate) fn publish(&self, event: &Event) {
        self.notify.publish(event);
    }

    /// Acquire therapist locks in sorted id order so two cross-therapist
    /// moves can never deadlock each other.
    pub(super) async fn lock_therapists(&self, ids: &[Ulid]) -> Vec<TherapistGuard> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.locks.entry(id).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub(super) async fn load_rows(
        &self,
        therapist_id: Ulid,
    ) -> Result<(Vec<Reservation>, Vec<TimeBlock>), EngineError> {
        let reservations = self.store.reservations_for(therapist_id).await?;
        let blocks = self.store.time_blocks_for(therapist_id).await?;
        Ok((reservations, blocks))
    }

    pub(super) async fn load_index(&self, therapist_id: Ulid) -> Result<AvailabilityIndex, EngineError> {
        let (reservations, blocks) = self.load_rows(therapist_id).await?;
        Ok(AvailabilityIndex::build(therapist_id, &reservations, &blocks))
    }

    pub(super) async fn resolve_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Lock the reservation's current therapist (plus `also`, if given) and
    /// return the reservation as read under those locks.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
        also: Option<Ulid>,
    ) -> Result<(Reservation, Vec<TherapistGuard>), EngineError> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let seen = self.resolve_reservation(id).await?;
            let mut ids = vec![seen.therapist_id];
            ids.extend(also);
            let guards = self.lock_therapists(&ids).await;
            let current = self.resolve_reservation(id).await?;
            if current.therapist_id == seen.therapist_id {
                return Ok((current, guards));
            }
            debug!(reservation_id = %id, "reservation changed therapist while locking, retrying");
        }
        Err(EngineError::Contended(id))
    }
}

/// Time a decision, log rejections, count outcomes.
pub(crate) async fn observe<T>(
    op: &'static str,
    decision: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let started = Instant::now();
    let result = decision.await;
    if let Err(e) = &result {
        debug!(op, error = %e, "rejected");
    }
    observability::record_decision(op, &result, started);
    result
}
