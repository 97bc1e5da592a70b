use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_availability, validate_reference, validate_span, validate_text};
use super::{AvailabilityIndex, EngineError, Scheduler, ValidationError, observe};

/// A booking request. Duration and price come from the service catalogue;
/// the engine takes them as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReservation {
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub therapist_id: Ulid,
    pub start_time: Ms,
    pub duration: Ms,
    pub price: i64,
    pub notes: Option<String>,
}

/// An accepted relocation, old value and new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rescheduled {
    pub before: Reservation,
    pub after: Reservation,
}

fn ensure_active(reservation: &Reservation) -> Result<(), EngineError> {
    if reservation.status.is_terminal() {
        return Err(EngineError::Terminal {
            id: reservation.id,
            status: reservation.status,
        });
    }
    Ok(())
}

fn ensure_reservation_length(span: &Span) -> Result<(), EngineError> {
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// Decisions are only meaningful against the calendar they will land in.
fn ensure_index_for(index: &AvailabilityIndex, therapist_id: Ulid) -> Result<(), ValidationError> {
    if index.therapist_id() != therapist_id {
        return Err(ValidationError::WrongIndex {
            index: index.therapist_id(),
            therapist_id,
        });
    }
    Ok(())
}

/// Field checks that need no calendar. Returns the requested span.
fn validate_request(request: &CreateReservation) -> Result<Span, EngineError> {
    validate_reference(request.client_id, "client_id")?;
    validate_reference(request.service_id, "service_id")?;
    validate_reference(request.therapist_id, "therapist_id")?;
    validate_text(request.notes.as_deref(), "notes", MAX_NOTES_LEN)?;
    if request.price < 0 {
        return Err(ValidationError::NegativeAmount {
            field: "price",
            amount: request.price,
        }
        .into());
    }
    let span = Span::starting_at(request.start_time, request.duration)?;
    validate_span(&span)?;
    ensure_reservation_length(&span)?;
    Ok(span)
}

/// Decide a new booking against the therapist's current index.
pub fn plan_create(
    index: &AvailabilityIndex,
    id: Ulid,
    request: CreateReservation,
) -> Result<Reservation, EngineError> {
    let span = validate_request(&request)?;
    ensure_index_for(index, request.therapist_id)?;

    check_availability(index, &span, None)?;

    Ok(Reservation {
        id,
        client_id: request.client_id,
        service_id: request.service_id,
        therapist_id: request.therapist_id,
        span,
        status: ReservationStatus::Pending,
        notes: request.notes,
        total_price: request.price,
    })
}

/// Decide a drag-to-move. Duration is preserved exactly; `target` is the index
/// of the therapist the reservation ends up with. The reservation's own entry
/// is excluded since its old slot is vacated by the same write.
pub fn plan_move(
    target: &AvailabilityIndex,
    current: &Reservation,
    new_start: Ms,
    new_therapist: Option<Ulid>,
) -> Result<Rescheduled, EngineError> {
    ensure_active(current)?;
    let therapist_id = new_therapist.unwrap_or(current.therapist_id);
    validate_reference(therapist_id, "therapist_id")?;
    let span = current.span.with_start(new_start)?;
    validate_span(&span)?;
    ensure_index_for(target, therapist_id)?;

    check_availability(target, &span, Some(current.id))?;

    Ok(Rescheduled {
        before: current.clone(),
        after: Reservation {
            therapist_id,
            span,
            ..current.clone()
        },
    })
}

/// Decide a drag-to-resize: start and therapist stay, end moves.
pub fn plan_resize(
    index: &AvailabilityIndex,
    current: &Reservation,
    new_end: Ms,
) -> Result<Rescheduled, EngineError> {
    ensure_active(current)?;
    let span = Span::new(current.start_time(), new_end)?;
    validate_span(&span)?;
    ensure_reservation_length(&span)?;
    ensure_index_for(index, current.therapist_id)?;

    check_availability(index, &span, Some(current.id))?;

    Ok(Rescheduled {
        before: current.clone(),
        after: Reservation {
            span,
            ..current.clone()
        },
    })
}

/// Apply the status state machine. Repeating a confirm or a cancel is a no-op
/// that returns the reservation unchanged.
pub fn plan_transition(current: &Reservation, to: ReservationStatus) -> Result<Reservation, EngineError> {
    if current.status == to
        && matches!(to, ReservationStatus::Confirmed | ReservationStatus::Cancelled)
    {
        return Ok(current.clone());
    }
    ensure_active(current)?;
    if !current.status.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            id: current.id,
            from: current.status,
            to,
        });
    }
    Ok(Reservation {
        status: to,
        ..current.clone()
    })
}

impl Scheduler {
    /// Book a service. The new reservation starts out `pending`.
    pub async fn create(&self, request: CreateReservation) -> Result<Reservation, EngineError> {
        observe("create", self.create_inner(request)).await
    }

    async fn create_inner(&self, request: CreateReservation) -> Result<Reservation, EngineError> {
        validate_request(&request)?;
        let _guards = self.lock_therapists(&[request.therapist_id]).await;
        let index = self.load_index(request.therapist_id).await?;
        if index.len() >= MAX_INTERVALS_PER_THERAPIST {
            return Err(EngineError::LimitExceeded("too many intervals on therapist"));
        }

        let reservation = plan_create(&index, Ulid::new(), request)?;
        self.store.insert_reservation(&reservation).await?;
        self.publish(&Event::ReservationCreated {
            reservation: reservation.clone(),
        });
        info!(
            reservation_id = %reservation.id,
            therapist_id = %reservation.therapist_id,
            span = %reservation.span,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Move a reservation to `new_start`, optionally to another therapist.
    /// On rejection nothing is written.
    pub async fn move_reservation(
        &self,
        id: Ulid,
        new_start: Ms,
        new_therapist: Option<Ulid>,
    ) -> Result<Rescheduled, EngineError> {
        observe("move", self.move_inner(id, new_start, new_therapist)).await
    }

    async fn move_inner(
        &self,
        id: Ulid,
        new_start: Ms,
        new_therapist: Option<Ulid>,
    ) -> Result<Rescheduled, EngineError> {
        if let Some(therapist_id) = new_therapist {
            validate_reference(therapist_id, "therapist_id")?;
        }
        let (current, _guards) = self.lock_reservation(id, new_therapist).await?;
        ensure_active(&current)?;
        let target_id = new_therapist.unwrap_or(current.therapist_id);
        let target = self.load_index(target_id).await?;
        if target_id != current.therapist_id && target.len() >= MAX_INTERVALS_PER_THERAPIST {
            return Err(EngineError::LimitExceeded("too many intervals on therapist"));
        }

        let moved = plan_move(&target, &current, new_start, new_therapist)?;
        self.commit_reschedule(&moved).await?;
        info!(
            reservation_id = %id,
            from_therapist_id = %moved.before.therapist_id,
            therapist_id = %moved.after.therapist_id,
            from = %moved.before.span,
            to = %moved.after.span,
            "reservation moved"
        );
        Ok(moved)
    }

    /// Change a reservation's end time.
    pub async fn resize(&self, id: Ulid, new_end: Ms) -> Result<Rescheduled, EngineError> {
        observe("resize", self.resize_inner(id, new_end)).await
    }

    async fn resize_inner(&self, id: Ulid, new_end: Ms) -> Result<Rescheduled, EngineError> {
        let (current, _guards) = self.lock_reservation(id, None).await?;
        ensure_active(&current)?;
        let index = self.load_index(current.therapist_id).await?;

        let resized = plan_resize(&index, &current, new_end)?;
        self.commit_reschedule(&resized).await?;
        info!(
            reservation_id = %id,
            from = %resized.before.span,
            to = %resized.after.span,
            "reservation resized"
        );
        Ok(resized)
    }

    async fn commit_reschedule(&self, change: &Rescheduled) -> Result<(), EngineError> {
        let after = &change.after;
        self.store
            .reschedule_reservation(after.id, after.therapist_id, after.span)
            .await?;
        self.publish(&Event::ReservationRescheduled {
            id: after.id,
            from_therapist_id: change.before.therapist_id,
            therapist_id: after.therapist_id,
            span: after.span,
        });
        Ok(())
    }

    /// Cancel, freeing the slot. Never conflicts.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        observe("cancel", self.transition(id, ReservationStatus::Cancelled)).await
    }

    /// `pending → confirmed`. Re-checks the slot first: a time block placed
    /// since the booking was made rejects the confirmation.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        observe("confirm", self.transition(id, ReservationStatus::Confirmed)).await
    }

    /// `confirmed → completed`.
    pub async fn complete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        observe("complete", self.transition(id, ReservationStatus::Completed)).await
    }

    async fn transition(&self, id: Ulid, to: ReservationStatus) -> Result<Reservation, EngineError> {
        let (current, _guards) = self.lock_reservation(id, None).await?;
        let next = plan_transition(&current, to)?;
        if next.status == current.status {
            return Ok(next);
        }

        if to == ReservationStatus::Confirmed {
            let index = self.load_index(current.therapist_id).await?;
            check_availability(&index, &current.span, Some(id))?;
        }

        self.store.set_reservation_status(id, to).await?;
        self.publish(&Event::ReservationStatusChanged {
            id,
            therapist_id: next.therapist_id,
            status: to,
        });
        info!(reservation_id = %id, from = %current.status, to = %to, "reservation status changed");
        Ok(next)
    }
}
