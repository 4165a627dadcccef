use std::sync::atomic::Ordering;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::UNITS_PER_RESERVATION;
use crate::model::*;

use super::ledger::{lock_rows, release};
use super::{Engine, EngineError};

/// Compare-and-swap guard on status: only proceed if the reservation is
/// still in the state the caller expects to move it out of.
fn guard_transition(r: &Reservation, next: ReservationStatus) -> Result<(), EngineError> {
    if r.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            id: r.id,
            status: r.status,
        })
    }
}

impl Engine {
    /// Hold → Confirmed. The units were taken when the hold was placed, so
    /// the ledger is untouched; the reservation just stops being eligible
    /// for expiry.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let _gate = self.commit_gate.read().await;
        let mut r = handle.lock().await;
        guard_transition(&r, ReservationStatus::Confirmed)?;

        let event = Event::ReservationConfirmed {
            id,
            resource_id: r.resource_id,
        };
        self.wal_append(&event).await?;
        r.status = ReservationStatus::Confirmed;
        self.notify.send(&event);
        info!("confirmed reservation {id}");
        Ok(r.clone())
    }

    /// Run the payment gate, then `confirm`. A declined payment leaves the
    /// hold as it was (it will still expire on schedule).
    pub async fn confirm_with_payment(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let snapshot = self.get_reservation(&id).await?;
        guard_transition(&snapshot, ReservationStatus::Confirmed)?;
        if !self.payment.authorize(&snapshot).await {
            metrics::counter!(crate::observability::PAYMENTS_DECLINED_TOTAL).increment(1);
            return Err(EngineError::PaymentDeclined(id));
        }
        self.confirm(id).await
    }

    /// Hold → Released, returning its units to the ledger. Used by the
    /// expiry monitor; safe to call any number of times and to race with
    /// `confirm`, since only one transition out of Hold can ever succeed.
    pub async fn expire(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.release_claim(id, ReservationStatus::Released).await
    }

    /// Hold → Canceled at the requester's request, returning its units.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.release_claim(id, ReservationStatus::Canceled).await
    }

    async fn release_claim(
        &self,
        id: Ulid,
        outcome: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let _gate = self.commit_gate.read().await;
        let mut r = handle.lock().await;
        guard_transition(&r, outcome)?;

        let rs = self
            .get_resource(&r.resource_id)
            .ok_or(EngineError::NotFound(r.resource_id))?;
        let handles = rs.read().await.rows_in(&r.stay);
        let mut rows = lock_rows(r.resource_id, handles).await?;

        let event = match outcome {
            ReservationStatus::Canceled => Event::ReservationCanceled {
                id,
                resource_id: r.resource_id,
            },
            _ => Event::HoldReleased {
                id,
                resource_id: r.resource_id,
            },
        };
        self.wal_append(&event).await?;
        release(&mut rows, UNITS_PER_RESERVATION);
        r.status = outcome;
        self.active_reservations.fetch_sub(1, Ordering::AcqRel);
        drop(rows);

        self.notify.send(&event);
        debug!("reservation {id} {outcome}, {} nights returned", r.stay.nights());
        Ok(r.clone())
    }
}
