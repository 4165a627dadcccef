use std::sync::atomic::Ordering;

use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::ledger::{check_and_reserve, lock_rows, release};
use super::{Engine, EngineError, now_ms};

/// Check the request shape before any lock is taken.
pub(crate) fn validate_stay(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidRequest(format!(
            "start_date {start} must be before end_date {end}"
        )));
    }
    let stay = DateRange::new(start, end);
    if stay.nights() > MAX_NIGHTS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

/// Claim on a reservation id for the duration of one allocation, so two
/// requests carrying the same id cannot both commit.
struct IdClaim<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl<'a> IdClaim<'a> {
    fn acquire(engine: &'a Engine, id: Ulid) -> Result<Self, EngineError> {
        if engine.reservations.contains_key(&id) || engine.in_flight.insert(id, ()).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let claim = Self { engine, id };
        // A concurrent allocation may have committed between the two checks above.
        if engine.reservations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(claim)
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.engine.in_flight.remove(&self.id);
    }
}

/// One slot under the active-reservation cap. Given back on drop unless
/// the allocation commits.
struct ActiveSlot<'a> {
    engine: &'a Engine,
    committed: bool,
}

impl<'a> ActiveSlot<'a> {
    fn acquire(engine: &'a Engine) -> Result<Self, EngineError> {
        engine
            .active_reservations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < engine.reservation_cap).then_some(n + 1)
            })
            .map_err(|_| EngineError::LimitExceeded("too many active reservations"))?;
        Ok(Self {
            engine,
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.engine.active_reservations.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Engine {
    /// Place a hold: lock the ledger rows of the stay, take one unit from
    /// every night, and record the reservation as `Hold`, all or nothing.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Reservation, EngineError> {
        self.reserve_at(req, now_ms()).await
    }

    /// `reserve` with an explicit creation instant; the hold expires at
    /// `now + hold_ttl`.
    pub async fn reserve_at(&self, req: ReserveRequest, now: Ms) -> Result<Reservation, EngineError> {
        let result = self.allocate(req, now).await;
        let outcome = match &result {
            Ok(_) => "placed",
            Err(EngineError::InsufficientAvailability { .. }) => "unavailable",
            Err(EngineError::InvalidRequest(_)) => "invalid",
            Err(_) => "failed",
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        result
    }

    async fn allocate(&self, req: ReserveRequest, now: Ms) -> Result<Reservation, EngineError> {
        let stay = validate_stay(req.start_date, req.end_date)?;
        let expires_at = now
            .checked_add(self.hold_ttl_ms)
            .ok_or_else(|| EngineError::InvalidRequest(format!("hold deadline out of range at {now}")))?;
        let _claim = IdClaim::acquire(self, req.reservation_id)?;
        let slot = ActiveSlot::acquire(self)?;

        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        // Row handles are shared, so they stay valid after the read guard goes.
        let (handles, price_per_night) = {
            let guard = rs.read().await;
            (guard.rows_in(&stay), guard.price_per_night)
        };
        // Everything that can fail without touching the ledger runs before the rows are locked.
        let total_amount = price_per_night
            .checked_mul(i64::from(stay.nights()))
            .ok_or(EngineError::LimitExceeded("reservation amount out of range"))?;

        let _gate = self.commit_gate.read().await;
        let mut rows = lock_rows(req.resource_id, handles).await?;
        check_and_reserve(req.resource_id, &stay, &mut rows, UNITS_PER_RESERVATION)?;

        let reservation = Reservation {
            id: req.reservation_id,
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            stay,
            status: ReservationStatus::Hold,
            total_amount,
            created_at: now,
            expires_at,
        };
        let event = Event::HoldPlaced {
            id: reservation.id,
            resource_id: reservation.resource_id,
            requester_id: reservation.requester_id,
            stay,
            total_amount: reservation.total_amount,
            created_at: reservation.created_at,
            expires_at: reservation.expires_at,
        };
        if let Err(e) = self.wal_append(&event).await {
            // Rows are still locked: nobody saw the decrement.
            release(&mut rows, UNITS_PER_RESERVATION);
            return Err(e);
        }

        self.reservations.insert(
            reservation.id,
            std::sync::Arc::new(tokio::sync::Mutex::new(reservation.clone())),
        );
        slot.commit();
        drop(rows);
        self.notify.send(&event);
        debug!(
            "hold {} on {} for {stay}, expires at {}",
            reservation.id, reservation.resource_id, reservation.expires_at
        );
        Ok(reservation)
    }
}
