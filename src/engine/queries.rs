use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(id)?;
        let r = handle.lock().await;
        Ok(r.clone())
    }

    /// All reservations on a resource, oldest first.
    pub async fn list_reservations(&self, resource_id: Ulid) -> Vec<Reservation> {
        let handles: Vec<_> = self
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::new();
        for handle in handles {
            let r = handle.lock().await;
            if r.resource_id == resource_id {
                out.push(r.clone());
            }
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    /// Ledger rows of a resource inside `[from, until)`. Dates without a row
    /// are simply absent.
    pub async fn ledger(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        if from >= until {
            return Ok(Vec::new());
        }
        let range = DateRange::new(from, until);
        if range.nights() > MAX_LEDGER_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("ledger window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let handles = rs.read().await.rows_in(&range);

        let mut entries = Vec::with_capacity(handles.len());
        for (date, row) in handles {
            let row = *row.lock().await;
            entries.push(LedgerEntry {
                resource_id,
                date,
                units_remaining: row.units_remaining,
                total_units: row.total_units,
            });
        }
        Ok(entries)
    }

    /// Full ledger of a resource, every provisioned date.
    pub async fn full_ledger(&self, resource_id: Ulid) -> Result<Vec<LedgerEntry>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let bounds = {
            let guard = rs.read().await;
            guard.first_night().zip(guard.last_night())
        };
        match bounds {
            Some((first, last)) => {
                let until = last.succ_opt().unwrap_or(last);
                self.ledger(resource_id, first, until).await
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self
            .resources
            .iter()
            .filter_map(|entry| {
                // A write-locked resource is mid-create; it shows up once committed.
                let guard = entry.value().try_read().ok()?;
                Some(ResourceInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    total_units: guard.total_units,
                    price_per_night: guard.price_per_night,
                    first_night: guard.first_night(),
                    last_night: guard.last_night(),
                })
            })
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Holds whose deadline is at or before `now`. Reservations locked by an
    /// in-progress transition are skipped; the next sweep sees them again.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut expired: Vec<Ulid> = self
            .reservations
            .iter()
            .filter_map(|entry| {
                let r = entry.value().try_lock().ok()?;
                r.is_expired_hold(now).then_some(r.id)
            })
            .collect();
        expired.sort();
        expired
    }
}
