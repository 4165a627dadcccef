use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_inventory(first_night: NaiveDate, last_night: NaiveDate) -> Result<DateRange, EngineError> {
    if first_night >= last_night {
        return Err(EngineError::InvalidRequest(format!(
            "inventory range [{first_night}, {last_night}) is empty"
        )));
    }
    let range = DateRange::new(first_night, last_night);
    if range.nights() as usize > MAX_LEDGER_ROWS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("inventory range too wide"));
    }
    Ok(range)
}

impl Engine {
    /// Register a resource and provision one full ledger row per date in
    /// `[first_night, last_night)`.
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        first_night: NaiveDate,
        last_night: NaiveDate,
    ) -> Result<(), EngineError> {
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if total_units == 0 {
            return Err(EngineError::InvalidRequest("total_units must be positive".into()));
        }
        if total_units > MAX_UNITS_PER_DATE {
            return Err(EngineError::LimitExceeded("too many units per date"));
        }
        if price_per_night < 0 {
            return Err(EngineError::InvalidRequest("price_per_night must not be negative".into()));
        }
        if price_per_night > MAX_PRICE_PER_NIGHT {
            return Err(EngineError::LimitExceeded("price_per_night too large"));
        }
        let inventory = validate_inventory(first_night, last_night)?;

        let _gate = self.commit_gate.read().await;
        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            total_units,
            price_per_night,
            inventory,
        };
        let mut rs = ResourceState::new(id, name, total_units, price_per_night);
        rs.provision(&inventory);

        // Publish the slot write-locked so a racing create sees the id taken
        // and nothing allocates against it until the event is durable.
        let shared = Arc::new(RwLock::new(rs));
        let mut pending = shared
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::Storage("fresh resource lock unavailable".into()))?;
        match self.resources.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            // An allocation may already hold the Arc; it must find no rows.
            pending.ledger.clear();
            self.resources.remove(&id);
            return Err(e);
        }
        drop(pending);

        self.notify.send(&event);
        info!("created resource {id}: {total_units} units over {inventory}");
        Ok(())
    }

    /// Provision rows for every date in `[first_night, last_night)` the
    /// resource doesn't cover yet. Existing rows (and their counts) are kept.
    /// Returns the number of rows added.
    pub async fn extend_inventory(
        &self,
        resource_id: Ulid,
        first_night: NaiveDate,
        last_night: NaiveDate,
    ) -> Result<usize, EngineError> {
        let inventory = validate_inventory(first_night, last_night)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;

        let _gate = self.commit_gate.read().await;
        let mut guard = rs.write().await;
        let new_rows = inventory.dates().filter(|d| !guard.ledger.contains_key(d)).count();
        if new_rows == 0 {
            return Ok(0);
        }
        if guard.ledger.len() + new_rows > MAX_LEDGER_ROWS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many ledger rows on resource"));
        }

        let event = Event::InventoryExtended {
            resource_id,
            inventory,
        };
        self.wal_append(&event).await?;
        let added = guard.provision(&inventory);
        self.notify.send(&event);
        info!("extended resource {resource_id} by {added} dates over {inventory}");
        Ok(added)
    }
}
