use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL with the minimal events that recreate current state:
    /// each resource with its provisioned date runs, then every reservation
    /// with its present status.
    ///
    /// Holds the commit gate exclusively, so no transaction is between its
    /// WAL append and its in-memory apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            let mut runs = contiguous_runs(guard.ledger.keys().copied()).into_iter();
            let Some(first) = runs.next() else {
                continue;
            };
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                total_units: guard.total_units,
                price_per_night: guard.price_per_night,
                inventory: first,
            });
            events.extend(runs.map(|inventory| Event::InventoryExtended {
                resource_id: guard.id,
                inventory,
            }));
        }

        let reservations: Vec<_> = self.reservations.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::with_capacity(reservations.len());
        for handle in reservations {
            snapshot.push(handle.lock().await.clone());
        }
        snapshot.sort_by_key(|r| (r.created_at, r.id));
        events.extend(
            snapshot
                .into_iter()
                .map(|reservation| Event::ReservationRestored { reservation }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
