mod allocation;
mod compaction;
mod error;
mod inventory;
mod ledger;
mod lifecycle;
mod queries;

pub use error::EngineError;
pub use ledger::{check_and_reserve, release};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::{MAX_ACTIVE_RESERVATIONS, MAX_HOLD_TTL};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::payment::{ApproveAll, PaymentGate};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every caller in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Everything queued before it must be durable first.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even on append error so half-written bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The inventory reservation engine: ledger rows, reservations, and the
/// transactions that move units between them.
///
/// Lock order, outermost first: commit gate (shared), reservation, ledger
/// rows ascending by date. Every mutating path follows it.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) reservations: DashMap<Ulid, SharedReservation>,
    /// Reservation ids claimed by an allocation that has not committed yet.
    pub(super) in_flight: DashMap<Ulid, ()>,
    /// Reservations currently holding inventory, plus allocations that have
    /// reserved a slot and not yet committed.
    pub(super) active_reservations: AtomicUsize,
    pub(super) reservation_cap: usize,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every commit, exclusively by compaction, so a snapshot
    /// never misses an event that is durable but not yet applied.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) payment: Arc<dyn PaymentGate>,
    pub(super) hold_ttl_ms: Ms,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, hold_ttl: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        if hold_ttl > MAX_HOLD_TTL {
            warn!("hold TTL {hold_ttl:?} exceeds {MAX_HOLD_TTL:?}, clamping");
        }
        let hold_ttl_ms = Ms::try_from(hold_ttl.min(MAX_HOLD_TTL).as_millis()).unwrap_or(Ms::MAX);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            reservations: DashMap::new(),
            in_flight: DashMap::new(),
            active_reservations: AtomicUsize::new(0),
            reservation_cap: MAX_ACTIVE_RESERVATIONS,
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            payment: Arc::new(ApproveAll),
            hold_ttl_ms,
        };

        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} resources, {} reservations",
                events.len(),
                engine.resources.len(),
                engine.reservations.len()
            );
        }

        Ok(engine)
    }

    /// Lower the cap on inventory-holding reservations.
    pub fn with_reservation_cap(mut self, cap: usize) -> Self {
        self.reservation_cap = cap;
        self
    }

    /// Reservations in Hold or Confirmed.
    pub fn active_reservations(&self) -> usize {
        self.active_reservations.load(Ordering::Acquire)
    }

    /// Replace the payment gate consulted by `confirm_with_payment`.
    pub fn with_payment_gate(mut self, gate: Arc<dyn PaymentGate>) -> Self {
        self.payment = gate;
        self
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_millis(self.hold_ttl_ms.max(0) as u64)
    }

    // Replay runs before the engine is shared, so every lock below is
    // uncontended. Never use blocking_lock here: this may run inside a runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated {
                id,
                name,
                total_units,
                price_per_night,
                inventory,
            } => {
                let mut rs = ResourceState::new(*id, name.clone(), *total_units, *price_per_night);
                rs.provision(inventory);
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::InventoryExtended {
                resource_id,
                inventory,
            } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.provision(inventory);
                }
            }
            Event::HoldPlaced {
                id,
                resource_id,
                requester_id,
                stay,
                total_amount,
                created_at,
                expires_at,
            } => self.replay_restore(Reservation {
                id: *id,
                resource_id: *resource_id,
                requester_id: *requester_id,
                stay: *stay,
                status: ReservationStatus::Hold,
                total_amount: *total_amount,
                created_at: *created_at,
                expires_at: *expires_at,
            }),
            Event::ReservationRestored { reservation } => self.replay_restore(reservation.clone()),
            Event::ReservationConfirmed { id, .. } => {
                self.replay_transition(id, ReservationStatus::Confirmed)
            }
            Event::HoldReleased { id, .. } => self.replay_transition(id, ReservationStatus::Released),
            Event::ReservationCanceled { id, .. } => {
                self.replay_transition(id, ReservationStatus::Canceled)
            }
        }
    }

    fn replay_restore(&self, reservation: Reservation) {
        if reservation.status.holds_inventory() {
            self.active_reservations.fetch_add(1, Ordering::AcqRel);
            self.replay_adjust_rows(&reservation, |row| {
                row.units_remaining = row.units_remaining.saturating_sub(1);
            });
        }
        self.reservations
            .insert(reservation.id, Arc::new(Mutex::new(reservation)));
    }

    fn replay_transition(&self, id: &Ulid, next: ReservationStatus) {
        let Some(handle) = self.reservations.get(id).map(|e| e.value().clone()) else {
            return;
        };
        let mut r = handle.try_lock().expect("replay: uncontended lock");
        if !r.status.can_transition_to(next) {
            return;
        }
        if r.status.holds_inventory() && !next.holds_inventory() {
            self.active_reservations.fetch_sub(1, Ordering::AcqRel);
            self.replay_adjust_rows(&r, |row| {
                row.units_remaining = (row.units_remaining + 1).min(row.total_units);
            });
        }
        r.status = next;
    }

    fn replay_adjust_rows(&self, reservation: &Reservation, adjust: impl Fn(&mut LedgerRow)) {
        let Some(rs) = self.get_resource(&reservation.resource_id) else {
            return;
        };
        let guard = rs.try_read().expect("replay: uncontended read");
        for (_, row) in guard.rows_in(&reservation.stay) {
            adjust(&mut row.try_lock().expect("replay: uncontended lock"));
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub(super) fn reservation_handle(&self, id: &Ulid) -> Result<SharedReservation, EngineError> {
        self.reservations
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}
