use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, now_ms};
use crate::model::{Event, Ms};

/// Outcome of one pass over expired holds.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: usize,
    /// Lost the race to a confirm/cancel/earlier expiry. Not an error.
    pub skipped: usize,
    pub failures: Vec<(Ulid, EngineError)>,
}

/// Expire one hold. `Ok(true)` if this call released it, `Ok(false)` if
/// another transition already won; anything else is a real failure the
/// caller should surface.
pub async fn expire_hold(engine: &Engine, id: Ulid) -> Result<bool, EngineError> {
    match engine.expire(id).await {
        Ok(r) => {
            info!("released expired hold {id} on {}", r.resource_id);
            metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
            Ok(true)
        }
        Err(e) if e.is_benign_race() => {
            debug!("expiry skip {id}: {e}");
            Ok(false)
        }
        Err(e) => {
            metrics::counter!(crate::observability::EXPIRY_FAILURES_TOTAL).increment(1);
            Err(e)
        }
    }
}

/// Release every hold whose deadline is at or before `now`.
pub async fn sweep_once(engine: &Engine, now: Ms) -> SweepReport {
    let mut report = SweepReport::default();
    for id in engine.collect_expired_holds(now) {
        match expire_hold(engine, id).await {
            Ok(true) => report.expired += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => report.failures.push((id, e)),
        }
    }
    report
}

/// Background task that periodically sweeps for expired holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = sweep_once(&engine, now_ms()).await;
        for (id, e) in &report.failures {
            error!("failed to release expired hold {id}: {e}");
        }
        if report.expired > 0 {
            debug!("sweep released {} holds ({} skipped)", report.expired, report.skipped);
        }
    }
}

/// Event-driven expiry: listens to the engine's event feed and fires
/// `expire` at each new hold's deadline. The sweep is the backstop for
/// anything this misses (lagged feed, restart, failed attempts).
pub async fn run_expiry_scheduler(engine: Arc<Engine>) {
    let mut feed = engine.notify.subscribe();
    let mut queue: DelayQueue<Ulid> = DelayQueue::new();
    let mut keys: HashMap<Ulid, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            received = feed.recv() => match received {
                Ok(Event::HoldPlaced { id, expires_at, .. }) => {
                    let wait = Duration::from_millis((expires_at - now_ms()).max(0) as u64);
                    keys.insert(id, queue.insert(id, wait));
                }
                Ok(
                    Event::ReservationConfirmed { id, .. }
                    | Event::HoldReleased { id, .. }
                    | Event::ReservationCanceled { id, .. },
                ) => {
                    if let Some(key) = keys.remove(&id) {
                        queue.remove(&key);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("expiry scheduler lagged by {missed} events; relying on sweep");
                }
                Err(RecvError::Closed) => break,
            },
            Some(fired) = queue.next(), if !queue.is_empty() => {
                let id = fired.into_inner();
                keys.remove(&id);
                if let Err(e) = expire_hold(&engine, id).await {
                    error!("failed to release expired hold {id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
