use std::ops::DerefMut;

use chrono::NaiveDate;
use tokio::sync::OwnedMutexGuard;
use ulid::Ulid;

use crate::limits::LOCK_TIMEOUT;
use crate::model::*;

use super::EngineError;

// ── Availability Ledger ──────────────────────────────────────────

/// Exclusive locks on a run of ledger rows, ascending by date.
/// Dropping it releases every row.
pub(super) type LockedRows = Vec<(NaiveDate, OwnedMutexGuard<LedgerRow>)>;

/// Lock `handles` one by one in the order given (callers pass them ascending
/// by date, which is what keeps overlapping transactions deadlock-free).
///
/// Gives up after `LOCK_TIMEOUT`; guards acquired so far are dropped, so a
/// timed-out transaction leaves nothing behind.
pub(super) async fn lock_rows(
    resource_id: Ulid,
    handles: Vec<(NaiveDate, SharedLedgerRow)>,
) -> Result<LockedRows, EngineError> {
    debug_assert!(handles.windows(2).all(|w| w[0].0 < w[1].0));
    let acquire = async move {
        let mut guards = Vec::with_capacity(handles.len());
        for (date, row) in handles {
            guards.push((date, row.lock_owned().await));
        }
        guards
    };
    tokio::time::timeout(LOCK_TIMEOUT, acquire)
        .await
        .map_err(|_| EngineError::LockTimeout(resource_id))
}

/// Verify every night of `range` has at least `units` left, then decrement
/// all of them. All-or-nothing: nothing is touched unless every night passes.
///
/// `rows` must be the locked rows of `range`, ascending. A night with no row
/// has no inventory configured and counts as zero availability.
pub fn check_and_reserve<R>(
    resource_id: Ulid,
    range: &DateRange,
    rows: &mut [(NaiveDate, R)],
    units: u32,
) -> Result<(), EngineError>
where
    R: DerefMut<Target = LedgerRow>,
{
    if rows.len() != range.nights() as usize {
        let missing = range
            .dates()
            .zip(rows.iter().map(|(date, _)| Some(*date)).chain(std::iter::repeat(None)))
            .find(|(wanted, have)| Some(*wanted) != *have)
            .map(|(wanted, _)| wanted)
            .unwrap_or(range.start);
        return Err(EngineError::InsufficientAvailability {
            resource_id,
            date: missing,
        });
    }
    if let Some((date, _)) = rows.iter().find(|(_, row)| row.units_remaining < units) {
        return Err(EngineError::InsufficientAvailability {
            resource_id,
            date: *date,
        });
    }
    for (_, row) in rows.iter_mut() {
        row.units_remaining -= units;
    }
    Ok(())
}

/// Return `units` to every row. Never credits a row past its provisioned total.
///
/// The ledger itself does not remember who claimed what; releasing the same
/// reservation twice is prevented by the reservation's status guard, which
/// lets exactly one release through.
pub fn release<R>(rows: &mut [(NaiveDate, R)], units: u32)
where
    R: DerefMut<Target = LedgerRow>,
{
    for (_, row) in rows.iter_mut() {
        row.units_remaining = row.units_remaining.saturating_add(units).min(row.total_units);
    }
}
