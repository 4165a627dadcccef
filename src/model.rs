use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

/// Unix milliseconds, used for instants (creation time, hold deadlines).
pub type Ms = i64;

/// Half-open range of calendar dates `[start, end)`.
///
/// For a stay, `start` is the check-in date and `end` the check-out date;
/// the check-out date is never consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    /// Number of nights (dates) covered.
    pub fn nights(&self) -> u32 {
        (self.end - self.start).num_days().max(0) as u32
    }

    /// Every covered date, ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d < self.end)
    }

    #[cfg(test)]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    #[cfg(test)]
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Group ascending dates into maximal contiguous ranges.
pub fn contiguous_runs(dates: impl IntoIterator<Item = NaiveDate>) -> Vec<DateRange> {
    let mut runs: Vec<DateRange> = Vec::new();
    for date in dates {
        if let Some(last) = runs.last_mut()
            && last.end == date
            && let Some(next) = date.succ_opt()
        {
            last.end = next;
            continue;
        }
        if let Some(next) = date.succ_opt() {
            runs.push(DateRange::new(date, next));
        }
    }
    runs
}

/// Remaining inventory for one (resource, date) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRow {
    pub total_units: u32,
    pub units_remaining: u32,
}

impl LedgerRow {
    pub fn full(total_units: u32) -> Self {
        Self {
            total_units,
            units_remaining: total_units,
        }
    }
}

/// Each ledger row carries its own lock; allocations lock exactly the rows they touch.
pub type SharedLedgerRow = Arc<Mutex<LedgerRow>>;

#[derive(Debug)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Units provisioned per date (e.g. rooms of this type).
    pub total_units: u32,
    /// Minor currency units charged per night.
    pub price_per_night: i64,
    /// One row per provisioned date, ordered ascending.
    pub ledger: BTreeMap<NaiveDate, SharedLedgerRow>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, total_units: u32, price_per_night: i64) -> Self {
        Self {
            id,
            name,
            total_units,
            price_per_night,
            ledger: BTreeMap::new(),
        }
    }

    /// Provision a full row for every date in `range` not already present.
    /// Returns how many rows were added.
    pub fn provision(&mut self, range: &DateRange) -> usize {
        let mut added = 0;
        for date in range.dates() {
            if !self.ledger.contains_key(&date) {
                self.ledger
                    .insert(date, Arc::new(Mutex::new(LedgerRow::full(self.total_units))));
                added += 1;
            }
        }
        added
    }

    /// Row handles for every provisioned date inside `range`, ascending by date.
    pub fn rows_in(&self, range: &DateRange) -> Vec<(NaiveDate, SharedLedgerRow)> {
        self.ledger
            .range(range.start..range.end)
            .map(|(date, row)| (*date, row.clone()))
            .collect()
    }

    pub fn first_night(&self) -> Option<NaiveDate> {
        self.ledger.keys().next().copied()
    }

    pub fn last_night(&self) -> Option<NaiveDate> {
        self.ledger.keys().next_back().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Inventory decremented, awaiting confirmation.
    Hold,
    Confirmed,
    /// Returned to the pool by the expiry monitor.
    Released,
    /// Returned to the pool by the requester.
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Hold => "hold",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Canceled => "canceled",
        }
    }

    /// Whether the reservation still claims one unit per night.
    pub fn holds_inventory(&self) -> bool {
        matches!(self, ReservationStatus::Hold | ReservationStatus::Confirmed)
    }

    /// Only a Hold may move, and only to one of the terminal states.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (
                ReservationStatus::Hold,
                ReservationStatus::Confirmed | ReservationStatus::Released | ReservationStatus::Canceled
            )
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub stay: DateRange,
    pub status: ReservationStatus,
    pub total_amount: i64,
    pub created_at: Ms,
    /// Deadline after which an unconfirmed Hold is released.
    pub expires_at: Ms,
}

impl Reservation {
    pub fn is_expired_hold(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Hold && self.expires_at <= now
    }
}

pub type SharedReservation = Arc<Mutex<Reservation>>;

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        inventory: DateRange,
    },
    InventoryExtended {
        resource_id: Ulid,
        inventory: DateRange,
    },
    HoldPlaced {
        id: Ulid,
        resource_id: Ulid,
        requester_id: Ulid,
        stay: DateRange,
        total_amount: i64,
        created_at: Ms,
        expires_at: Ms,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    HoldReleased {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCanceled {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Written only by compaction: a reservation with its current status.
    ReservationRestored {
        reservation: Reservation,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. } => *id,
            Event::InventoryExtended { resource_id, .. }
            | Event::HoldPlaced { resource_id, .. }
            | Event::ReservationConfirmed { resource_id, .. }
            | Event::HoldReleased { resource_id, .. }
            | Event::ReservationCanceled { resource_id, .. } => *resource_id,
            Event::ReservationRestored { reservation } => reservation.resource_id,
        }
    }
}

// ── Inbound contract ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub reservation_id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveResponse {
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
    pub total_amount: i64,
}

impl From<&Reservation> for ReserveResponse {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            status: r.status,
            total_amount: r.total_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub reservation_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmResponse {
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
}

impl From<&Reservation> for ConfirmResponse {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            status: r.status,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub total_units: u32,
    pub price_per_night: i64,
    pub first_night: Option<NaiveDate>,
    pub last_night: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub units_remaining: u32,
    pub total_units: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    #[test]
    fn range_counts_nights_not_checkout() {
        let r = DateRange::new(d(1), d(3));
        assert_eq!(r.nights(), 2);
        assert_eq!(r.dates().collect::<Vec<_>>(), vec![d(1), d(2)]);
        assert!(r.contains(d(2)));
        assert!(!r.contains(d(3))); // check-out day
    }

    #[test]
    fn range_crosses_month_boundary() {
        let r = DateRange::new(NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(), d(2));
        // 2024 is a leap year: Feb 28, Feb 29, ..., May 31, Jun 1
        assert_eq!(r.dates().count() as u32, r.nights());
        assert_eq!(r.dates().nth(1), NaiveDate::from_ymd_opt(2024, 2, 29));
    }

    #[test]
    fn range_overlap_is_half_open() {
        let a = DateRange::new(d(1), d(3));
        let b = DateRange::new(d(2), d(4));
        let c = DateRange::new(d(3), d(5));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back stays share no night
    }

    #[test]
    fn runs_split_on_gaps() {
        let runs = contiguous_runs([d(1), d(2), d(3), d(7), d(8), d(10)]);
        assert_eq!(
            runs,
            vec![
                DateRange::new(d(1), d(4)),
                DateRange::new(d(7), d(9)),
                DateRange::new(d(10), d(11)),
            ]
        );
        assert!(contiguous_runs(std::iter::empty()).is_empty());
    }

    #[test]
    fn provision_skips_existing_dates() {
        let mut rs = ResourceState::new(Ulid::new(), None, 2, 10_000);
        assert_eq!(rs.provision(&DateRange::new(d(1), d(4))), 3);
        assert_eq!(rs.provision(&DateRange::new(d(3), d(6))), 2);
        assert_eq!(rs.ledger.len(), 5);
        assert_eq!(rs.first_night(), Some(d(1)));
        assert_eq!(rs.last_night(), Some(d(5)));
    }

    #[test]
    fn rows_in_returns_only_provisioned_dates() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, 10_000);
        rs.provision(&DateRange::new(d(1), d(3)));
        let rows = rs.rows_in(&DateRange::new(d(2), d(5)));
        let dates: Vec<_> = rows.iter().map(|(date, _)| *date).collect();
        assert_eq!(dates, vec![d(2)]);
    }

    #[test]
    fn status_transitions_only_leave_hold() {
        use ReservationStatus::*;
        assert!(Hold.can_transition_to(Confirmed));
        assert!(Hold.can_transition_to(Released));
        assert!(Hold.can_transition_to(Canceled));
        assert!(!Hold.can_transition_to(Hold));
        for terminal in [Confirmed, Released, Canceled] {
            for next in [Hold, Confirmed, Released, Canceled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(Hold.holds_inventory());
        assert!(Confirmed.holds_inventory());
        assert!(!Released.holds_inventory());
        assert!(!Canceled.holds_inventory());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldPlaced {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester_id: Ulid::new(),
            stay: DateRange::new(d(1), d(3)),
            total_amount: 24_000,
            created_at: 1_000,
            expires_at: 901_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
