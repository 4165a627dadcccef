//! Hard limits that bound memory and request cost. Exceeding any of them
//! fails the operation with `EngineError::LimitExceeded`.

use std::time::Duration;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_UNITS_PER_DATE: u32 = 100_000;

/// Ledger rows a single resource may carry (ten years of dates).
pub const MAX_LEDGER_ROWS_PER_RESOURCE: usize = 3_660;

/// Longest stay one reservation may request.
pub const MAX_NIGHTS_PER_RESERVATION: u32 = 365;

/// Reservations holding inventory (Hold or Confirmed) at any one time.
/// Released and canceled reservations don't count.
pub const MAX_ACTIVE_RESERVATIONS: usize = 10_000_000;

/// Largest nightly price; a maximum-length stay still totals within `i64`.
pub const MAX_PRICE_PER_NIGHT: i64 = i64::MAX / MAX_NIGHTS_PER_RESERVATION as i64;

/// Longest accepted hold TTL.
pub const MAX_HOLD_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Widest date window a ledger query may scan.
pub const MAX_LEDGER_QUERY_DAYS: u32 = 3_660;

/// Upper bound on waiting for ledger row locks inside one transaction.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Units consumed per night by one reservation.
pub const UNITS_PER_RESERVATION: u32 = 1;
