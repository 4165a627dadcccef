use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request, rejected before any lock is taken.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient availability on resource {resource_id} for {date}")]
    InsufficientAvailability { resource_id: Ulid, date: NaiveDate },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("reservation {id} is {status}")]
    InvalidState { id: Ulid, status: ReservationStatus },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("payment declined for reservation {0}")]
    PaymentDeclined(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("timed out waiting for ledger rows of resource {0}")]
    LockTimeout(Ulid),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether the caller may retry the same request unchanged (or with new dates).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_)
                | EngineError::LockTimeout(_)
                | EngineError::InsufficientAvailability { .. }
        )
    }

    /// Lost a race the winner already resolved; the expiry monitor treats this as a no-op.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, EngineError::InvalidState { .. } | EngineError::NotFound(_))
    }
}
