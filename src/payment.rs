use async_trait::async_trait;

use crate::model::Reservation;

/// External payment confirmation, consulted once before a hold is confirmed.
///
/// A plain yes/no: retries, refunds and partial captures belong to the
/// payment provider, not to the reservation engine.
#[async_trait]
pub trait PaymentGate: Send + Sync {
    async fn authorize(&self, reservation: &Reservation) -> bool;
}

/// Gate used when no payment provider is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

#[async_trait]
impl PaymentGate for ApproveAll {
    async fn authorize(&self, _reservation: &Reservation) -> bool {
        true
    }
}
