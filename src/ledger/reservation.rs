//! Provisional unit withdrawals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::balance::ChargeSource;
use crate::types::AccountId;

/// Lifecycle of a reservation. Every reservation must terminate in
/// `Committed` or `Released`; callers enforce this with release-on-failure
/// and upstream timeouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
}

/// One unit provisionally withdrawn from one named source.
///
/// The handle is returned by [`CreditLedger::reserve`](super::CreditLedger::reserve)
/// and passed back to `commit` or `release`; the authoritative status lives
/// in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub account_id: AccountId,
    pub source: ChargeSource,
}

/// Ledger-side record backing a [`Reservation`] handle.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReservationRecord {
    pub source: ChargeSource,
    pub status: ReservationStatus,
}
