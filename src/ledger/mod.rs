//! Credit ledger: per-account balances with atomic reserve/commit/release.
//!
//! All entry points are synchronous and serialized per account; accounts are
//! independent and proceed fully in parallel. `reserve` never waits for
//! capacity — it fails with a full balance breakdown when no source has
//! headroom.

mod balance;
mod reservation;

pub use balance::{CHARGE_PRIORITY, ChargeSource, CreditBalance, CreditBreakdown, CreditSource};
pub use reservation::{Reservation, ReservationStatus};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::Error;
use crate::types::{AccountId, BillingPeriod};
use reservation::ReservationRecord;

/// Read-only view of one account's identity fields.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccountInfo {
    pub account_id: AccountId,
    pub plan_handle: Option<String>,
    pub period: Option<BillingPeriod>,
}

/// Counters backing the conservation property: units granted must equal
/// units still on balance plus units held plus units committed from balance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerAudit {
    /// Net units granted across all sources, including plan resets.
    pub units_granted: i64,
    /// Total committed deductions, overage included.
    pub units_committed: u64,
    /// Committed deductions charged to overage.
    pub units_committed_overage: u64,
    /// Reservations currently held.
    pub units_held: u64,
}

impl LedgerAudit {
    /// Committed deductions that consumed granted balance.
    pub fn units_committed_from_balance(&self) -> u64 {
        self.units_committed - self.units_committed_overage
    }
}

#[derive(Debug)]
struct AccountState {
    balance: CreditBalance,
    plan_handle: Option<String>,
    period: Option<BillingPeriod>,
    reservations: HashMap<Uuid, ReservationRecord>,
    audit: LedgerAudit,
}

impl AccountState {
    fn new(overage_cap: Decimal) -> Self {
        Self {
            balance: CreditBalance {
                overage_cap_amount: overage_cap,
                ..Default::default()
            },
            plan_handle: None,
            period: None,
            reservations: HashMap::new(),
            audit: LedgerAudit::default(),
        }
    }
}

/// Per-account credit accounting across four grant sources plus capped
/// overage.
pub struct CreditLedger {
    accounts: DashMap<AccountId, Arc<Mutex<AccountState>>>,
    unit_price: Decimal,
}

impl CreditLedger {
    pub fn new(unit_price: Decimal) -> Self {
        Self {
            accounts: DashMap::new(),
            unit_price,
        }
    }

    pub fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    /// Create the account if absent. Returns `true` when newly created, so
    /// install can be retried safely.
    pub fn open_account(&self, account_id: AccountId, overage_cap: Decimal) -> bool {
        let mut created = false;
        self.accounts.entry(account_id).or_insert_with(|| {
            created = true;
            Arc::new(Mutex::new(AccountState::new(overage_cap)))
        });
        created
    }

    pub fn account_exists(&self, account_id: &AccountId) -> bool {
        self.accounts.contains_key(account_id)
    }

    /// Atomically withdraw one unit from the first source in
    /// [`CHARGE_PRIORITY`] with capacity and record the reservation.
    ///
    /// Withdrawal and reservation creation happen under one account lock:
    /// no observer sees a decremented balance without its reservation.
    pub fn reserve(&self, account_id: &AccountId) -> Result<Reservation, Error> {
        let state = self.state(account_id)?;
        let mut state = lock(&state);

        let Some(source) = CHARGE_PRIORITY
            .iter()
            .copied()
            .find(|source| source.available(&state.balance, self.unit_price))
        else {
            let breakdown = CreditBreakdown::of(&state.balance, self.unit_price);
            debug!(account = %account_id, %breakdown, "reserve rejected: no source has capacity");
            return Err(Error::InsufficientCredits { breakdown });
        };

        source.withdraw(&mut state.balance);
        let id = Uuid::new_v4();
        state.reservations.insert(
            id,
            ReservationRecord {
                source,
                status: ReservationStatus::Held,
            },
        );
        state.audit.units_held += 1;
        debug!(account = %account_id, reservation = %id, %source, "reserved one unit");

        Ok(Reservation {
            id,
            account_id: account_id.clone(),
            source,
        })
    }

    /// Finalize a held reservation. The unit was already withdrawn at
    /// reserve time, so no balance changes here. Idempotent.
    pub fn commit(&self, reservation: &Reservation) -> Result<(), Error> {
        let state = self.state(&reservation.account_id)?;
        let mut state = lock(&state);

        let Some(record) = state.reservations.get_mut(&reservation.id) else {
            return Err(Error::ReservationState {
                reservation_id: reservation.id,
                detail: "commit of unknown reservation".to_string(),
            });
        };

        match record.status {
            ReservationStatus::Held => {
                record.status = ReservationStatus::Committed;
                let source = record.source;
                state.audit.units_held -= 1;
                state.audit.units_committed += 1;
                if source == ChargeSource::Overage {
                    state.audit.units_committed_overage += 1;
                }
                debug!(
                    account = %reservation.account_id,
                    reservation = %reservation.id,
                    "reservation committed"
                );
                Ok(())
            }
            ReservationStatus::Committed => Ok(()),
            ReservationStatus::Released => {
                error!(
                    account = %reservation.account_id,
                    reservation = %reservation.id,
                    "commit of a released reservation"
                );
                Err(Error::ReservationState {
                    reservation_id: reservation.id,
                    detail: "commit of a released reservation".to_string(),
                })
            }
        }
    }

    /// Return the unit to its original source. Idempotent; releasing a
    /// committed reservation is a reported logic error, never a silent
    /// no-op.
    pub fn release(&self, reservation: &Reservation) -> Result<(), Error> {
        let state = self.state(&reservation.account_id)?;
        let mut state = lock(&state);

        let Some(record) = state.reservations.get_mut(&reservation.id) else {
            return Err(Error::ReservationState {
                reservation_id: reservation.id,
                detail: "release of unknown reservation".to_string(),
            });
        };

        match record.status {
            ReservationStatus::Held => {
                record.status = ReservationStatus::Released;
                let source = record.source;
                source.refund(&mut state.balance);
                state.audit.units_held -= 1;
                debug!(
                    account = %reservation.account_id,
                    reservation = %reservation.id,
                    %source,
                    "reservation released"
                );
                Ok(())
            }
            ReservationStatus::Released => Ok(()),
            ReservationStatus::Committed => {
                error!(
                    account = %reservation.account_id,
                    reservation = %reservation.id,
                    "release of a committed reservation"
                );
                Err(Error::ReservationState {
                    reservation_id: reservation.id,
                    detail: "release of a committed reservation".to_string(),
                })
            }
        }
    }

    /// Increase one grant-source balance. Used by the sync engine and
    /// install-time trial seeding. A delta that would overflow the balance
    /// is rejected with zero mutations.
    pub fn grant(
        &self,
        account_id: &AccountId,
        source: CreditSource,
        delta: u32,
    ) -> Result<(), Error> {
        let state = self.state(account_id)?;
        let mut state = lock(&state);

        let slot = match source {
            CreditSource::Trial => &mut state.balance.trial_units,
            CreditSource::Coupon => &mut state.balance.coupon_units,
            CreditSource::Plan => &mut state.balance.plan_units,
            CreditSource::Purchased => &mut state.balance.purchased_units,
        };
        *slot = slot.checked_add(delta).ok_or_else(|| {
            Error::InvalidRequest(format!("grant of {delta} units overflows {source} balance"))
        })?;
        state.audit.units_granted += delta as i64;
        debug!(account = %account_id, %source, delta, "granted units");
        Ok(())
    }

    /// Set plan units to the externally-confirmed entitlement. Unused
    /// prior-period plan units are discarded — there is no rollover. A new
    /// billing period resets the per-period overage counter.
    pub fn reset_plan(
        &self,
        account_id: &AccountId,
        new_plan_units: u32,
        period: Option<BillingPeriod>,
    ) -> Result<(), Error> {
        let state = self.state(account_id)?;
        let mut state = lock(&state);

        let old_units = state.balance.plan_units;
        state.balance.plan_units = new_plan_units;
        state.audit.units_granted += new_plan_units as i64 - old_units as i64;

        if let Some(new_period) = period {
            let advanced = state
                .period
                .is_none_or(|current| new_period.start > current.start);
            if advanced {
                state.balance.overage_units_used_this_period = Decimal::ZERO;
            }
            state.period = Some(new_period);
        }
        debug!(account = %account_id, old_units, new_plan_units, "plan entitlement reset");
        Ok(())
    }

    /// Record the externally-confirmed plan handle for the account.
    pub fn set_plan_handle(
        &self,
        account_id: &AccountId,
        handle: Option<String>,
    ) -> Result<(), Error> {
        let state = self.state(account_id)?;
        lock(&state).plan_handle = handle;
        Ok(())
    }

    /// Balance read for the inbound API surface.
    pub fn balance(&self, account_id: &AccountId) -> Result<CreditBreakdown, Error> {
        let state = self.state(account_id)?;
        let state = lock(&state);
        Ok(CreditBreakdown::of(&state.balance, self.unit_price))
    }

    pub fn account(&self, account_id: &AccountId) -> Result<AccountInfo, Error> {
        let state = self.state(account_id)?;
        let state = lock(&state);
        Ok(AccountInfo {
            account_id: account_id.clone(),
            plan_handle: state.plan_handle.clone(),
            period: state.period,
        })
    }

    /// Conservation counters for the account.
    pub fn audit(&self, account_id: &AccountId) -> Result<LedgerAudit, Error> {
        let state = self.state(account_id)?;
        Ok(lock(&state).audit)
    }

    /// Authoritative status of a reservation, if the ledger still knows it.
    pub fn reservation_status(&self, reservation: &Reservation) -> Option<ReservationStatus> {
        let state = self.state(&reservation.account_id).ok()?;
        let state = lock(&state);
        state
            .reservations
            .get(&reservation.id)
            .map(|record| record.status)
    }

    /// Reservations still held for the account. A steady-state nonzero
    /// count indicates a caller that neither committed nor released.
    pub fn held_count(&self, account_id: &AccountId) -> Result<u64, Error> {
        let state = self.state(account_id)?;
        let held = lock(&state).audit.units_held;
        if held > 0 {
            warn!(account = %account_id, held, "reservations still held");
        }
        Ok(held)
    }

    fn state(&self, account_id: &AccountId) -> Result<Arc<Mutex<AccountState>>, Error> {
        self.accounts
            .get(account_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }
}

/// Critical sections are short and never panic while holding the lock, but
/// recover from poisoning anyway rather than unwinding the caller.
fn lock(state: &Arc<Mutex<AccountState>>) -> MutexGuard<'_, AccountState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger_with_account(account: &AccountId) -> CreditLedger {
        let ledger = CreditLedger::new(dec!(0.50));
        ledger.open_account(account.clone(), dec!(1.00));
        ledger
    }

    #[test]
    fn test_reserve_priority_order() {
        let account = AccountId::from("acct-priority");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Trial, 1).unwrap();
        ledger.grant(&account, CreditSource::Coupon, 1).unwrap();
        ledger.grant(&account, CreditSource::Plan, 1).unwrap();

        let first = ledger.reserve(&account).unwrap();
        assert_eq!(first.source, ChargeSource::Trial);
        let second = ledger.reserve(&account).unwrap();
        assert_eq!(second.source, ChargeSource::Coupon);
        let third = ledger.reserve(&account).unwrap();
        assert_eq!(third.source, ChargeSource::Plan);
    }

    #[test]
    fn test_overage_cap_blocks_reserve() {
        let account = AccountId::from("acct-overage");
        let ledger = ledger_with_account(&account);

        // Cap 1.00 at 0.50/unit: exactly two overage units.
        let first = ledger.reserve(&account).unwrap();
        assert_eq!(first.source, ChargeSource::Overage);
        let second = ledger.reserve(&account).unwrap();
        assert_eq!(second.source, ChargeSource::Overage);

        let err = ledger.reserve(&account).unwrap_err();
        match err {
            Error::InsufficientCredits { breakdown } => {
                assert!(!breakdown.overage_available);
                assert_eq!(breakdown.granted_units(), 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_commit_is_idempotent() {
        let account = AccountId::from("acct-commit");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Purchased, 1).unwrap();

        let reservation = ledger.reserve(&account).unwrap();
        ledger.commit(&reservation).unwrap();
        ledger.commit(&reservation).unwrap();

        let audit = ledger.audit(&account).unwrap();
        assert_eq!(audit.units_committed, 1);
        assert_eq!(
            ledger.reservation_status(&reservation),
            Some(ReservationStatus::Committed)
        );
    }

    #[test]
    fn test_release_refunds_original_source() {
        let account = AccountId::from("acct-release");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Coupon, 1).unwrap();

        let reservation = ledger.reserve(&account).unwrap();
        assert_eq!(ledger.balance(&account).unwrap().coupon_units, 0);

        ledger.release(&reservation).unwrap();
        ledger.release(&reservation).unwrap(); // idempotent
        assert_eq!(ledger.balance(&account).unwrap().coupon_units, 1);
        assert_eq!(ledger.audit(&account).unwrap().units_committed, 0);
    }

    #[test]
    fn test_release_after_commit_is_reported() {
        let account = AccountId::from("acct-invariant");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Trial, 1).unwrap();

        let reservation = ledger.reserve(&account).unwrap();
        ledger.commit(&reservation).unwrap();

        let err = ledger.release(&reservation).unwrap_err();
        assert!(matches!(err, Error::ReservationState { .. }));
        // The committed deduction stands.
        assert_eq!(ledger.balance(&account).unwrap().trial_units, 0);
    }

    #[test]
    fn test_commit_after_release_is_reported() {
        let account = AccountId::from("acct-invariant-2");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Trial, 1).unwrap();

        let reservation = ledger.reserve(&account).unwrap();
        ledger.release(&reservation).unwrap();

        let err = ledger.commit(&reservation).unwrap_err();
        assert!(matches!(err, Error::ReservationState { .. }));
    }

    #[test]
    fn test_reset_plan_discards_rollover_and_resets_overage() {
        let account = AccountId::from("acct-reset");
        let ledger = ledger_with_account(&account);
        ledger.grant(&account, CreditSource::Plan, 7).unwrap();

        // Burn one overage unit so the period counter is nonzero.
        for _ in 0..7 {
            let r = ledger.reserve(&account).unwrap();
            ledger.commit(&r).unwrap();
        }
        let overage = ledger.reserve(&account).unwrap();
        assert_eq!(overage.source, ChargeSource::Overage);
        ledger.commit(&overage).unwrap();

        let now = chrono::Utc::now();
        let period = BillingPeriod::new(now, now + chrono::Duration::days(30));
        ledger.reset_plan(&account, 100, Some(period)).unwrap();

        let breakdown = ledger.balance(&account).unwrap();
        assert_eq!(breakdown.plan_units, 100);
        assert_eq!(
            breakdown.overage_units_used_this_period,
            rust_decimal::Decimal::ZERO
        );
    }

    #[test]
    fn test_grant_overflow_rejected_without_mutation() {
        let account = AccountId::from("acct-overflow");
        let ledger = ledger_with_account(&account);
        ledger
            .grant(&account, CreditSource::Purchased, u32::MAX)
            .unwrap();

        let err = ledger
            .grant(&account, CreditSource::Purchased, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Balance and conservation counters are untouched by the rejection.
        assert_eq!(
            ledger.balance(&account).unwrap().purchased_units,
            u32::MAX
        );
        assert_eq!(ledger.audit(&account).unwrap().units_granted, u32::MAX as i64);
    }

    #[test]
    fn test_unknown_account() {
        let ledger = CreditLedger::new(dec!(0.50));
        let missing = AccountId::from("nope");
        assert!(matches!(
            ledger.reserve(&missing),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_reserves_never_oversell() {
        use std::thread;

        let account = AccountId::from("acct-concurrent");
        let ledger = Arc::new(CreditLedger::new(dec!(0.50)));
        // Zero overage cap: exactly 10 grantable units exist.
        ledger.open_account(account.clone(), dec!(0));
        ledger.grant(&account, CreditSource::Plan, 10).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let account = account.clone();
                thread::spawn(move || {
                    let mut won = 0u32;
                    for _ in 0..5 {
                        if let Ok(reservation) = ledger.reserve(&account) {
                            ledger.commit(&reservation).unwrap();
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 10);
        assert_eq!(ledger.balance(&account).unwrap().granted_units(), 0);

        let audit = ledger.audit(&account).unwrap();
        assert_eq!(audit.units_committed, 10);
        assert_eq!(audit.units_granted, 10);
    }
}
