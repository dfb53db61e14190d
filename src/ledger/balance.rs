//! Balance sources and the priority deduction chain.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The four grantable balance sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditSource {
    Trial,
    Coupon,
    Plan,
    Purchased,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Coupon => "coupon",
            Self::Plan => "plan",
            Self::Purchased => "purchased",
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a unit can be charged against: the four grant sources plus
/// capped pay-per-unit overage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeSource {
    Trial,
    Coupon,
    Plan,
    Purchased,
    Overage,
}

/// Fixed deduction order. Adding a tier is a data change here, not a
/// control-flow change in `reserve`.
pub const CHARGE_PRIORITY: [ChargeSource; 5] = [
    ChargeSource::Trial,
    ChargeSource::Coupon,
    ChargeSource::Plan,
    ChargeSource::Purchased,
    ChargeSource::Overage,
];

impl ChargeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Coupon => "coupon",
            Self::Plan => "plan",
            Self::Purchased => "purchased",
            Self::Overage => "overage",
        }
    }

    /// Whether one more unit can be withdrawn from this source.
    pub(crate) fn available(&self, balance: &CreditBalance, unit_price: Decimal) -> bool {
        match self {
            Self::Trial => balance.trial_units > 0,
            Self::Coupon => balance.coupon_units > 0,
            Self::Plan => balance.plan_units > 0,
            Self::Purchased => balance.purchased_units > 0,
            Self::Overage => {
                balance.overage_units_used_this_period * unit_price < balance.overage_cap_amount
            }
        }
    }

    /// Withdraw one unit. Callers must check `available` first under the
    /// same account lock.
    pub(crate) fn withdraw(&self, balance: &mut CreditBalance) {
        match self {
            Self::Trial => balance.trial_units -= 1,
            Self::Coupon => balance.coupon_units -= 1,
            Self::Plan => balance.plan_units -= 1,
            Self::Purchased => balance.purchased_units -= 1,
            Self::Overage => balance.overage_units_used_this_period += Decimal::ONE,
        }
    }

    /// Return one unit to this source (reservation release).
    pub(crate) fn refund(&self, balance: &mut CreditBalance) {
        match self {
            Self::Trial => balance.trial_units += 1,
            Self::Coupon => balance.coupon_units += 1,
            Self::Plan => balance.plan_units += 1,
            Self::Purchased => balance.purchased_units += 1,
            Self::Overage => {
                if balance.overage_units_used_this_period >= Decimal::ONE {
                    balance.overage_units_used_this_period -= Decimal::ONE;
                }
            }
        }
    }
}

impl fmt::Display for ChargeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CreditSource> for ChargeSource {
    fn from(source: CreditSource) -> Self {
        match source {
            CreditSource::Trial => Self::Trial,
            CreditSource::Coupon => Self::Coupon,
            CreditSource::Plan => Self::Plan,
            CreditSource::Purchased => Self::Purchased,
        }
    }
}

/// Per-account balances across all sources plus the per-period overage
/// counter. Every committed field is non-negative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub trial_units: u32,
    pub coupon_units: u32,
    pub plan_units: u32,
    pub purchased_units: u32,
    pub overage_units_used_this_period: Decimal,
    pub overage_cap_amount: Decimal,
}

impl CreditBalance {
    /// Remaining units across the four grant sources (overage excluded).
    pub fn granted_units(&self) -> u64 {
        self.trial_units as u64
            + self.coupon_units as u64
            + self.plan_units as u64
            + self.purchased_units as u64
    }
}

/// User-facing snapshot of an account's balances, attached to
/// insufficient-credit failures and returned by the balance read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditBreakdown {
    pub trial_units: u32,
    pub coupon_units: u32,
    pub plan_units: u32,
    pub purchased_units: u32,
    pub overage_units_used_this_period: Decimal,
    pub overage_cap_amount: Decimal,
    pub overage_available: bool,
}

impl CreditBreakdown {
    pub(crate) fn of(balance: &CreditBalance, unit_price: Decimal) -> Self {
        Self {
            trial_units: balance.trial_units,
            coupon_units: balance.coupon_units,
            plan_units: balance.plan_units,
            purchased_units: balance.purchased_units,
            overage_units_used_this_period: balance.overage_units_used_this_period,
            overage_cap_amount: balance.overage_cap_amount,
            overage_available: ChargeSource::Overage.available(balance, unit_price),
        }
    }

    pub fn granted_units(&self) -> u64 {
        self.trial_units as u64
            + self.coupon_units as u64
            + self.plan_units as u64
            + self.purchased_units as u64
    }
}

impl fmt::Display for CreditBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trial={} coupon={} plan={} purchased={} overage_used={} overage_cap={}",
            self.trial_units,
            self.coupon_units,
            self.plan_units,
            self.purchased_units,
            self.overage_units_used_this_period,
            self.overage_cap_amount,
        )
    }
}
