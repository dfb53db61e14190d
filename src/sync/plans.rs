//! Plan catalog: the set of plans this deployment knows how to account for.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::snapshot::SubscriptionSnapshot;
use crate::Error;
use crate::types::AccountId;

/// Entitlements and pricing for one plan handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub handle: String,
    pub included_units: u32,
    pub monthly_price: Decimal,
    pub currency: String,
}

/// Immutable lookup from plan handle to entitlement.
///
/// The sync engine validates every fetched snapshot against this catalog;
/// a snapshot it cannot map is surfaced as an inconsistency, never guessed
/// into a ledger mutation.
#[derive(Clone, Debug, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, PlanSpec>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: PlanSpec) -> Self {
        self.plans.insert(plan.handle.clone(), plan);
        self
    }

    pub fn get(&self, handle: &str) -> Option<&PlanSpec> {
        self.plans.get(handle)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Map a fetched snapshot to a catalog plan, rejecting unknown handles
    /// and entitlement or currency mismatches.
    pub fn resolve(
        &self,
        account_id: &AccountId,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<&PlanSpec, Error> {
        let Some(spec) = self.plans.get(&snapshot.plan_handle) else {
            return Err(self.inconsistency(
                account_id,
                format!("unknown plan handle {:?}", snapshot.plan_handle),
            ));
        };

        if snapshot.included_units != spec.included_units {
            return Err(self.inconsistency(
                account_id,
                format!(
                    "plan {:?} reports {} included units, catalog says {}",
                    snapshot.plan_handle, snapshot.included_units, spec.included_units
                ),
            ));
        }

        if let Some(currency) = &snapshot.currency
            && currency != &spec.currency
        {
            return Err(self.inconsistency(
                account_id,
                format!(
                    "plan {:?} reports currency {currency}, catalog says {}",
                    snapshot.plan_handle, spec.currency
                ),
            ));
        }

        Ok(spec)
    }

    fn inconsistency(&self, account_id: &AccountId, detail: String) -> Error {
        warn!(account = %account_id, %detail, "subscription snapshot cannot be mapped");
        Error::SyncInconsistency {
            account_id: account_id.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SubscriptionStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new().with_plan(PlanSpec {
            handle: "starter".into(),
            included_units: 100,
            monthly_price: dec!(9.99),
            currency: "USD".into(),
        })
    }

    fn snapshot(handle: &str, units: u32, currency: Option<&str>) -> SubscriptionSnapshot {
        let now = Utc::now();
        SubscriptionSnapshot {
            plan_handle: handle.into(),
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end: now + chrono::Duration::days(30),
            included_units: units,
            currency: currency.map(String::from),
        }
    }

    #[test]
    fn test_resolve_known_plan() {
        let account = AccountId::from("acct");
        let spec = catalog()
            .resolve(&account, &snapshot("starter", 100, Some("USD")))
            .cloned()
            .unwrap();
        assert_eq!(spec.included_units, 100);
    }

    #[test]
    fn test_unknown_handle_is_inconsistency() {
        let account = AccountId::from("acct");
        let err = catalog()
            .resolve(&account, &snapshot("mystery", 100, None))
            .unwrap_err();
        assert!(matches!(err, Error::SyncInconsistency { .. }));
    }

    #[test]
    fn test_units_mismatch_is_inconsistency() {
        let account = AccountId::from("acct");
        let err = catalog()
            .resolve(&account, &snapshot("starter", 250, None))
            .unwrap_err();
        assert!(matches!(err, Error::SyncInconsistency { .. }));
    }

    #[test]
    fn test_currency_mismatch_is_inconsistency() {
        let account = AccountId::from("acct");
        let err = catalog()
            .resolve(&account, &snapshot("starter", 100, Some("EUR")))
            .unwrap_err();
        assert!(matches!(err, Error::SyncInconsistency { .. }));

        // No reported currency skips the check.
        assert!(
            catalog()
                .resolve(&account, &snapshot("starter", 100, None))
                .is_ok()
        );
    }
}
