//! Idempotent reconciliation against the external subscription-of-record.
//!
//! Classification is a pure function of (stored snapshot, fetched snapshot);
//! the engine applies the resulting ledger mutations under a per-account
//! lock and stores the new snapshot. Repeated syncs with no external change
//! always classify as `NoAction`, so callers may trigger it speculatively —
//! on login, periodically, or during error recovery — with zero risk of
//! re-granting or re-clearing credits.

mod plans;
mod snapshot;

pub use plans::{PlanCatalog, PlanSpec};
pub use snapshot::{SubscriptionSnapshot, SubscriptionStatus};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::Error;
use crate::ledger::CreditLedger;
use crate::providers::SubscriptionProvider;
use crate::types::AccountId;

/// What a reconciliation pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    /// First sighting of an active subscription: entitlement granted.
    Initialized,
    /// Plan handle changed; prior unused plan units are discarded.
    PlanChanged,
    /// Same plan, new billing period.
    Renewed,
    /// No active subscription upstream: plan units zeroed, other sources
    /// untouched.
    Cancelled,
    /// Nothing changed; zero mutations.
    NoAction,
}

/// Classify a fetched snapshot against the stored one. Pure; independent of
/// invocation timing or frequency.
///
/// A fetch whose period is older than the stored one (out-of-order arrival
/// from the eventually-consistent source) never regresses state: it
/// classifies as `NoAction`.
pub fn classify(
    stored: Option<&SubscriptionSnapshot>,
    fetched: Option<&SubscriptionSnapshot>,
) -> SyncAction {
    match (stored, fetched) {
        (None, None) => SyncAction::NoAction,
        (None, Some(_)) => SyncAction::Initialized,
        (Some(_), None) => SyncAction::Cancelled,
        (Some(stored), Some(fetched)) => {
            if stored == fetched {
                SyncAction::NoAction
            } else if stored.plan_handle != fetched.plan_handle {
                SyncAction::PlanChanged
            } else if fetched.period_start > stored.period_start {
                SyncAction::Renewed
            } else {
                SyncAction::NoAction
            }
        }
    }
}

/// Reconciles ledger grant sources against the subscription-of-record.
pub struct SyncEngine {
    ledger: Arc<CreditLedger>,
    provider: Arc<dyn SubscriptionProvider>,
    catalog: PlanCatalog,
    snapshots: DashMap<AccountId, SubscriptionSnapshot>,
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl SyncEngine {
    pub fn new(
        ledger: Arc<CreditLedger>,
        provider: Arc<dyn SubscriptionProvider>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            ledger,
            provider,
            catalog,
            snapshots: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Fetch, classify, and apply. Serialized per account; different
    /// accounts reconcile in parallel.
    ///
    /// A snapshot that cannot be mapped to the catalog is surfaced as
    /// [`Error::SyncInconsistency`] with zero ledger mutations.
    pub async fn sync(&self, account_id: &AccountId) -> Result<SyncAction, Error> {
        let guard = self.account_lock(account_id);
        let _held = guard.lock().await;

        let fetched = self
            .provider
            .fetch_active_subscription(account_id)
            .await?
            .filter(|snapshot| snapshot.status.is_active());
        let stored = self
            .snapshots
            .get(account_id)
            .map(|entry| entry.value().clone());

        let action = classify(stored.as_ref(), fetched.as_ref());
        match (action, fetched) {
            (SyncAction::NoAction, _) => {}
            (SyncAction::Cancelled, _) => {
                self.ledger.reset_plan(account_id, 0, None)?;
                self.ledger.set_plan_handle(account_id, None)?;
                self.snapshots.remove(account_id);
            }
            (_, Some(snapshot)) => {
                // Validate before any mutation.
                let spec = self.catalog.resolve(account_id, &snapshot)?;
                self.ledger.reset_plan(
                    account_id,
                    spec.included_units,
                    Some(snapshot.period()),
                )?;
                self.ledger
                    .set_plan_handle(account_id, Some(snapshot.plan_handle.clone()))?;
                self.snapshots.insert(account_id.clone(), snapshot);
            }
            // classify only yields the grant actions when a fetched
            // snapshot exists.
            (_, None) => unreachable!("grant action without a fetched snapshot"),
        }

        if action != SyncAction::NoAction {
            info!(account = %account_id, ?action, "subscription reconciled");
        }
        Ok(action)
    }

    /// Stored snapshot for the account, if any.
    pub fn stored_snapshot(&self, account_id: &AccountId) -> Option<SubscriptionSnapshot> {
        self.snapshots
            .get(account_id)
            .map(|entry| entry.value().clone())
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    fn account_lock(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
