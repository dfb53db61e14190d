//! Inbound API surface.
//!
//! [`TryOnService`] wires the ledger, cache, sync engine, and orchestrator
//! together behind one facade. Every response — success or failure — carries
//! a request-correlation id for support tracing, and every operation runs
//! inside a tracing span tagged with it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::Error;
use crate::cache::{CacheDisposition, GenerationCache};
use crate::config::CoreConfig;
use crate::ledger::{CreditBreakdown, CreditLedger, CreditSource};
use crate::orchestrator::{BatchOrchestrator, BatchSummary};
use crate::providers::{AssetStore, SubscriptionProvider, SynthesisProvider};
use crate::sync::{PlanCatalog, SyncAction, SyncEngine};
use crate::types::{AccountId, AssetRef};

/// A failure with its request-correlation id attached.
#[derive(Debug, thiserror::Error)]
#[error("request {request_id}: {error}")]
pub struct ServiceError {
    pub request_id: Uuid,
    #[source]
    pub error: Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    pub request_id: Uuid,
    pub account_id: AccountId,
    /// Trial units seeded for a fresh install; zero on reinstall.
    pub trial_units_granted: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: Uuid,
    pub asset: AssetRef,
    pub disposition: CacheDisposition,
    pub units_charged: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemResponse {
    pub garment_key: String,
    pub asset: Option<AssetRef>,
    pub disposition: Option<CacheDisposition>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub request_id: Uuid,
    pub items: Vec<ItemResponse>,
    pub summary: BatchSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub request_id: Uuid,
    pub account_id: AccountId,
    pub breakdown: CreditBreakdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub request_id: Uuid,
    pub action: SyncAction,
}

/// Facade over the consistency core.
pub struct TryOnService {
    config: CoreConfig,
    ledger: Arc<CreditLedger>,
    cache: Arc<GenerationCache>,
    sync: SyncEngine,
    orchestrator: BatchOrchestrator,
}

impl TryOnService {
    pub fn builder() -> TryOnServiceBuilder {
        TryOnServiceBuilder::default()
    }

    /// Create the account and seed trial units. Idempotent: a reinstall
    /// neither errors nor re-seeds.
    pub fn install(&self, account_id: impl Into<AccountId>) -> Result<InstallResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let account_id = account_id.into();
        let span = info_span!("install", request = %request_id, account = %account_id);
        let _entered = span.enter();

        let created = self
            .ledger
            .open_account(account_id.clone(), self.config.default_overage_cap);
        let seeded = if created { self.config.trial_units } else { 0 };
        if seeded > 0 {
            self.ledger
                .grant(&account_id, CreditSource::Trial, seeded)
                .map_err(|error| ServiceError { request_id, error })?;
        }
        Ok(InstallResponse {
            request_id,
            account_id,
            trial_units_granted: seeded,
        })
    }

    /// Single-garment generation.
    pub async fn generate(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_key: &str,
    ) -> Result<GenerationResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("generate", request = %request_id, account = %account_id);
        async {
            let outcome = self
                .orchestrator
                .generate(account_id, subject_key, garment_key)
                .await
                .map_err(|error| ServiceError { request_id, error })?;
            Ok(GenerationResponse {
                request_id,
                units_charged: outcome.charged() as u32,
                asset: outcome.result,
                disposition: outcome.disposition,
            })
        }
        .instrument(span)
        .await
    }

    /// Batch generation: one result per garment in input order, failures
    /// isolated per item.
    pub async fn generate_batch(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_keys: &[String],
    ) -> Result<BatchResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("generate_batch", request = %request_id, account = %account_id);
        async {
            let batch = self
                .orchestrator
                .generate_batch(account_id, subject_key, garment_keys)
                .await
                .map_err(|error| ServiceError { request_id, error })?;

            let items = batch
                .items
                .into_iter()
                .map(|item| match item.outcome {
                    Ok(outcome) => ItemResponse {
                        garment_key: item.garment_key,
                        asset: Some(outcome.result),
                        disposition: Some(outcome.disposition),
                        error: None,
                    },
                    Err(error) => ItemResponse {
                        garment_key: item.garment_key,
                        asset: None,
                        disposition: None,
                        error: Some(error.to_string()),
                    },
                })
                .collect();

            Ok(BatchResponse {
                request_id,
                items,
                summary: batch.summary,
            })
        }
        .instrument(span)
        .await
    }

    /// Composite outfit generation: one unit, one synthesis call, succeeds
    /// or fails as a whole.
    pub async fn generate_combined(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_keys: &[String],
    ) -> Result<GenerationResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("generate_combined", request = %request_id, account = %account_id);
        async {
            let combined = self
                .orchestrator
                .generate_combined(account_id, subject_key, garment_keys)
                .await
                .map_err(|error| ServiceError { request_id, error })?;
            Ok(GenerationResponse {
                request_id,
                units_charged: (combined.disposition == CacheDisposition::Computed) as u32,
                asset: combined.result,
                disposition: combined.disposition,
            })
        }
        .instrument(span)
        .await
    }

    /// Balance read.
    pub fn balance(&self, account_id: &AccountId) -> Result<BalanceResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let breakdown = self
            .ledger
            .balance(account_id)
            .map_err(|error| ServiceError { request_id, error })?;
        Ok(BalanceResponse {
            request_id,
            account_id: account_id.clone(),
            breakdown,
        })
    }

    /// Explicit reconciliation trigger.
    pub async fn sync(&self, account_id: &AccountId) -> Result<SyncResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("sync", request = %request_id, account = %account_id);
        async {
            let action = self
                .sync
                .sync(account_id)
                .await
                .map_err(|error| ServiceError { request_id, error })?;
            Ok(SyncResponse { request_id, action })
        }
        .instrument(span)
        .await
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &GenerationCache {
        &self.cache
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

/// Builds a [`TryOnService`] from its collaborators.
#[derive(Default)]
pub struct TryOnServiceBuilder {
    config: CoreConfig,
    catalog: PlanCatalog,
    synthesizer: Option<Arc<dyn SynthesisProvider>>,
    subscriptions: Option<Arc<dyn SubscriptionProvider>>,
    assets: Option<Arc<dyn AssetStore>>,
}

impl TryOnServiceBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn plan_catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn synthesizer(mut self, provider: Arc<dyn SynthesisProvider>) -> Self {
        self.synthesizer = Some(provider);
        self
    }

    pub fn subscriptions(mut self, provider: Arc<dyn SubscriptionProvider>) -> Self {
        self.subscriptions = Some(provider);
        self
    }

    pub fn asset_store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(store);
        self
    }

    pub fn build(self) -> Result<TryOnService, Error> {
        let synthesizer = self
            .synthesizer
            .ok_or_else(|| Error::InvalidRequest("synthesis provider is required".into()))?;
        let subscriptions = self
            .subscriptions
            .ok_or_else(|| Error::InvalidRequest("subscription provider is required".into()))?;
        let assets = self
            .assets
            .ok_or_else(|| Error::InvalidRequest("asset store is required".into()))?;

        let ledger = Arc::new(CreditLedger::new(self.config.unit_price));
        let cache = Arc::new(GenerationCache::new(Arc::clone(&ledger), assets));
        let sync = SyncEngine::new(Arc::clone(&ledger), subscriptions, self.catalog);
        let orchestrator =
            BatchOrchestrator::new(Arc::clone(&cache), synthesizer, self.config.clone());

        Ok(TryOnService {
            config: self.config,
            ledger,
            cache,
            sync,
            orchestrator,
        })
    }
}
