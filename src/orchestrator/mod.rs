//! Bounded-concurrency fan-out over generation requests.
//!
//! Every item resolves through the generation cache; the semaphore caps
//! concurrent synthesis submissions only, so cache hits cost no permit and
//! excess items queue rather than drop. Item outcomes are isolated: one
//! failure never aborts or blocks the others.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::Error;
use crate::cache::{CacheDisposition, CacheKey, CacheOutcome, GenerationCache};
use crate::config::CoreConfig;
use crate::providers::SynthesisProvider;
use crate::types::{AccountId, AssetRef};

/// Outcome of one batch item, in input order.
#[derive(Debug)]
pub struct ItemResult {
    pub garment_key: String,
    pub outcome: Result<CacheOutcome, Error>,
}

/// Aggregate counts for a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BatchSummary {
    pub succeeded: u32,
    pub failed: u32,
    /// Served from a completed entry or coalesced onto another caller's
    /// computation.
    pub cached: u32,
    /// Freshly synthesized by this batch.
    pub generated: u32,
    /// Units this batch committed; cached and coalesced items charge
    /// nothing here.
    pub units_charged: u32,
}

/// Result of [`BatchOrchestrator::generate_batch`].
#[derive(Debug)]
pub struct BatchResult {
    pub items: Vec<ItemResult>,
    pub summary: BatchSummary,
}

/// Result of [`BatchOrchestrator::generate_combined`]: one composite asset
/// for the whole outfit set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CombinedResult {
    pub result: AssetRef,
    pub disposition: CacheDisposition,
}

/// Fans generation requests out over the cache with bounded parallelism.
pub struct BatchOrchestrator {
    cache: Arc<GenerationCache>,
    synthesizer: Arc<dyn SynthesisProvider>,
    permits: Arc<Semaphore>,
    config: CoreConfig,
}

impl BatchOrchestrator {
    pub fn new(
        cache: Arc<GenerationCache>,
        synthesizer: Arc<dyn SynthesisProvider>,
        config: CoreConfig,
    ) -> Self {
        Self {
            cache,
            synthesizer,
            permits: Arc::new(Semaphore::new(config.max_concurrent_synthesis)),
            config,
        }
    }

    /// Generate one garment on one subject.
    pub async fn generate(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_key: &str,
    ) -> Result<CacheOutcome, Error> {
        validate_key("subject", subject_key)?;
        validate_key("garment", garment_key)?;
        let key = CacheKey::single(subject_key, garment_key);
        self.resolve_item(account_id, subject_key, vec![garment_key.to_string()], key)
            .await
    }

    /// Generate up to `max_batch_items` garments against one subject photo,
    /// one result per input item in original order.
    pub async fn generate_batch(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_keys: &[String],
    ) -> Result<BatchResult, Error> {
        validate_key("subject", subject_key)?;
        if garment_keys.is_empty() || garment_keys.len() > self.config.max_batch_items {
            return Err(Error::InvalidRequest(format!(
                "batch size must be 1..={}, got {}",
                self.config.max_batch_items,
                garment_keys.len()
            )));
        }
        for garment in garment_keys {
            validate_key("garment", garment)?;
        }

        let items = join_all(garment_keys.iter().map(|garment| {
            let key = CacheKey::single(subject_key, garment);
            async move {
                let outcome = self
                    .resolve_item(account_id, subject_key, vec![garment.clone()], key)
                    .await;
                ItemResult {
                    garment_key: garment.clone(),
                    outcome,
                }
            }
        }))
        .await;

        let summary = summarize(&items);
        debug!(
            account = %account_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            charged = summary.units_charged,
            "batch complete"
        );
        Ok(BatchResult { items, summary })
    }

    /// Generate one composite result over a whole outfit set: one cache
    /// key, one reservation, one synthesis call. Succeeds or fails as a
    /// unit.
    pub async fn generate_combined(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_keys: &[String],
    ) -> Result<CombinedResult, Error> {
        validate_key("subject", subject_key)?;
        for garment in garment_keys {
            validate_key("garment", garment)?;
        }
        let key = CacheKey::combined(subject_key, garment_keys.iter().cloned());
        let distinct = key.garments().len();
        if distinct < self.config.min_combined_items || distinct > self.config.max_combined_items {
            return Err(Error::InvalidRequest(format!(
                "combined outfit needs {}..={} distinct garments, got {distinct}",
                self.config.min_combined_items, self.config.max_combined_items
            )));
        }

        let garments = key.garments().to_vec();
        let outcome = self
            .resolve_item(account_id, subject_key, garments, key)
            .await?;
        Ok(CombinedResult {
            result: outcome.result,
            disposition: outcome.disposition,
        })
    }

    /// Resolve one cache key, submitting synthesis under a permit and an
    /// upstream timeout. On timeout this caller detaches; the shared
    /// computation keeps running for other waiters and for caching.
    async fn resolve_item(
        &self,
        account_id: &AccountId,
        subject_key: &str,
        garment_keys: Vec<String>,
        key: CacheKey,
    ) -> Result<CacheOutcome, Error> {
        let synthesizer = Arc::clone(&self.synthesizer);
        let permits = Arc::clone(&self.permits);
        let subject = AssetRef::new(subject_key);
        let garments: Vec<AssetRef> = garment_keys.into_iter().map(AssetRef::new).collect();

        let compute = move || async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::Provider("synthesis permit pool closed".to_string()))?;
            let output = synthesizer.synthesize(&subject, &garments).await?;
            debug!(
                subject = %subject,
                garments = garments.len(),
                duration_ms = output.duration.as_millis() as u64,
                "synthesis complete"
            );
            Ok(output.data)
        };

        let resolved = self.cache.get_or_compute(account_id, key, compute);
        match tokio::time::timeout(self.config.synthesis_timeout(), resolved).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(self.config.synthesis_timeout())),
        }
    }
}

fn validate_key(what: &str, key: &str) -> Result<(), Error> {
    if key.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} key must not be empty")));
    }
    Ok(())
}

fn summarize(items: &[ItemResult]) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for item in items {
        match &item.outcome {
            Ok(outcome) => {
                summary.succeeded += 1;
                match outcome.disposition {
                    CacheDisposition::Computed => {
                        summary.generated += 1;
                        summary.units_charged += 1;
                    }
                    CacheDisposition::Hit | CacheDisposition::Coalesced => summary.cached += 1,
                }
            }
            Err(_) => summary.failed += 1,
        }
    }
    summary
}
