//! In-memory collaborator doubles.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{AssetStore, SubscriptionProvider, SynthesisOutput, SynthesisProvider};
use crate::Error;
use crate::sync::SubscriptionSnapshot;
use crate::types::{AccountId, AssetRef};

/// Scriptable synthesis backend.
///
/// Renders a deterministic payload per request, counts invocations (the
/// dedup property tests depend on this), and can be told to fail for
/// specific garment references or to add latency.
#[derive(Default)]
pub struct MockSynthesis {
    invocations: AtomicUsize,
    latency: Option<Duration>,
    failing: Mutex<Vec<String>>,
}

impl MockSynthesis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail any request that includes this garment reference.
    pub fn fail_for(&self, garment: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(garment.into());
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn should_fail(&self, garments: &[AssetRef]) -> bool {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        garments
            .iter()
            .any(|garment| failing.iter().any(|f| f == garment.as_str()))
    }
}

#[async_trait]
impl SynthesisProvider for MockSynthesis {
    async fn synthesize(
        &self,
        subject: &AssetRef,
        garments: &[AssetRef],
    ) -> Result<SynthesisOutput, Error> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.should_fail(garments) {
            return Err(Error::Provider(format!(
                "synthesis backend rejected request for subject {subject}"
            )));
        }

        let mut names: Vec<&str> = garments.iter().map(AssetRef::as_str).collect();
        names.sort_unstable();
        let payload = format!("render:{}:{}", subject, names.join("+"));
        Ok(SynthesisOutput {
            data: Bytes::from(payload),
            duration: self.latency.unwrap_or(Duration::from_millis(1)),
        })
    }
}

/// Asset store backed by a concurrent map, issuing sequential references.
#[derive(Default)]
pub struct MemoryAssetStore {
    objects: DashMap<AssetRef, Bytes>,
    counter: AtomicU64,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn put(&self, data: Bytes) -> Result<AssetRef, Error> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let reference = AssetRef::new(format!("asset-{id}"));
        self.objects.insert(reference.clone(), data);
        Ok(reference)
    }

    async fn get(&self, asset: &AssetRef) -> Result<Option<Bytes>, Error> {
        Ok(self.objects.get(asset).map(|entry| entry.value().clone()))
    }
}

/// Subscription-of-record double with per-account settable snapshots.
#[derive(Default)]
pub struct StaticSubscriptions {
    snapshots: DashMap<AccountId, SubscriptionSnapshot>,
}

impl StaticSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what the next fetch returns for the account.
    pub fn set(&self, account_id: AccountId, snapshot: SubscriptionSnapshot) {
        self.snapshots.insert(account_id, snapshot);
    }

    /// Simulate a cancellation upstream: subsequent fetches return `None`.
    pub fn clear(&self, account_id: &AccountId) {
        self.snapshots.remove(account_id);
    }
}

#[async_trait]
impl SubscriptionProvider for StaticSubscriptions {
    async fn fetch_active_subscription(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<SubscriptionSnapshot>, Error> {
        Ok(self
            .snapshots
            .get(account_id)
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_synthesis_deterministic() {
        let backend = MockSynthesis::new();
        let subject = AssetRef::from("subject-1");
        let garments = [AssetRef::from("b"), AssetRef::from("a")];

        let output = backend.synthesize(&subject, &garments).await.unwrap();
        assert_eq!(output.data, Bytes::from_static(b"render:subject-1:a+b"));
        assert_eq!(backend.invocations(), 1);
    }

    #[tokio::test]
    async fn test_mock_synthesis_scripted_failure() {
        let backend = MockSynthesis::new();
        backend.fail_for("cursed-garment");

        let subject = AssetRef::from("subject-1");
        let err = backend
            .synthesize(&subject, &[AssetRef::from("cursed-garment")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        // Failures still count as invocations.
        assert_eq!(backend.invocations(), 1);
    }

    #[tokio::test]
    async fn test_memory_asset_store_roundtrip() {
        let store = MemoryAssetStore::new();
        let reference = store.put(Bytes::from_static(b"img")).await.unwrap();
        let loaded = store.get(&reference).await.unwrap();
        assert_eq!(loaded, Some(Bytes::from_static(b"img")));
        assert_eq!(store.get(&AssetRef::from("missing")).await.unwrap(), None);
    }
}
