//! External collaborator seams.
//!
//! The core talks to the outside world through three object-safe traits:
//! the synthesis backend, the subscription-of-record, and the asset store.
//! In-memory doubles back the test suites.

mod mock;

pub use mock::{MemoryAssetStore, MockSynthesis, StaticSubscriptions};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Error;
use crate::sync::SubscriptionSnapshot;
use crate::types::{AccountId, AssetRef};

/// Output of one synthesis call.
#[derive(Clone, Debug)]
pub struct SynthesisOutput {
    /// Rendered image bytes. The core never inspects them; they go straight
    /// to the asset store.
    pub data: Bytes,
    /// Backend-reported render duration.
    pub duration: Duration,
}

/// The generative backend. Opaque and potentially slow (seconds); the core
/// never retries it automatically.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(
        &self,
        subject: &AssetRef,
        garments: &[AssetRef],
    ) -> Result<SynthesisOutput, Error>;
}

/// The external subscription-of-record. Eventually consistent; results may
/// be stale or arrive out of order, which the sync engine tolerates.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    /// The account's currently active subscription, or `None` when there is
    /// none.
    async fn fetch_active_subscription(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<SubscriptionSnapshot>, Error>;
}

/// Persists binary results and hands back opaque references.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn put(&self, data: Bytes) -> Result<AssetRef, Error>;
    async fn get(&self, asset: &AssetRef) -> Result<Option<Bytes>, Error>;
}
