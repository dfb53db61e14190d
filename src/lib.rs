//! # tryon-core
//!
//! Consistency core for a storefront virtual try-on extension. It fronts an
//! expensive, pay-per-call generative synthesis backend and guarantees:
//!
//! - no overspend: every synthesis charges exactly one unit, withdrawn from
//!   the correct balance source in priority order (trial, coupon, plan,
//!   purchased, then capped overage);
//! - no double pay: identical work is content-addressed and deduplicated,
//!   with at most one concurrent computation per key;
//! - no dropped refund: failed synthesis releases its reservation back to
//!   the source it came from;
//! - no ledger drift: reconciliation against the external
//!   subscription-of-record is idempotent and never guesses.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tryon_core::{
//!     AccountId, MemoryAssetStore, MockSynthesis, StaticSubscriptions, TryOnService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = TryOnService::builder()
//!         .synthesizer(Arc::new(MockSynthesis::new()))
//!         .subscriptions(Arc::new(StaticSubscriptions::new()))
//!         .asset_store(Arc::new(MemoryAssetStore::new()))
//!         .build()?;
//!
//!     let account = AccountId::from("shop-1");
//!     service.install(account.clone())?;
//!     let response = service.generate(&account, "subject-1", "jacket").await?;
//!     println!("rendered {} (request {})", response.asset, response.request_id);
//!     Ok(())
//! }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod config;
pub mod ledger;
pub mod orchestrator;
pub mod providers;
pub mod service;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use cache::{CacheDisposition, CacheKey, CacheOutcome, GenerationCache};
pub use config::CoreConfig;
pub use ledger::{
    AccountInfo, CHARGE_PRIORITY, ChargeSource, CreditBalance, CreditBreakdown, CreditLedger,
    CreditSource, LedgerAudit, Reservation, ReservationStatus,
};
pub use orchestrator::{BatchOrchestrator, BatchResult, BatchSummary, CombinedResult, ItemResult};
pub use providers::{
    AssetStore, MemoryAssetStore, MockSynthesis, StaticSubscriptions, SubscriptionProvider,
    SynthesisOutput, SynthesisProvider,
};
pub use service::{
    BalanceResponse, BatchResponse, GenerationResponse, InstallResponse, ItemResponse,
    ServiceError, SyncResponse, TryOnService, TryOnServiceBuilder,
};
pub use sync::{
    PlanCatalog, PlanSpec, SubscriptionSnapshot, SubscriptionStatus, SyncAction, SyncEngine,
    classify,
};
pub use types::{AccountId, AssetRef, BillingPeriod};

use std::sync::Arc;

/// Error type for tryon-core operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No balance source has capacity for another unit. Non-retryable
    /// without a plan change or purchase; carries the full breakdown for
    /// display.
    #[error("insufficient credits: {breakdown}")]
    InsufficientCredits { breakdown: CreditBreakdown },

    /// The shared computation behind a cache entry failed. The reservation
    /// was released and the entry evicted; the underlying cause is attached
    /// but not guaranteed safe for end-user display.
    #[error("generation failed for cache key {key}: {cause}")]
    CacheComputation { key: String, cause: Arc<Error> },

    /// The external subscription snapshot cannot be mapped to a known
    /// plan. Surfaced with zero ledger mutations rather than guessed.
    #[error("sync inconsistency for account {account_id}: {detail}")]
    SyncInconsistency {
        account_id: AccountId,
        detail: String,
    },

    /// Reservation lifecycle invariant violation, e.g. releasing a
    /// committed reservation. Never silently swallowed.
    #[error("reservation {reservation_id} state violation: {detail}")]
    ReservationState {
        reservation_id: uuid::Uuid,
        detail: String,
    },

    /// Operation against an account that was never installed.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// Request parameters are invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's upstream timeout expired. The caller detached; any
    /// shared computation keeps running for other waiters.
    #[error("operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// An external collaborator failed at the transport level.
    #[error("collaborator failure: {0}")]
    Provider(String),

    /// An asset reference resolved to nothing in the asset store.
    #[error("asset not found: {0}")]
    AssetMissing(AssetRef),
}

/// Error category for unified handling at the API edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Needs a plan change or purchase; show the balance breakdown.
    Payment,
    /// A ledger or reservation invariant was violated; page someone.
    InvariantViolation,
    /// May succeed on retry (collaborator hiccup, timeout).
    Transient,
    /// Bad input or missing account; fix the request.
    Request,
    /// Everything else.
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InsufficientCredits { .. } => ErrorCategory::Payment,
            Error::ReservationState { .. } => ErrorCategory::InvariantViolation,
            Error::Timeout(_) | Error::Provider(_) => ErrorCategory::Transient,
            Error::CacheComputation { cause, .. } => cause.category(),
            Error::AccountNotFound(_) | Error::InvalidRequest(_) => ErrorCategory::Request,
            Error::SyncInconsistency { .. } | Error::AssetMissing(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether the message is intended for end-user display.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Payment | ErrorCategory::Request
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let breakdown = CreditBreakdown {
            trial_units: 0,
            coupon_units: 0,
            plan_units: 0,
            purchased_units: 0,
            overage_units_used_this_period: rust_decimal::Decimal::ZERO,
            overage_cap_amount: rust_decimal::Decimal::ZERO,
            overage_available: false,
        };
        let err = Error::InsufficientCredits { breakdown };
        assert_eq!(err.category(), ErrorCategory::Payment);
        assert!(err.is_user_facing());
        assert!(!err.is_retryable());

        let err = Error::Timeout(std::time::Duration::from_secs(30));
        assert!(err.is_retryable());

        // Computation failures take their cause's category.
        let err = Error::CacheComputation {
            key: "abc".into(),
            cause: Arc::new(Error::Provider("backend down".into())),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_error_display_carries_breakdown() {
        let breakdown = CreditBreakdown {
            trial_units: 1,
            coupon_units: 2,
            plan_units: 3,
            purchased_units: 4,
            overage_units_used_this_period: rust_decimal::Decimal::ZERO,
            overage_cap_amount: rust_decimal::Decimal::ONE,
            overage_available: true,
        };
        let message = Error::InsufficientCredits { breakdown }.to_string();
        assert!(message.contains("trial=1"));
        assert!(message.contains("purchased=4"));
    }
}
