//! End-to-end flows through the [`TryOnService`] facade.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use tokio_test::assert_ok;
use tryon_core::{
    AccountId, BatchResponse, CacheDisposition, CoreConfig, Error, MemoryAssetStore,
    MockSynthesis, PlanCatalog, PlanSpec, StaticSubscriptions, SubscriptionProvider,
    SubscriptionSnapshot, SubscriptionStatus, SynthesisProvider, SyncAction, TryOnService,
};

struct Harness {
    service: TryOnService,
    synthesizer: Arc<MockSynthesis>,
    subscriptions: Arc<StaticSubscriptions>,
    account: AccountId,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(config: CoreConfig) -> Harness {
    init_tracing();
    let synthesizer = Arc::new(MockSynthesis::new());
    let subscriptions = Arc::new(StaticSubscriptions::new());
    let catalog = PlanCatalog::new().with_plan(PlanSpec {
        handle: "starter".into(),
        included_units: 100,
        monthly_price: dec!(9.99),
        currency: "USD".into(),
    });
    let service = TryOnService::builder()
        .config(config)
        .plan_catalog(catalog)
        .synthesizer(Arc::clone(&synthesizer) as Arc<dyn SynthesisProvider>)
        .subscriptions(Arc::clone(&subscriptions) as Arc<dyn SubscriptionProvider>)
        .asset_store(Arc::new(MemoryAssetStore::new()))
        .build()
        .unwrap();
    Harness {
        service,
        synthesizer,
        subscriptions,
        account: AccountId::from("shop-1"),
    }
}

fn active_snapshot(handle: &str, units: u32) -> SubscriptionSnapshot {
    let start = Utc::now();
    SubscriptionSnapshot {
        plan_handle: handle.into(),
        status: SubscriptionStatus::Active,
        period_start: start,
        period_end: start + Duration::days(30),
        included_units: units,
        currency: Some("USD".into()),
    }
}

#[tokio::test]
async fn test_install_generate_balance_flow() {
    let hx = harness(CoreConfig::default());

    let installed = tokio_test::assert_ok!(hx.service.install(hx.account.clone()));
    assert_eq!(installed.trial_units_granted, 3);

    let generated = hx
        .service
        .generate(&hx.account, "subject-1", "jacket")
        .await
        .unwrap();
    assert_eq!(generated.disposition, CacheDisposition::Computed);
    assert_eq!(generated.units_charged, 1);
    assert_ne!(generated.request_id, installed.request_id);

    let balance = hx.service.balance(&hx.account).unwrap();
    assert_eq!(balance.breakdown.trial_units, 2);

    // Same look again: served from cache, nothing charged.
    let repeat = hx
        .service
        .generate(&hx.account, "subject-1", "jacket")
        .await
        .unwrap();
    assert_eq!(repeat.disposition, CacheDisposition::Hit);
    assert_eq!(repeat.units_charged, 0);
    assert_eq!(repeat.asset, generated.asset);
    assert_eq!(hx.synthesizer.invocations(), 1);
}

#[tokio::test]
async fn test_reinstall_does_not_reseed_trial() {
    let hx = harness(CoreConfig::default());

    hx.service.install(hx.account.clone()).unwrap();
    let again = hx.service.install(hx.account.clone()).unwrap();
    assert_eq!(again.trial_units_granted, 0);
    assert_eq!(hx.service.balance(&hx.account).unwrap().breakdown.trial_units, 3);
}

#[tokio::test]
async fn test_failures_carry_request_ids() {
    let hx = harness(CoreConfig::default());
    hx.service.install(hx.account.clone()).unwrap();
    hx.synthesizer.fail_for("cursed");

    let err = hx
        .service
        .generate(&hx.account, "subject-1", "cursed")
        .await
        .unwrap_err();
    assert!(!err.request_id.is_nil());
    assert!(matches!(err.error, Error::CacheComputation { .. }));
    assert!(err.to_string().contains(&err.request_id.to_string()));

    // The failed attempt released its unit.
    assert_eq!(hx.service.balance(&hx.account).unwrap().breakdown.trial_units, 3);
}

#[tokio::test]
async fn test_insufficient_credits_is_user_facing() {
    let hx = harness(
        CoreConfig::default()
            .with_trial_units(0)
            .with_overage_cap(dec!(0)),
    );
    hx.service.install(hx.account.clone()).unwrap();

    let err = hx
        .service
        .generate(&hx.account, "subject-1", "jacket")
        .await
        .unwrap_err();
    assert!(matches!(err.error, Error::InsufficientCredits { .. }));
    assert!(err.error.is_user_facing());
    assert!(!err.error.is_retryable());
    assert_eq!(hx.synthesizer.invocations(), 0);
}

#[tokio::test]
async fn test_batch_response_maps_item_outcomes() {
    let hx = harness(CoreConfig::default().with_trial_units(6));
    hx.service.install(hx.account.clone()).unwrap();
    hx.synthesizer.fail_for("cursed");

    let garments: Vec<String> = ["jacket", "cursed", "boots"]
        .into_iter()
        .map(String::from)
        .collect();
    let batch = hx
        .service
        .generate_batch(&hx.account, "subject-1", &garments)
        .await
        .unwrap();

    assert_eq!(batch.items.len(), 3);
    assert!(batch.items[0].asset.is_some());
    assert!(batch.items[1].error.is_some());
    assert!(batch.items[1].asset.is_none());
    assert!(batch.items[2].asset.is_some());
    assert_eq!(batch.summary.succeeded, 2);
    assert_eq!(batch.summary.failed, 1);
    assert_eq!(batch.summary.units_charged, 2);
}

#[tokio::test]
async fn test_combined_outfit_charges_one_unit() {
    let hx = harness(CoreConfig::default());
    hx.service.install(hx.account.clone()).unwrap();

    let garments: Vec<String> = ["jacket", "dress"].into_iter().map(String::from).collect();
    let combined = hx
        .service
        .generate_combined(&hx.account, "subject-1", &garments)
        .await
        .unwrap();
    assert_eq!(combined.units_charged, 1);
    assert_eq!(hx.synthesizer.invocations(), 1);
    assert_eq!(hx.service.balance(&hx.account).unwrap().breakdown.trial_units, 2);
}

#[tokio::test]
async fn test_subscription_lifecycle_through_service() {
    let hx = harness(CoreConfig::default());
    hx.service.install(hx.account.clone()).unwrap();

    // Activation upstream, then reconcile.
    hx.subscriptions
        .set(hx.account.clone(), active_snapshot("starter", 100));
    let synced = hx.service.sync(&hx.account).await.unwrap();
    assert_eq!(synced.action, SyncAction::Initialized);
    assert_eq!(hx.service.balance(&hx.account).unwrap().breakdown.plan_units, 100);

    // Reconciling again is a no-op.
    assert_eq!(
        hx.service.sync(&hx.account).await.unwrap().action,
        SyncAction::NoAction
    );

    // Cancellation upstream zeroes plan units but leaves the trial alone.
    hx.subscriptions.clear(&hx.account);
    assert_eq!(
        hx.service.sync(&hx.account).await.unwrap().action,
        SyncAction::Cancelled
    );
    let breakdown = hx.service.balance(&hx.account).unwrap().breakdown;
    assert_eq!(breakdown.plan_units, 0);
    assert_eq!(breakdown.trial_units, 3);
}

#[tokio::test]
async fn test_responses_round_trip_through_json() {
    let hx = harness(CoreConfig::default().with_trial_units(6));
    hx.service.install(hx.account.clone()).unwrap();
    hx.synthesizer.fail_for("cursed");

    let garments: Vec<String> = ["jacket", "cursed"].into_iter().map(String::from).collect();
    let batch = hx
        .service
        .generate_batch(&hx.account, "subject-1", &garments)
        .await
        .unwrap();

    // The API edge ships these as JSON; errors and assets must survive the
    // trip intact.
    let json = serde_json::to_string(&batch).unwrap();
    let parsed: BatchResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.request_id, batch.request_id);
    assert_eq!(parsed.summary, batch.summary);
    assert_eq!(parsed.items.len(), 2);
    assert_eq!(parsed.items[0].asset, batch.items[0].asset);
    assert!(parsed.items[1].error.is_some());

    // Sync actions use the wire casing the storefront expects.
    assert_eq!(
        serde_json::to_value(SyncAction::PlanChanged).unwrap(),
        serde_json::json!("planChanged")
    );

    // A snapshot without a reported currency omits the field and comes
    // back as `None`.
    let snapshot = SubscriptionSnapshot {
        currency: None,
        ..active_snapshot("starter", 100)
    };
    let wire = serde_json::to_value(&snapshot).unwrap();
    assert!(wire.get("currency").is_none());
    let back: SubscriptionSnapshot = serde_json::from_value(wire).unwrap();
    assert_eq!(back, snapshot);
}

#[tokio::test]
async fn test_unknown_account_is_a_request_error() {
    let hx = harness(CoreConfig::default());
    let ghost = AccountId::from("never-installed");

    let err = hx
        .service
        .generate(&ghost, "subject-1", "jacket")
        .await
        .unwrap_err();
    assert!(matches!(err.error, Error::AccountNotFound(_)));
    assert!(err.error.is_user_facing());
}
