//! End-to-end control-plane flows: optimization staging, batch
//! lifecycle, effect tracking and rule-driven rollback, against an
//! in-memory database and the recording platform client.

use bidpilot_backend::ads_api::{RecordedCall, RecordingAdsApi};
use bidpilot_backend::batch::BatchStatus;
use bidpilot_backend::models::{
    Account, AlgorithmParams, Config, EntityKind, SnapshotSource, Target,
};
use bidpilot_backend::optimization::{NoSignals, OptimizationOptions, SignalProvider};
use bidpilot_backend::proposals::InventoryStatus;
use bidpilot_backend::scheduler::CancellationToken;
use bidpilot_backend::service::App;
use bidpilot_backend::store::history::{AdjustmentSource, HistoryFilter};
use bidpilot_backend::store::rules::{RuleSpec, SuggestionStatus};
use bidpilot_backend::store::Database;
use bidpilot_backend::testutil::{sample_campaign, sample_target, snapshot_on};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        pacing_interval_minutes: 15,
        scheduler_tick_seconds: 60,
        effect_tracking_interval_minutes: 60,
        worker_count: 2,
        params: AlgorithmParams::default(),
    }
}

fn build_app(api: Arc<RecordingAdsApi>, signals: Arc<dyn SignalProvider>) -> Arc<App> {
    Arc::new(App::build_with_db(
        test_config(),
        Database::open_in_memory().unwrap(),
        api,
        signals,
    ))
}

/// Stock signal for one specific target.
struct LowStockFor {
    target_id: i64,
}

impl SignalProvider for LowStockFor {
    fn inventory(&self, target: &Target) -> Option<InventoryStatus> {
        (target.id == self.target_id).then_some(InventoryStatus {
            units_available: 30,
            days_of_cover: 2.0,
        })
    }
}

fn seed_entities(app: &App) {
    app.entities
        .upsert_account(&Account {
            id: 1,
            name: "test account".into(),
            needs_reauth: false,
        })
        .unwrap();
    app.entities.upsert_campaign(&sample_campaign(1, 10)).unwrap();
    app.entities.upsert_target(&sample_target(1, 10, 42, 1.0)).unwrap();
    app.entities.upsert_target(&sample_target(1, 10, 43, 1.0)).unwrap();
}

/// Twenty safe-window days of efficient performance for both targets.
fn seed_performance(app: &App) {
    let today = Utc::now().date_naive();
    let mut rows = Vec::new();
    for target_id in [42, 43] {
        for d in 2..22 {
            rows.push(snapshot_on(
                1,
                EntityKind::Target,
                target_id,
                today - Duration::days(d),
                SnapshotSource::Report,
                2000,
                10,
                5.0,
                50.0,
                2,
            ));
        }
    }
    app.data_plane.ingest_report(1, &rows).unwrap();
}

#[test]
fn test_batch_round_trip_restores_pre_batch_bids() {
    let api = Arc::new(RecordingAdsApi::new());
    let app = build_app(api.clone(), Arc::new(NoSignals));
    app.entities.upsert_campaign(&sample_campaign(1, 10)).unwrap();
    app.entities.upsert_target(&sample_target(1, 10, 1, 0.50)).unwrap();
    app.entities.upsert_target(&sample_target(1, 10, 2, 1.00)).unwrap();

    let batch_id = app
        .create_bid_adjustment_batch(1, "ops", "raise two bids", true, vec![(1, 0.80), (2, 1.40)])
        .unwrap();
    assert_eq!(
        app.get_batch_detail(&batch_id).unwrap().0.status,
        BatchStatus::Pending
    );

    app.approve_batch(&batch_id).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let summary = rt
        .block_on(app.execute_batch(&batch_id, &CancellationToken::new(), "ops"))
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.success_items, 2);
    assert_eq!(app.entities.get_target(1).unwrap().unwrap().bid, 0.80);
    assert_eq!(app.entities.get_target(2).unwrap().unwrap().bid, 1.40);

    let rollback = rt.block_on(app.rollback_batch(&batch_id, "ops")).unwrap();
    assert_eq!(rollback.status, BatchStatus::RolledBack);
    assert_eq!(app.entities.get_target(1).unwrap().unwrap().bid, 0.50);
    assert_eq!(app.entities.get_target(2).unwrap().unwrap().bid, 1.00);

    let (batch, items) = app.get_batch_detail(&batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::RolledBack);
    assert_eq!(
        batch.success_items + batch.failed_items + batch.skipped_items,
        batch.total_items
    );
    assert_eq!(items.len(), 2);

    // Platform saw four bid writes: two applies, two restores.
    let bid_calls: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RecordedCall::UpdateBid { .. }))
        .collect();
    assert_eq!(bid_calls.len(), 4);
}

#[test]
fn test_unified_optimization_stages_reviewable_batch() {
    let api = Arc::new(RecordingAdsApi::new());
    let app = build_app(api.clone(), Arc::new(LowStockFor { target_id: 43 }));
    seed_entities(&app);
    seed_performance(&app);

    let summary = app
        .run_unified_optimization(
            1,
            &OptimizationOptions {
                owner: "ops".into(),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(summary.campaigns_analyzed, 1);
    assert_eq!(summary.targets_analyzed, 2);
    assert!(summary.proposals_generated >= 2);
    let batch_id = summary.batch_id.expect("staged batch");

    // Nothing written yet: staging is review-first.
    assert_eq!(app.entities.get_target(42).unwrap().unwrap().bid, 1.0);
    assert!(api.calls().is_empty());

    let (batch, items) = app.get_batch_detail(&batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(items.len() as u32, batch.total_items);

    app.approve_batch(&batch_id).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executed = rt
        .block_on(app.execute_batch(&batch_id, &CancellationToken::new(), "ops"))
        .unwrap();
    assert_eq!(executed.status, BatchStatus::Completed);

    // The low-stock target was cut, the efficient one tilted up.
    let protected = app.entities.get_target(43).unwrap().unwrap().bid;
    let tilted = app.entities.get_target(42).unwrap().unwrap().bid;
    assert!(protected < 1.0, "low stock target got {}", protected);
    assert!(tilted > 1.0, "efficient target got {}", tilted);

    // Applied changes are in the append-only history.
    let history = app
        .get_bid_adjustment_history(
            &HistoryFilter {
                account_id: Some(1),
                ..Default::default()
            },
            0,
            10,
        )
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|r| r.source == AdjustmentSource::BatchCampaign));
}

#[test]
fn test_tracking_and_rule_rollback_close_the_loop() {
    let api = Arc::new(RecordingAdsApi::new());
    let app = build_app(api, Arc::new(NoSignals));
    seed_entities(&app);

    // An applied adjustment that expected +$20.
    let adjustment_id = app
        .history
        .append(&bidpilot_backend::store::history::NewAdjustment {
            account_id: 1,
            target_id: 42,
            target_type: bidpilot_backend::models::TargetType::Keyword,
            previous_bid: 1.0,
            new_bid: 1.3,
            source: AdjustmentSource::Coordinator,
            reason: "optimization".into(),
            expected_profit_delta: Some(20.0),
            applied_by: "scheduler".into(),
            baseline: None,
        })
        .unwrap();
    app.entities.update_bid(42, 1.3).unwrap();

    // Seven post-adjustment days that lose money: sales 14, spend 35.
    let start = Utc::now().date_naive();
    for d in 0..7 {
        app.data_plane
            .snapshots()
            .insert(&snapshot_on(
                1,
                EntityKind::Target,
                42,
                start + Duration::days(d),
                SnapshotSource::Report,
                1000,
                20,
                5.0,
                2.0,
                0,
            ))
            .unwrap();
    }
    let tracking = app
        .tracker
        .run_tracking_task_at(7, Utc::now() + Duration::days(8))
        .unwrap();
    assert_eq!(tracking.updated, 1);
    // 14 − 35 · 1.3 = −31.5
    let effect = app.history.effect(adjustment_id).unwrap().unwrap();
    assert!((effect.actual_profit_7d.unwrap() + 31.5).abs() < 1e-9);

    // Rule: 20% shortfall over 7 days, auto-rollback.
    app.create_rule(&RuleSpec {
        name: "losing adjustments".into(),
        enabled: true,
        profit_threshold_pct: 20.0,
        min_tracking_days: 7,
        min_sample_count: 1,
        include_negative_adjustments: true,
        auto_rollback: true,
        send_notification: true,
        priority: 9,
    })
    .unwrap();

    let evaluation = app.run_rollback_evaluation(Some(1)).unwrap();
    assert_eq!(evaluation.suggestions_created, 1);
    assert_eq!(evaluation.auto_approved, 1);

    let suggestion = app
        .list_suggestions(Some(SuggestionStatus::Approved), 1)
        .unwrap()
        .remove(0);
    assert_eq!(suggestion.priority, 9);
    // (−31.5 − 20) / 20 = −2.575
    assert!((suggestion.drop_pct + 2.575).abs() < 1e-6);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let rollback_batch = rt
        .block_on(app.execute_suggestion(&suggestion.id, "auto"))
        .unwrap();

    assert_eq!(app.entities.get_target(42).unwrap().unwrap().bid, 1.0);
    assert!(app
        .history
        .get(adjustment_id)
        .unwrap()
        .unwrap()
        .is_rolled_back);
    let (batch, _) = app.get_batch_detail(&rollback_batch).unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);

    // The reversal itself is in the history with its own source tag.
    let rollback_rows = app
        .get_bid_adjustment_history(
            &HistoryFilter {
                source: Some(AdjustmentSource::Rollback),
                ..Default::default()
            },
            0,
            10,
        )
        .unwrap();
    assert_eq!(rollback_rows.len(), 1);
    assert_eq!(rollback_rows[0].new_bid, 1.0);
}

#[test]
fn test_auth_expired_halts_only_that_account() {
    let api = Arc::new(RecordingAdsApi::new());
    let app = build_app(api, Arc::new(NoSignals));
    app.entities
        .upsert_account(&Account {
            id: 1,
            name: "expired".into(),
            needs_reauth: true,
        })
        .unwrap();
    app.entities
        .upsert_account(&Account {
            id: 2,
            name: "healthy".into(),
            needs_reauth: false,
        })
        .unwrap();

    let options = OptimizationOptions {
        owner: "ops".into(),
        ..Default::default()
    };
    assert!(matches!(
        app.run_unified_optimization(1, &options),
        Err(bidpilot_backend::OpError::AuthExpired(1))
    ));
    // The healthy account still runs (empty, but not refused).
    assert!(app.run_unified_optimization(2, &options).is_ok());
}
