//! Typed service surface
//!
//! Every externally visible operation lives here as a method returning
//! `Result<_, OpError>`. Internal errors are mapped to the taxonomy at
//! this boundary; nothing below it leaks stack traces or raw database
//! errors to callers.

use crate::ads_api::AdsApi;
use crate::batch::executor::ExecutionSummary;
use crate::batch::{
    validate_items, BatchExecutor, BatchItem, BatchOperation, BatchSourceType, BatchStatus,
    ItemPayload, OperationType,
};
use crate::coordinator::BidCoordinator;
use crate::data_plane::{ConsistencyChecker, ConsistencyReport, DataPlane, DualTrackStatus};
use crate::effect::rollback::EvaluationSummary;
use crate::effect::{EffectTracker, RollbackEngine, TrackingRunSummary, TrackingStatsSummary};
use crate::errors::{OpError, OpResult};
use crate::models::{AlgorithmParams, Config, MatchType};
use crate::optimization::{
    AnalysisSummary, GroupApplyResult, GroupOptimalBids, OptimizationOptions, Optimizer,
    SignalProvider,
};
use crate::pacing::{PacingCheck, PacingController};
use crate::scheduler::{CancellationToken, RateLimiter, Scheduler, TaskRunner};
use crate::store::batches::BatchFilter;
use crate::store::history::{BidAdjustmentRecord, HistoryFilter, HistoryStore};
use crate::store::rules::{RollbackRule, RollbackSuggestion, RuleSpec, SuggestionStatus};
use crate::store::tasks::{ScheduledTask, TaskParameters};
use crate::store::{
    BatchStore, Database, EntityStore, ModelRegistry, RuleStore, SnapshotStore, TaskStore,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const TRACKING_HORIZONS: [i64; 3] = [7, 14, 30];

/// Application wiring: construction order follows the dependency graph,
/// lifecycle is owned by the binary. No global state.
pub struct App {
    pub config: Config,
    pub entities: EntityStore,
    pub history: HistoryStore,
    pub batches: BatchStore,
    pub rules: RuleStore,
    pub tasks: TaskStore,
    pub data_plane: Arc<DataPlane>,
    pub coordinator: Arc<BidCoordinator>,
    pub optimizer: Arc<Optimizer>,
    pub pacing: Arc<PacingController>,
    pub tracker: Arc<EffectTracker>,
    pub rollback: Arc<RollbackEngine>,
    pub executor: Arc<BatchExecutor>,
    pub consistency: Arc<ConsistencyChecker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub api: Arc<dyn AdsApi>,
}

impl App {
    pub fn build(
        config: Config,
        api: Arc<dyn AdsApi>,
        signals: Arc<dyn SignalProvider>,
    ) -> Result<Self> {
        let db = Database::open(&config.database_path)?;
        Ok(Self::build_with_db(config, db, api, signals))
    }

    pub fn build_with_db(
        config: Config,
        db: Database,
        api: Arc<dyn AdsApi>,
        signals: Arc<dyn SignalProvider>,
    ) -> Self {
        let params = config.params.clone();
        let entities = EntityStore::new(db.clone());
        let snapshots = SnapshotStore::new(db.clone());
        let history = HistoryStore::new(db.clone());
        let batches = BatchStore::new(db.clone());
        let rules = RuleStore::new(db.clone());
        let models = ModelRegistry::new(db.clone());
        let tasks = TaskStore::new(db);

        let data_plane = Arc::new(DataPlane::new(snapshots.clone(), params.clone()));
        let coordinator = Arc::new(BidCoordinator::new(
            params.clone(),
            entities.clone(),
            history.clone(),
        ));
        let optimizer = Arc::new(Optimizer::new(
            data_plane.clone(),
            entities.clone(),
            batches.clone(),
            history.clone(),
            models,
            coordinator.clone(),
            signals,
            params.clone(),
        ));
        let pacing = Arc::new(PacingController::new(
            data_plane.clone(),
            entities.clone(),
            params.clone(),
        ));
        let tracker = Arc::new(EffectTracker::new(
            history.clone(),
            snapshots.clone(),
            params.clone(),
        ));
        let rollback = Arc::new(RollbackEngine::new(
            history.clone(),
            rules.clone(),
            batches.clone(),
            params.clone(),
        ));
        let executor = Arc::new(BatchExecutor::new(
            batches.clone(),
            entities.clone(),
            history.clone(),
            api.clone(),
            params.clone(),
        ));
        let consistency = Arc::new(ConsistencyChecker::new(
            snapshots,
            params.backfill_threshold_hours,
        ));

        Self {
            config,
            entities,
            history,
            batches,
            rules,
            tasks,
            data_plane,
            coordinator,
            optimizer,
            pacing,
            tracker,
            rollback,
            executor,
            consistency,
            rate_limiter: Arc::new(RateLimiter::new(10, 2.0)),
            api,
        }
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.config.params
    }

    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        Scheduler::new(
            self.tasks.clone(),
            Arc::new(PipelineRunner { app: self.clone() }),
            self.config.worker_count,
        )
    }

    // =========================================================================
    // Optimization
    // =========================================================================

    pub fn run_unified_optimization(
        &self,
        account_id: i64,
        options: &OptimizationOptions,
    ) -> OpResult<AnalysisSummary> {
        self.optimizer.run_unified_optimization(account_id, options)
    }

    pub fn get_performance_group_optimal_bids(
        &self,
        group_id: i64,
        account_id: i64,
    ) -> OpResult<GroupOptimalBids> {
        self.optimizer
            .performance_group_optimal_bids(group_id, account_id)
    }

    pub fn apply_group_optimal_bids(
        &self,
        group_id: i64,
        account_id: i64,
        min_bid_difference_pct: Option<f64>,
        applied_by: &str,
    ) -> OpResult<GroupApplyResult> {
        self.optimizer.apply_group_optimal_bids(
            group_id,
            account_id,
            min_bid_difference_pct.unwrap_or(5.0),
            applied_by,
        )
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn create_batch(
        &self,
        account_id: i64,
        owner: &str,
        name: &str,
        operation_type: OperationType,
        requires_approval: bool,
        items: Vec<ItemPayload>,
    ) -> OpResult<String> {
        let violations = validate_items(self.params(), &self.entities, &items)?;
        if !violations.is_empty() {
            return Err(OpError::Validation(violations.join("; ")));
        }

        let now = Utc::now();
        let batch_id = Uuid::new_v4().to_string();
        let status = if requires_approval {
            BatchStatus::Pending
        } else {
            BatchStatus::Approved
        };
        let batch = BatchOperation {
            id: batch_id.clone(),
            account_id: Some(account_id),
            owner: owner.to_string(),
            operation_type,
            name: name.to_string(),
            description: String::new(),
            requires_approval,
            source_type: BatchSourceType::Manual,
            source_task_id: None,
            status,
            total_items: items.len() as u32,
            success_items: 0,
            failed_items: 0,
            skipped_items: 0,
            executed_by: None,
            created_at: now,
            approved_at: (!requires_approval).then_some(now),
            executed_at: None,
            finished_at: None,
        };
        self.batches.create(&batch, &items)?;
        info!(batch_id = %batch_id, items = items.len(), "batch created");
        Ok(batch_id)
    }

    pub fn create_bid_adjustment_batch(
        &self,
        account_id: i64,
        owner: &str,
        name: &str,
        requires_approval: bool,
        adjustments: Vec<(i64, f64)>,
    ) -> OpResult<String> {
        let items = adjustments
            .into_iter()
            .map(|(target_id, new_bid)| {
                let target_type = self
                    .entities
                    .get_target(target_id)
                    .ok()
                    .flatten()
                    .map(|t| t.target_type)
                    .unwrap_or(crate::models::TargetType::Keyword);
                ItemPayload::BidAdjustment {
                    target_id,
                    target_type,
                    new_bid,
                    coordination_id: None,
                    expected_profit_delta: None,
                }
            })
            .collect();
        self.create_batch(
            account_id,
            owner,
            name,
            OperationType::BidAdjustment,
            requires_approval,
            items,
        )
    }

    pub fn create_negative_keyword_batch(
        &self,
        account_id: i64,
        owner: &str,
        name: &str,
        requires_approval: bool,
        negatives: Vec<(i64, Option<i64>, String, MatchType)>,
    ) -> OpResult<String> {
        let items = negatives
            .into_iter()
            .map(
                |(campaign_id, ad_group_id, keyword, match_type)| ItemPayload::NegativeKeyword {
                    campaign_id,
                    ad_group_id,
                    keyword,
                    match_type,
                },
            )
            .collect();
        self.create_batch(
            account_id,
            owner,
            name,
            OperationType::NegativeKeyword,
            requires_approval,
            items,
        )
    }

    pub fn approve_batch(&self, batch_id: &str) -> OpResult<()> {
        self.executor.approve(batch_id)
    }

    pub fn cancel_batch(&self, batch_id: &str) -> OpResult<()> {
        self.executor.cancel(batch_id)
    }

    pub async fn execute_batch(
        &self,
        batch_id: &str,
        cancellation: &CancellationToken,
        executed_by: &str,
    ) -> OpResult<ExecutionSummary> {
        self.executor.execute(batch_id, cancellation, executed_by).await
    }

    pub async fn rollback_batch(
        &self,
        batch_id: &str,
        executed_by: &str,
    ) -> OpResult<ExecutionSummary> {
        self.executor.rollback(batch_id, executed_by).await
    }

    pub fn list_batches(
        &self,
        filter: &BatchFilter,
        limit: u32,
    ) -> OpResult<Vec<BatchOperation>> {
        Ok(self.batches.list(filter, limit)?)
    }

    /// Rough wall-clock estimate for executing a batch of this shape,
    /// surfaced for progress display.
    pub fn estimate_batch_execution_time(
        &self,
        operation_type: OperationType,
        item_count: usize,
    ) -> std::time::Duration {
        crate::batch::estimate_execution_time(operation_type, item_count)
    }

    /// Batch with its items, the detailed review record.
    pub fn get_batch_detail(
        &self,
        batch_id: &str,
    ) -> OpResult<(BatchOperation, Vec<BatchItem>)> {
        let batch = self
            .batches
            .get(batch_id)?
            .ok_or_else(|| OpError::NotFound(format!("batch {}", batch_id)))?;
        let items = self.batches.items(batch_id)?;
        Ok((batch, items))
    }

    // =========================================================================
    // Effect tracking & rollback
    // =========================================================================

    pub fn get_bid_adjustment_history(
        &self,
        filter: &HistoryFilter,
        page: u32,
        page_size: u32,
    ) -> OpResult<Vec<BidAdjustmentRecord>> {
        Ok(self.history.query(filter, page, page_size)?)
    }

    pub fn run_effect_tracking_task(&self, period_days: i64) -> OpResult<TrackingRunSummary> {
        if !TRACKING_HORIZONS.contains(&period_days) {
            return Err(OpError::Validation(format!(
                "tracking period must be one of {:?}, got {}",
                TRACKING_HORIZONS, period_days
            )));
        }
        Ok(self.tracker.run_tracking_task(period_days)?)
    }

    pub fn get_tracking_stats_summary(&self) -> OpResult<TrackingStatsSummary> {
        Ok(self.tracker.stats_summary()?)
    }

    pub fn get_rules(&self) -> OpResult<Vec<RollbackRule>> {
        Ok(self.rules.list_rules(false)?)
    }

    pub fn create_rule(&self, spec: &RuleSpec) -> OpResult<i64> {
        validate_rule(spec)?;
        Ok(self.rules.create_rule(spec)?)
    }

    pub fn update_rule(&self, rule_id: i64, spec: &RuleSpec) -> OpResult<()> {
        validate_rule(spec)?;
        if !self.rules.update_rule(rule_id, spec)? {
            return Err(OpError::NotFound(format!("rule {}", rule_id)));
        }
        Ok(())
    }

    pub fn run_rollback_evaluation(
        &self,
        account_id: Option<i64>,
    ) -> OpResult<EvaluationSummary> {
        Ok(self.rollback.evaluate(account_id)?)
    }

    pub fn list_suggestions(
        &self,
        status: Option<SuggestionStatus>,
        limit: u32,
    ) -> OpResult<Vec<RollbackSuggestion>> {
        Ok(self.rules.list_suggestions(status, limit)?)
    }

    pub fn review_suggestion(&self, suggestion_id: &str, approve: bool) -> OpResult<()> {
        self.rollback.review(suggestion_id, approve)
    }

    pub async fn execute_suggestion(
        &self,
        suggestion_id: &str,
        executed_by: &str,
    ) -> OpResult<String> {
        self.rollback
            .execute_suggestion(suggestion_id, &self.executor, executed_by)
            .await
    }

    // =========================================================================
    // Intraday / data plane
    // =========================================================================

    pub fn check_all_campaigns_pacing(&self, account_id: i64) -> OpResult<Vec<PacingCheck>> {
        Ok(self.pacing.check_all_campaigns(account_id)?)
    }

    pub fn get_critical_campaigns(&self, account_id: i64) -> OpResult<Vec<PacingCheck>> {
        Ok(self.pacing.critical_campaigns(account_id)?)
    }

    pub fn get_dual_track_status(&self, account_id: i64) -> OpResult<DualTrackStatus> {
        Ok(self.data_plane.dual_track_status(account_id)?)
    }

    pub fn run_consistency_check(
        &self,
        account_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> OpResult<ConsistencyReport> {
        if start > end {
            return Err(OpError::Validation(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(self.consistency.check(account_id, start, end)?)
    }

    /// Backfill repair: re-fetch report rows for the dates the stream
    /// track covered but the report track never confirmed.
    pub async fn run_backfill_repair(&self, account_id: i64) -> OpResult<usize> {
        let plan = self.consistency.repair_plan(account_id)?;
        if plan.is_empty() {
            return Ok(0);
        }
        let dates = plan.dates();
        let (start, end) = (dates[0], dates[dates.len() - 1]);
        self.rate_limiter
            .acquire(account_id, crate::scheduler::ApiFamily::Reports)
            .await;
        let rows = self
            .api
            .fetch_report_rows(account_id, start, end)
            .await
            .map_err(|e| match e {
                crate::ads_api::ApiError::AuthExpired => {
                    let _ = self.entities.mark_needs_reauth(account_id);
                    OpError::AuthExpired(account_id)
                }
                other => OpError::ExternalFailure(other.to_string()),
            })?;
        let fetched = rows.len();
        if fetched > 0 {
            self.data_plane.ingest_report(account_id, &rows)?;
        }
        info!(account_id, fetched, "backfill repair ingested report rows");
        Ok(fetched)
    }
}

fn validate_rule(spec: &RuleSpec) -> OpResult<()> {
    if !TRACKING_HORIZONS.contains(&spec.min_tracking_days) {
        return Err(OpError::Validation(format!(
            "min_tracking_days must be one of {:?}",
            TRACKING_HORIZONS
        )));
    }
    if spec.profit_threshold_pct <= 0.0 {
        return Err(OpError::Validation(
            "profit_threshold_pct must be positive".to_string(),
        ));
    }
    if spec.min_sample_count < 1 {
        return Err(OpError::Validation(
            "min_sample_count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Glue between the scheduler and the pipelines: one task invocation,
/// one typed parameter variant.
struct PipelineRunner {
    app: Arc<App>,
}

#[async_trait]
impl TaskRunner for PipelineRunner {
    async fn run(
        &self,
        task: &ScheduledTask,
        _cancellation: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let summary = match &task.parameters {
            TaskParameters::UnifiedOptimization {
                account_id,
                campaign_ids,
                performance_group_ids,
            } => {
                let options = OptimizationOptions {
                    campaign_ids: campaign_ids.clone(),
                    performance_group_ids: performance_group_ids.clone(),
                    auto_apply: task.auto_apply && !task.require_approval,
                    owner: "scheduler".to_string(),
                    source_task_id: Some(task.id.to_string()),
                };
                let summary = self.app.run_unified_optimization(*account_id, &options)?;
                serde_json::to_value(summary)?
            }
            TaskParameters::EffectTracking { period_days } => {
                serde_json::to_value(self.app.run_effect_tracking_task(*period_days)?)?
            }
            TaskParameters::RollbackEvaluation { account_id } => {
                serde_json::to_value(self.app.run_rollback_evaluation(*account_id)?)?
            }
            TaskParameters::PacingCheck { account_id } => {
                serde_json::to_value(self.app.check_all_campaigns_pacing(*account_id)?)?
            }
            TaskParameters::ConsistencyCheck {
                account_id,
                lookback_days,
            } => {
                let end = Utc::now().date_naive();
                let start = end - chrono::Duration::days(*lookback_days);
                serde_json::to_value(self.app.run_consistency_check(*account_id, start, end)?)?
            }
        };
        Ok(summary)
    }
}
