//! Unified optimization pipeline
//!
//! Per account: pull safe-window data, fit market curves, run every
//! proposal source, coordinate per target, then either apply directly
//! or stage the coordinated bids as a reviewable batch. Group-level
//! entry points compute optimal bids across a performance group and
//! reallocate budget toward its efficient campaigns.

use crate::batch::{BatchOperation, BatchSourceType, BatchStatus, ItemPayload, OperationType};
use crate::coordinator::{BidCoordinator, CoordinationInput};
use crate::data_plane::{AlgorithmKind, DataPlane};
use crate::decision_tree::{
    DecisionTreeConfig, DecisionTreeModel, KeywordFeatures, KeywordType, PredictionKind,
    TrainingSample,
};
use crate::errors::{OpError, OpResult};
use crate::market_curve::{BidSample, CurveFitter};
use crate::models::{round_to_cents, AlgorithmParams, Campaign, MatchType, Target, TargetType};
use crate::proposals::{
    default_sources, BidProposal, HourlyPerformance, InventoryStatus, OrganicRankStatus,
    ProposalContext, ProposalSource,
};
use crate::store::history::{HistoryStore, KpiBaseline};
use crate::store::{BatchStore, EntityStore, ModelRegistry};
use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const CURVE_WINDOW_DAYS: i64 = 30;
/// Largest budget share moved between two campaigns in one pass.
const MAX_BUDGET_SHIFT_PCT: f64 = 20.0;

/// Signals owned by external collaborators (stock levels, organic rank,
/// hourly telemetry). The default implementation supplies none.
pub trait SignalProvider: Send + Sync {
    fn inventory(&self, _target: &Target) -> Option<InventoryStatus> {
        None
    }
    fn organic_rank(&self, _target: &Target) -> Option<OrganicRankStatus> {
        None
    }
    fn hourly(&self, _campaign: &Campaign) -> Vec<HourlyPerformance> {
        Vec::new()
    }
}

pub struct NoSignals;
impl SignalProvider for NoSignals {}

#[derive(Debug, Clone, Default)]
pub struct OptimizationOptions {
    pub campaign_ids: Option<Vec<i64>>,
    pub performance_group_ids: Option<Vec<i64>>,
    /// Apply coordinated bids immediately instead of staging a batch.
    pub auto_apply: bool,
    pub owner: String,
    /// Scheduled-task invocation that triggered this run, if any.
    pub source_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub account_id: i64,
    pub campaigns_analyzed: usize,
    pub targets_analyzed: usize,
    pub proposals_generated: usize,
    pub bids_applied: usize,
    pub bids_skipped: usize,
    pub batch_id: Option<String>,
    pub total_expected_profit_delta: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOptimalBid {
    pub target_id: i64,
    pub expression: String,
    pub current_bid: f64,
    pub optimal_bid: f64,
    pub bid_difference_pct: f64,
    pub expected_profit_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignOptimalBids {
    pub campaign_id: i64,
    pub campaign_name: String,
    pub targets: Vec<TargetOptimalBid>,
    pub expected_profit_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOptimalBids {
    pub group_id: i64,
    pub campaigns: Vec<CampaignOptimalBids>,
    pub targets_with_data: usize,
    pub targets_without_data: usize,
    pub total_expected_profit_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupApplyResult {
    pub applied_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub total_expected_profit_increase: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetShift {
    pub from_campaign_id: i64,
    pub to_campaign_id: i64,
    pub amount: f64,
}

pub struct Optimizer {
    data_plane: Arc<DataPlane>,
    entities: EntityStore,
    batches: BatchStore,
    history: HistoryStore,
    models: ModelRegistry,
    coordinator: Arc<BidCoordinator>,
    sources: Vec<Box<dyn ProposalSource>>,
    signals: Arc<dyn SignalProvider>,
    fitter: CurveFitter,
    tree_config: DecisionTreeConfig,
    params: AlgorithmParams,
}

impl Optimizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_plane: Arc<DataPlane>,
        entities: EntityStore,
        batches: BatchStore,
        history: HistoryStore,
        models: ModelRegistry,
        coordinator: Arc<BidCoordinator>,
        signals: Arc<dyn SignalProvider>,
        params: AlgorithmParams,
    ) -> Self {
        Self {
            data_plane,
            entities,
            batches,
            history,
            models,
            coordinator,
            sources: default_sources(),
            signals,
            fitter: CurveFitter::new(&params),
            tree_config: DecisionTreeConfig::default(),
            params,
        }
    }

    fn guard_account(&self, account_id: i64) -> OpResult<()> {
        let account = self
            .entities
            .get_account(account_id)?
            .ok_or_else(|| OpError::NotFound(format!("account {}", account_id)))?;
        if account.needs_reauth {
            return Err(OpError::AuthExpired(account_id));
        }
        Ok(())
    }

    fn selected_campaigns(
        &self,
        account_id: i64,
        options: &OptimizationOptions,
    ) -> Result<Vec<Campaign>> {
        let mut campaigns = self.entities.list_enabled_campaigns(account_id)?;
        if let Some(ids) = &options.campaign_ids {
            campaigns.retain(|c| ids.contains(&c.id));
        }
        if let Some(group_ids) = &options.performance_group_ids {
            campaigns.retain(|c| {
                c.performance_group_id
                    .map(|g| group_ids.contains(&g))
                    .unwrap_or(false)
            });
        }
        Ok(campaigns)
    }

    /// Reconstruct per-day bid samples by replaying the adjustment
    /// history over the safe-window rows.
    fn bid_samples(&self, target: &Target, now: DateTime<Utc>) -> Result<Vec<BidSample>> {
        let data = self.data_plane.target_data_for_algorithm(
            target.account_id,
            target.id,
            AlgorithmKind::Bid,
            CURVE_WINDOW_DAYS,
            now,
        )?;
        let mut records = self.history.query(
            &crate::store::history::HistoryFilter {
                target_id: Some(target.id),
                include_rolled_back: true,
                ..Default::default()
            },
            0,
            500,
        )?;
        records.sort_by_key(|r| r.applied_at);

        let samples = data
            .rows
            .iter()
            .map(|row| {
                let bid_on_day = records
                    .iter()
                    .rev()
                    .find(|r| r.applied_at.date_naive() <= row.date)
                    .map(|r| r.new_bid)
                    .or_else(|| records.first().map(|r| r.previous_bid))
                    .unwrap_or(target.bid);
                BidSample {
                    bid: bid_on_day,
                    impressions: row.impressions as f64,
                    clicks: row.clicks as f64,
                    spend: row.spend,
                    sales: row.sales,
                    orders: row.orders as f64,
                }
            })
            .collect();
        Ok(samples)
    }

    fn baseline_from_samples(samples: &[BidSample]) -> KpiBaseline {
        KpiBaseline {
            window_days: CURVE_WINDOW_DAYS,
            impressions: samples.iter().map(|s| s.impressions).sum::<f64>() as u64,
            clicks: samples.iter().map(|s| s.clicks).sum::<f64>() as u64,
            spend: samples.iter().map(|s| s.spend).sum(),
            sales: samples.iter().map(|s| s.sales).sum(),
            orders: samples.iter().map(|s| s.orders).sum::<f64>() as u64,
        }
    }

    fn keyword_features(target: &Target) -> KeywordFeatures {
        KeywordFeatures {
            match_type: target.match_type.unwrap_or(MatchType::Broad),
            word_count: target.expression.split_whitespace().count() as u32,
            keyword_type: classify_keyword(&target.expression),
            avg_bid: target.bid,
        }
    }

    /// Train the account's CVR tree over keyword targets with enough
    /// clicks in the safe window. Targets without a fitted curve fall
    /// back to its predictions.
    fn train_cvr_tree(
        &self,
        account_id: i64,
        campaigns: &[Campaign],
        now: DateTime<Utc>,
    ) -> Result<Option<DecisionTreeModel>> {
        let mut samples = Vec::new();
        for campaign in campaigns {
            for target in self.entities.list_targets(campaign.id)? {
                if target.target_type != TargetType::Keyword {
                    continue;
                }
                let data = self.data_plane.target_data_for_algorithm(
                    account_id,
                    target.id,
                    AlgorithmKind::Bid,
                    CURVE_WINDOW_DAYS,
                    now,
                )?;
                let clicks: u64 = data.rows.iter().map(|r| r.clicks).sum();
                let orders: u64 = data.rows.iter().map(|r| r.orders).sum();
                if clicks < 10 {
                    continue;
                }
                samples.push(TrainingSample {
                    features: Self::keyword_features(&target),
                    value: orders as f64 / clicks as f64,
                });
            }
        }
        if samples.is_empty() {
            return Ok(None);
        }
        let model =
            DecisionTreeModel::train(PredictionKind::CrPrediction, &samples, self.tree_config);
        self.models.save_tree_model(account_id, &model)?;
        Ok(Some(model))
    }

    /// Full pipeline for one account.
    pub fn run_unified_optimization(
        &self,
        account_id: i64,
        options: &OptimizationOptions,
    ) -> OpResult<AnalysisSummary> {
        self.guard_account(account_id)?;
        let now = Utc::now();
        let campaigns = self.selected_campaigns(account_id, options)?;
        let tree = self.train_cvr_tree(account_id, &campaigns, now)?;

        let mut summary = AnalysisSummary {
            account_id,
            campaigns_analyzed: campaigns.len(),
            targets_analyzed: 0,
            proposals_generated: 0,
            bids_applied: 0,
            bids_skipped: 0,
            batch_id: None,
            total_expected_profit_delta: 0.0,
            warnings: Vec::new(),
        };
        let mut staged_items: Vec<ItemPayload> = Vec::new();

        for campaign in &campaigns {
            let targets = self.entities.list_targets(campaign.id)?;
            let hourly = self.signals.hourly(campaign);

            // CPU-bound per-target fitting runs in parallel; everything
            // that writes stays on this thread.
            let fitted: Vec<_> = targets
                .par_iter()
                .filter(|t| t.status == crate::models::EntityStatus::Enabled)
                .map(|target| {
                    let samples = self.bid_samples(target, now)?;
                    let curve = self.fitter.fit(&samples, CURVE_WINDOW_DAYS);
                    let optimal = curve.as_ref().map(|m| self.fitter.optimal_bid(m));
                    Ok::<_, anyhow::Error>((target.clone(), samples, curve, optimal))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for (target, samples, curve, optimal) in fitted {
                summary.targets_analyzed += 1;
                if let Some(model) = &curve {
                    self.models.save_curve_model(
                        account_id,
                        target.id,
                        target.target_type,
                        model,
                    )?;
                }
                let data = self.data_plane.target_data_for_algorithm(
                    account_id,
                    target.id,
                    AlgorithmKind::Bid,
                    CURVE_WINDOW_DAYS,
                    now,
                )?;
                let cvr_prediction = match (&curve, &tree, target.target_type) {
                    (None, Some(model), TargetType::Keyword) => {
                        Some(model.predict(&Self::keyword_features(&target)))
                    }
                    _ => None,
                };
                let ctx = ProposalContext {
                    target: &target,
                    campaign,
                    rows: &data.rows,
                    hourly: &hourly,
                    curve: curve.as_ref(),
                    optimal: optimal.as_ref(),
                    cvr_prediction,
                    inventory: self.signals.inventory(&target),
                    organic: self.signals.organic_rank(&target),
                    current_hour: now.hour(),
                    params: &self.params,
                };

                let proposals: Vec<BidProposal> = self
                    .sources
                    .iter()
                    .flat_map(|s| s.analyze(&ctx))
                    .filter(|p| p.confidence >= self.params.min_confidence_threshold
                        || p.source == crate::proposals::ProposalKind::Inventory)
                    .collect();
                if proposals.is_empty() {
                    summary.bids_skipped += 1;
                    continue;
                }
                summary.proposals_generated += proposals.len();

                let expected_delta = optimal.as_ref().map(|o| o.max_profit);
                let input = CoordinationInput {
                    campaign,
                    target: &target,
                    proposals,
                    current_base_bid: target.bid,
                    current_placement_pct: campaign.max_placement_pct(),
                    current_dayparting_multiplier: self
                        .entities
                        .current_dayparting_multiplier(campaign.id, now)?,
                };

                if options.auto_apply {
                    let baseline = Self::baseline_from_samples(&samples);
                    let outcome = self.coordinator.apply(
                        &input,
                        Some(baseline),
                        expected_delta,
                        &options.owner,
                    )?;
                    summary.warnings.extend(outcome.result.warnings.clone());
                    if outcome.applied {
                        summary.bids_applied += 1;
                        summary.total_expected_profit_delta += expected_delta.unwrap_or(0.0);
                    } else {
                        summary.bids_skipped += 1;
                    }
                } else {
                    let result = self.coordinator.coordinate(&input);
                    summary.warnings.extend(result.warnings.clone());
                    if (result.final_bid - result.original_bid).abs() < 0.005 {
                        summary.bids_skipped += 1;
                        continue;
                    }
                    let coordination_id = self.history.log_coordination(
                        account_id,
                        campaign.id,
                        target.id,
                        result.original_bid,
                        result.final_bid,
                        result.theoretical_max_cpc,
                        result.effective_multiplier,
                        result.circuit_breaker_tripped,
                        &result.reason,
                        &serde_json::to_string(&result.warnings).unwrap_or_default(),
                        &serde_json::to_string(&result.proposals).unwrap_or_default(),
                    )?;
                    summary.total_expected_profit_delta += expected_delta.unwrap_or(0.0);
                    staged_items.push(ItemPayload::BidAdjustment {
                        target_id: target.id,
                        target_type: target.target_type,
                        new_bid: result.final_bid,
                        coordination_id: Some(coordination_id),
                        expected_profit_delta: expected_delta,
                    });
                }
            }
        }

        if !staged_items.is_empty() {
            let batch_id = Uuid::new_v4().to_string();
            let batch = BatchOperation {
                id: batch_id.clone(),
                account_id: Some(account_id),
                owner: options.owner.clone(),
                operation_type: OperationType::BidAdjustment,
                name: format!("unified optimization {}", now.format("%Y-%m-%d %H:%M")),
                description: format!(
                    "{} coordinated bid adjustments across {} campaigns",
                    staged_items.len(),
                    summary.campaigns_analyzed
                ),
                requires_approval: true,
                source_type: if options.source_task_id.is_some() {
                    BatchSourceType::ScheduledTask
                } else {
                    BatchSourceType::Optimization
                },
                source_task_id: options.source_task_id.clone(),
                status: BatchStatus::Pending,
                total_items: staged_items.len() as u32,
                success_items: 0,
                failed_items: 0,
                skipped_items: 0,
                executed_by: None,
                created_at: now,
                approved_at: None,
                executed_at: None,
                finished_at: None,
            };
            self.batches.create(&batch, &staged_items)?;
            summary.batch_id = Some(batch_id);
        }

        info!(
            account_id,
            targets = summary.targets_analyzed,
            applied = summary.bids_applied,
            staged = staged_items.len(),
            "unified optimization finished"
        );
        Ok(summary)
    }

    /// Optimal bids for every target of a performance group, read-only.
    pub fn performance_group_optimal_bids(
        &self,
        group_id: i64,
        account_id: i64,
    ) -> OpResult<GroupOptimalBids> {
        self.guard_account(account_id)?;
        let group = self
            .entities
            .get_group(group_id)?
            .ok_or_else(|| OpError::NotFound(format!("performance group {}", group_id)))?;
        if group.account_id != account_id {
            return Err(OpError::NotFound(format!(
                "performance group {} for account {}",
                group_id, account_id
            )));
        }
        let now = Utc::now();

        let mut campaigns_out = Vec::new();
        let mut with_data = 0;
        let mut without_data = 0;
        let mut total_delta = 0.0;

        for campaign in self.entities.list_group_campaigns(group_id)? {
            let mut targets_out = Vec::new();
            let mut campaign_delta = 0.0;
            for target in self.entities.list_targets(campaign.id)? {
                let samples = self.bid_samples(&target, now)?;
                let model = match self.fitter.fit(&samples, CURVE_WINDOW_DAYS) {
                    Some(m) => {
                        with_data += 1;
                        m
                    }
                    None => {
                        without_data += 1;
                        continue;
                    }
                };
                let optimal = self.fitter.optimal_bid(&model);
                let diff_pct = if target.bid > 0.0 {
                    (optimal.optimal_bid - target.bid).abs() / target.bid * 100.0
                } else {
                    100.0
                };
                campaign_delta += optimal.max_profit;
                targets_out.push(TargetOptimalBid {
                    target_id: target.id,
                    expression: target.expression.clone(),
                    current_bid: target.bid,
                    optimal_bid: optimal.optimal_bid,
                    bid_difference_pct: diff_pct,
                    expected_profit_delta: optimal.max_profit,
                });
            }
            total_delta += campaign_delta;
            campaigns_out.push(CampaignOptimalBids {
                campaign_id: campaign.id,
                campaign_name: campaign.name.clone(),
                targets: targets_out,
                expected_profit_delta: campaign_delta,
            });
        }

        Ok(GroupOptimalBids {
            group_id,
            campaigns: campaigns_out,
            targets_with_data: with_data,
            targets_without_data: without_data,
            total_expected_profit_delta: total_delta,
        })
    }

    /// Apply group optimal bids through the coordinator, skipping
    /// differences below `min_bid_difference_pct`.
    pub fn apply_group_optimal_bids(
        &self,
        group_id: i64,
        account_id: i64,
        min_bid_difference_pct: f64,
        applied_by: &str,
    ) -> OpResult<GroupApplyResult> {
        let optimal = self.performance_group_optimal_bids(group_id, account_id)?;
        let now = Utc::now();
        let mut result = GroupApplyResult {
            applied_count: 0,
            skipped_count: 0,
            error_count: 0,
            total_expected_profit_increase: 0.0,
        };

        for campaign_bids in &optimal.campaigns {
            let campaign = match self.entities.get_campaign(campaign_bids.campaign_id)? {
                Some(c) => c,
                None => continue,
            };
            for t in &campaign_bids.targets {
                if t.bid_difference_pct < min_bid_difference_pct {
                    result.skipped_count += 1;
                    continue;
                }
                let target = match self.entities.get_target(t.target_id)? {
                    Some(t) => t,
                    None => {
                        result.error_count += 1;
                        continue;
                    }
                };
                let input = CoordinationInput {
                    campaign: &campaign,
                    target: &target,
                    proposals: vec![BidProposal::absolute(
                        &target,
                        crate::proposals::ProposalKind::BaseAlgo,
                        t.optimal_bid,
                        0.9,
                        "group optimal bid",
                    )],
                    current_base_bid: target.bid,
                    current_placement_pct: campaign.max_placement_pct(),
                    current_dayparting_multiplier: self
                        .entities
                        .current_dayparting_multiplier(campaign.id, now)?,
                };
                match self.coordinator.apply(
                    &input,
                    None,
                    Some(t.expected_profit_delta),
                    applied_by,
                ) {
                    Ok(outcome) if outcome.applied => {
                        result.applied_count += 1;
                        result.total_expected_profit_increase += t.expected_profit_delta;
                    }
                    Ok(_) => result.skipped_count += 1,
                    Err(e) => {
                        warn!(target_id = t.target_id, error = %e, "group bid apply failed");
                        result.error_count += 1;
                    }
                }
            }
        }
        result.total_expected_profit_increase =
            round_to_cents(result.total_expected_profit_increase);
        Ok(result)
    }

    /// Shift budget inside a group from its least efficient enabled
    /// campaign toward its most efficient one, bounded per pass.
    pub fn reallocate_group_budgets(
        &self,
        group_id: i64,
        account_id: i64,
    ) -> OpResult<Vec<BudgetShift>> {
        self.guard_account(account_id)?;
        let now = Utc::now();
        let campaigns = self.entities.list_group_campaigns(group_id)?;
        if campaigns.len() < 2 {
            return Ok(Vec::new());
        }

        // Profit per spend dollar over the safe window, per campaign.
        let exclude = self.data_plane.exclude_days(AlgorithmKind::Bid);
        let end = now.date_naive() - chrono::Duration::days(exclude);
        let start = end - chrono::Duration::days(CURVE_WINDOW_DAYS);
        let mut scored: Vec<(Campaign, f64)> = Vec::new();
        for campaign in campaigns {
            if campaign.status != crate::models::EntityStatus::Enabled {
                continue;
            }
            let totals = self.data_plane.snapshots().totals(
                account_id,
                Some(campaign.id),
                start,
                end,
                crate::models::SnapshotSource::Report,
            )?;
            if totals.spend <= 0.0 {
                continue;
            }
            let profit_per_dollar =
                (totals.sales * self.params.margin() - totals.spend) / totals.spend;
            scored.push((campaign, profit_per_dollar));
        }
        if scored.len() < 2 {
            return Ok(Vec::new());
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let (worst, worst_score) = scored[0].clone();
        let (best, best_score) = scored[scored.len() - 1].clone();
        if best_score - worst_score < 0.1 {
            return Ok(Vec::new());
        }

        let amount = round_to_cents(worst.daily_budget * MAX_BUDGET_SHIFT_PCT / 100.0);
        if amount <= 0.0 {
            return Ok(Vec::new());
        }
        self.entities
            .set_campaign_budget(worst.id, worst.daily_budget - amount)?;
        self.entities
            .set_campaign_budget(best.id, best.daily_budget + amount)?;
        info!(
            group_id,
            from = worst.id,
            to = best.id,
            amount,
            "group budget reallocated"
        );
        Ok(vec![BudgetShift {
            from_campaign_id: worst.id,
            to_campaign_id: best.id,
            amount,
        }])
    }
}

/// ASIN-shaped expressions are product targets surfaced as keywords;
/// everything else defaults to generic. Brand and competitor term lists
/// are owned by an external catalog service.
fn classify_keyword(expression: &str) -> KeywordType {
    let e = expression.trim().to_lowercase();
    if e.len() == 10 && e.starts_with("b0") && !e.contains(' ') {
        KeywordType::Product
    } else {
        KeywordType::Generic
    }
}
