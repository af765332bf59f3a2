//! Core domain model and runtime configuration
//!
//! Biddable targets, campaigns, performance groups and the performance
//! snapshot rows every algorithm reads. All money is f64 dollars rounded
//! to cents at write boundaries; all timestamps are UTC.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Round a dollar amount to whole cents. Applied at every boundary that
/// persists or emits money.
pub fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

// =============================================================================
// ENTITIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Keyword,
    ProductTarget,
    Audience,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Keyword => "keyword",
            TargetType::ProductTarget => "product_target",
            TargetType::Audience => "audience",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(TargetType::Keyword),
            "product_target" => Some(TargetType::ProductTarget),
            "audience" => Some(TargetType::Audience),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Broad,
    Phrase,
    Exact,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Broad => "broad",
            MatchType::Phrase => "phrase",
            MatchType::Exact => "exact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "broad" => Some(MatchType::Broad),
            "phrase" => Some(MatchType::Phrase),
            "exact" => Some(MatchType::Exact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Enabled,
    Paused,
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Enabled => "enabled",
            EntityStatus::Paused => "paused",
            EntityStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(EntityStatus::Enabled),
            "paused" => Some(EntityStatus::Paused),
            "archived" => Some(EntityStatus::Archived),
            _ => None,
        }
    }
}

/// A biddable entity. Identity is `(target_type, id)`; the bid must stay
/// within the owning campaign's `[min_bid, max_bid]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub account_id: i64,
    pub campaign_id: i64,
    pub ad_group_id: i64,
    pub target_type: TargetType,
    /// Keyword text or targeting expression.
    pub expression: String,
    pub match_type: Option<MatchType>,
    pub bid: f64,
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub daily_budget: f64,
    /// Placement uplifts as integer percent (external convention).
    pub placement_top_pct: i64,
    pub placement_product_pct: i64,
    pub placement_rest_pct: i64,
    pub dayparting_enabled: bool,
    pub performance_group_id: Option<i64>,
    pub min_bid: f64,
    pub max_bid: f64,
    pub status: EntityStatus,
}

impl Campaign {
    /// Largest placement uplift currently configured, integer percent.
    pub fn max_placement_pct(&self) -> i64 {
        self.placement_top_pct
            .max(self.placement_product_pct)
            .max(self.placement_rest_pct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    MaximizeSales,
    TargetAcos,
    TargetRoas,
    DailySpendLimit,
    DailyCost,
}

impl OptimizationGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationGoal::MaximizeSales => "maximize_sales",
            OptimizationGoal::TargetAcos => "target_acos",
            OptimizationGoal::TargetRoas => "target_roas",
            OptimizationGoal::DailySpendLimit => "daily_spend_limit",
            OptimizationGoal::DailyCost => "daily_cost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "maximize_sales" => Some(OptimizationGoal::MaximizeSales),
            "target_acos" => Some(OptimizationGoal::TargetAcos),
            "target_roas" => Some(OptimizationGoal::TargetRoas),
            "daily_spend_limit" => Some(OptimizationGoal::DailySpendLimit),
            "daily_cost" => Some(OptimizationGoal::DailyCost),
            _ => None,
        }
    }
}

/// Goal container driving group-level optimization and budget
/// reallocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceGroup {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub goal: OptimizationGoal,
    /// Numeric goal value (target ACoS pct, target ROAS, daily limit).
    pub goal_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub needs_reauth: bool,
}

// =============================================================================
// PERFORMANCE SNAPSHOTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Report,
    Stream,
    Merged,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Report => "report",
            SnapshotSource::Stream => "stream",
            SnapshotSource::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "report" => Some(SnapshotSource::Report),
            "stream" => Some(SnapshotSource::Stream),
            "merged" => Some(SnapshotSource::Merged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Target,
    Campaign,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Target => "target",
            EntityKind::Campaign => "campaign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "target" => Some(EntityKind::Target),
            "campaign" => Some(EntityKind::Campaign),
            _ => None,
        }
    }
}

/// One day of performance for a target or campaign. Immutable once
/// written; late arrivals land as new rows keyed by `(source, event_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub account_id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
    pub source: SnapshotSource,
    pub event_time: DateTime<Utc>,
}

impl PerformanceSnapshot {
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    pub fn cvr(&self) -> f64 {
        if self.clicks == 0 {
            0.0
        } else {
            self.orders as f64 / self.clicks as f64
        }
    }

    pub fn roas(&self) -> f64 {
        if self.spend <= 0.0 {
            0.0
        } else {
            self.sales / self.spend
        }
    }

    pub fn acos(&self) -> f64 {
        if self.sales <= 0.0 {
            0.0
        } else {
            self.spend / self.sales * 100.0
        }
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Pacing loop interval in minutes. Floored at 15.
    pub pacing_interval_minutes: u64,
    pub scheduler_tick_seconds: u64,
    pub effect_tracking_interval_minutes: u64,
    pub worker_count: usize,
    pub params: AlgorithmParams,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./bidpilot.db".to_string());

        let pacing_interval_minutes = env_u64("PACING_INTERVAL_MINUTES", 15).max(15);
        let scheduler_tick_seconds = env_u64("SCHEDULER_TICK_SECONDS", 60);
        let effect_tracking_interval_minutes = env_u64("EFFECT_TRACKING_INTERVAL_MINUTES", 60);
        let worker_count = env_u64("WORKER_COUNT", 4) as usize;

        Ok(Self {
            database_path,
            pacing_interval_minutes,
            scheduler_tick_seconds,
            effect_tracking_interval_minutes,
            worker_count: worker_count.max(1),
            params: AlgorithmParams::from_env(),
        })
    }
}

/// Per-source weights used when fusing proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWeights {
    pub base_algo: f64,
    pub dayparting: f64,
    pub placement: f64,
    /// Highest weight: inventory encodes stock-protection hard
    /// constraints.
    pub inventory: f64,
    pub organic_rank: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            base_algo: 1.0,
            dayparting: 0.8,
            placement: 0.7,
            inventory: 1.0,
            organic_rank: 0.6,
        }
    }
}

/// Tunable thresholds shared by every algorithm. Read-mostly; updates are
/// copy-on-write and only affect evaluations initiated after the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmParams {
    /// Hard CPC cap enforced by the coordinator ($).
    pub max_allowed_cpc: f64,
    /// Soft warning threshold ($).
    pub cpc_warning_threshold: f64,
    /// Warn when the combined multiplier stack exceeds this.
    pub max_total_multiplier: f64,
    /// A circuit-breaker trip cannot raise bids beyond this multiple of
    /// the current bid.
    pub circuit_breaker_multiplier: f64,
    pub min_bid: f64,
    pub max_bid: f64,
    pub attribution_delay_hours: i64,
    /// Freeze horizon per algorithm kind, days of trailing data hidden
    /// from algorithmic reads.
    pub exclude_days_bid: i64,
    pub exclude_days_placement: i64,
    pub exclude_days_dayparting: i64,
    pub exclude_days_search_term: i64,
    /// Fraction of sales that is cost; margin factor is `1 - this`.
    pub profit_margin_pct: f64,
    pub conversion_value_multiplier: f64,
    pub max_daily_adjustments: u32,
    pub cooldown_period_hours: i64,
    pub min_confidence_threshold: f64,
    /// Minimum distinct bid points required to fit a market curve.
    pub min_data_points: usize,
    /// Largest single adjustment allowed at batch validation, percent.
    pub max_adjustment_pct: f64,
    pub pacing_critical_ratio: f64,
    pub pacing_overspend_ratio: f64,
    pub pacing_underspend_ratio: f64,
    pub anomaly_clicks_per_hour: u64,
    pub anomaly_ctr_pct: f64,
    pub anomaly_drain_clicks: u64,
    pub anomaly_drain_cpc: f64,
    /// Days after completion during which a batch may still be rolled
    /// back.
    pub rollback_window_days: i64,
    /// Suggestions older than this are purged.
    pub suggestion_retention_days: i64,
    /// Stream rows older than this with no report row trigger repair.
    pub backfill_threshold_hours: i64,
    pub weights: SourceWeights,
}

impl Default for AlgorithmParams {
    fn default() -> Self {
        Self {
            max_allowed_cpc: 5.0,
            cpc_warning_threshold: 3.0,
            max_total_multiplier: 2.5,
            circuit_breaker_multiplier: 1.5,
            min_bid: 0.02,
            max_bid: 100.0,
            attribution_delay_hours: 48,
            exclude_days_bid: 1,
            exclude_days_placement: 3,
            exclude_days_dayparting: 3,
            exclude_days_search_term: 1,
            profit_margin_pct: 0.30,
            conversion_value_multiplier: 1.0,
            max_daily_adjustments: 24,
            cooldown_period_hours: 6,
            min_confidence_threshold: 0.5,
            min_data_points: 5,
            max_adjustment_pct: 100.0,
            pacing_critical_ratio: 2.0,
            pacing_overspend_ratio: 1.5,
            pacing_underspend_ratio: 0.5,
            anomaly_clicks_per_hour: 100,
            anomaly_ctr_pct: 15.0,
            anomaly_drain_clicks: 50,
            anomaly_drain_cpc: 2.0,
            rollback_window_days: 30,
            suggestion_retention_days: 90,
            backfill_threshold_hours: 4,
            weights: SourceWeights::default(),
        }
    }
}

impl AlgorithmParams {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_allowed_cpc: env_f64("MAX_ALLOWED_CPC", d.max_allowed_cpc),
            cpc_warning_threshold: env_f64("CPC_WARNING_THRESHOLD", d.cpc_warning_threshold),
            max_total_multiplier: env_f64("MAX_TOTAL_MULTIPLIER", d.max_total_multiplier),
            circuit_breaker_multiplier: env_f64(
                "CIRCUIT_BREAKER_MULTIPLIER",
                d.circuit_breaker_multiplier,
            ),
            min_bid: env_f64("MIN_BID", d.min_bid),
            max_bid: env_f64("MAX_BID", d.max_bid),
            attribution_delay_hours: env_i64("ATTRIBUTION_DELAY_HOURS", d.attribution_delay_hours),
            exclude_days_bid: env_i64("EXCLUDE_DAYS_BID", d.exclude_days_bid),
            exclude_days_placement: env_i64("EXCLUDE_DAYS_PLACEMENT", d.exclude_days_placement),
            exclude_days_dayparting: env_i64("EXCLUDE_DAYS_DAYPARTING", d.exclude_days_dayparting),
            exclude_days_search_term: env_i64(
                "EXCLUDE_DAYS_SEARCH_TERM",
                d.exclude_days_search_term,
            ),
            profit_margin_pct: env_f64("PROFIT_MARGIN_PCT", d.profit_margin_pct),
            conversion_value_multiplier: env_f64(
                "CONVERSION_VALUE_MULTIPLIER",
                d.conversion_value_multiplier,
            ),
            max_daily_adjustments: env_u64("MAX_DAILY_ADJUSTMENTS", d.max_daily_adjustments as u64)
                as u32,
            cooldown_period_hours: env_i64("COOLDOWN_PERIOD_HOURS", d.cooldown_period_hours),
            min_confidence_threshold: env_f64(
                "MIN_CONFIDENCE_THRESHOLD",
                d.min_confidence_threshold,
            ),
            min_data_points: env_u64("MIN_DATA_POINTS", d.min_data_points as u64) as usize,
            max_adjustment_pct: env_f64("MAX_ADJUSTMENT_PCT", d.max_adjustment_pct),
            pacing_critical_ratio: env_f64("PACING_CRITICAL_RATIO", d.pacing_critical_ratio),
            pacing_overspend_ratio: env_f64("PACING_OVERSPEND_RATIO", d.pacing_overspend_ratio),
            pacing_underspend_ratio: env_f64("PACING_UNDERSPEND_RATIO", d.pacing_underspend_ratio),
            anomaly_clicks_per_hour: env_u64("ANOMALY_CLICKS_PER_HOUR", d.anomaly_clicks_per_hour),
            anomaly_ctr_pct: env_f64("ANOMALY_CTR_PCT", d.anomaly_ctr_pct),
            anomaly_drain_clicks: env_u64("ANOMALY_DRAIN_CLICKS", d.anomaly_drain_clicks),
            anomaly_drain_cpc: env_f64("ANOMALY_DRAIN_CPC", d.anomaly_drain_cpc),
            rollback_window_days: env_i64("ROLLBACK_WINDOW_DAYS", d.rollback_window_days),
            suggestion_retention_days: env_i64(
                "SUGGESTION_RETENTION_DAYS",
                d.suggestion_retention_days,
            ),
            backfill_threshold_hours: env_i64(
                "BACKFILL_THRESHOLD_HOURS",
                d.backfill_threshold_hours,
            ),
            weights: SourceWeights::default(),
        }
    }

    /// Margin factor applied to sales when estimating profit.
    pub fn margin(&self) -> f64 {
        (1.0 - self.profit_margin_pct).max(0.0)
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_cents() {
        assert_eq!(round_to_cents(1.666666), 1.67);
        assert_eq!(round_to_cents(0.024999), 0.02);
        assert_eq!(round_to_cents(1.999), 2.0);
    }

    #[test]
    fn test_snapshot_derived_metrics() {
        let snap = PerformanceSnapshot {
            account_id: 1,
            entity_kind: EntityKind::Target,
            entity_id: 42,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            impressions: 1000,
            clicks: 50,
            spend: 25.0,
            sales: 100.0,
            orders: 5,
            source: SnapshotSource::Report,
            event_time: Utc::now(),
        };
        assert!((snap.ctr() - 0.05).abs() < 1e-9);
        assert!((snap.cvr() - 0.10).abs() < 1e-9);
        assert!((snap.roas() - 4.0).abs() < 1e-9);
        assert!((snap.acos() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_denominators_do_not_panic() {
        let snap = PerformanceSnapshot {
            account_id: 1,
            entity_kind: EntityKind::Campaign,
            entity_id: 7,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            impressions: 0,
            clicks: 0,
            spend: 0.0,
            sales: 0.0,
            orders: 0,
            source: SnapshotSource::Stream,
            event_time: Utc::now(),
        };
        assert_eq!(snap.ctr(), 0.0);
        assert_eq!(snap.cvr(), 0.0);
        assert_eq!(snap.roas(), 0.0);
        assert_eq!(snap.acos(), 0.0);
    }

    #[test]
    fn test_default_weights_match_documented_table() {
        let w = SourceWeights::default();
        assert_eq!(w.base_algo, 1.0);
        assert_eq!(w.dayparting, 0.8);
        assert_eq!(w.placement, 0.7);
        assert_eq!(w.inventory, 1.0);
        assert_eq!(w.organic_rank, 0.6);
    }
}
