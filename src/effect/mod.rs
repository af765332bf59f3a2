//! Effect tracking
//!
//! Every applied bid adjustment is re-measured at the 7/14/30-day
//! horizons: realized profit over `[applied_at, applied_at + horizon]`
//! lands in the matching cell, once, never back-dated. Accuracy compares
//! realized against estimated profit and aggregates by source for
//! reporting. Missing attribution data is skipped outright, never
//! synthesized.

pub mod rollback;

use crate::models::{AlgorithmParams, EntityKind, SnapshotSource};
use crate::store::history::{BidAdjustmentRecord, HistoryStore};
use crate::store::SnapshotStore;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub use rollback::RollbackEngine;

const ACCURACY_EPS: f64 = 0.01;

/// `1 − |actual − estimated| / max(|estimated|, ε)`, clipped to [0, 1].
pub fn accuracy(actual: f64, estimated: f64) -> f64 {
    let denom = estimated.abs().max(ACCURACY_EPS);
    (1.0 - (actual - estimated).abs() / denom).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRunSummary {
    pub horizon_days: i64,
    pub examined: usize,
    pub updated: usize,
    pub skipped_no_data: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub tracked: usize,
    pub avg_accuracy: f64,
    pub avg_actual_profit_7d: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingStatsSummary {
    pub by_source: Vec<SourceStats>,
    pub total_tracked: usize,
}

pub struct EffectTracker {
    history: HistoryStore,
    snapshots: SnapshotStore,
    params: AlgorithmParams,
}

impl EffectTracker {
    pub fn new(history: HistoryStore, snapshots: SnapshotStore, params: AlgorithmParams) -> Self {
        Self {
            history,
            snapshots,
            params,
        }
    }

    /// Fill the horizon cell for every adjustment whose horizon has
    /// passed. Records without any attributed rows in the window are
    /// left open rather than guessed at.
    pub fn run_tracking_task(&self, horizon_days: i64) -> Result<TrackingRunSummary> {
        self.run_tracking_task_at(horizon_days, Utc::now())
    }

    pub fn run_tracking_task_at(
        &self,
        horizon_days: i64,
        now: DateTime<Utc>,
    ) -> Result<TrackingRunSummary> {
        let due = self.history.due_for_horizon(horizon_days, now)?;
        let mut updated = 0;
        let mut skipped_no_data = 0;

        for record in &due {
            match self.measure_window(record, horizon_days)? {
                Some((profit, spend, clicks, conversions)) => {
                    let seven_day_detail = if horizon_days == 7 {
                        Some((spend, clicks as i64, conversions as i64))
                    } else {
                        None
                    };
                    self.history.write_horizon_profit(
                        record.id,
                        horizon_days,
                        profit,
                        seven_day_detail,
                    )?;
                    updated += 1;
                }
                None => {
                    debug!(
                        adjustment_id = record.id,
                        horizon_days, "no attributed rows in window; cell left open"
                    );
                    skipped_no_data += 1;
                }
            }
        }

        info!(
            horizon_days,
            examined = due.len(),
            updated,
            skipped_no_data,
            "effect tracking pass complete"
        );
        Ok(TrackingRunSummary {
            horizon_days,
            examined: due.len(),
            updated,
            skipped_no_data,
        })
    }

    /// Realized numbers over `[applied_at, applied_at + horizon]` from
    /// the authoritative report track. `None` when nothing attributed.
    fn measure_window(
        &self,
        record: &BidAdjustmentRecord,
        horizon_days: i64,
    ) -> Result<Option<(f64, f64, u64, u64)>> {
        let start = record.applied_at.date_naive();
        let end = start + Duration::days(horizon_days);
        let rows = self.snapshots.daily_rows(
            record.account_id,
            EntityKind::Target,
            record.target_id,
            start,
            end,
            SnapshotSource::Report,
        )?;
        if rows.is_empty() {
            return Ok(None);
        }
        let spend: f64 = rows.iter().map(|r| r.spend).sum();
        let sales: f64 = rows.iter().map(|r| r.sales).sum();
        let clicks: u64 = rows.iter().map(|r| r.clicks).sum();
        let orders: u64 = rows.iter().map(|r| r.orders).sum();
        let profit = sales - spend * (1.0 + self.params.profit_margin_pct);
        Ok(Some((profit, spend, clicks, orders)))
    }

    /// Accuracy by source over every adjustment with a filled 7-day
    /// cell.
    pub fn stats_summary(&self) -> Result<TrackingStatsSummary> {
        let tracked = self.history.tracked_at_horizon(7, None)?;
        let mut grouped: HashMap<String, Vec<(f64, Option<f64>)>> = HashMap::new();
        for (record, actual) in &tracked {
            grouped
                .entry(record.source.as_str().to_string())
                .or_default()
                .push((*actual, record.expected_profit_delta));
        }

        let mut by_source: Vec<SourceStats> = grouped
            .into_iter()
            .map(|(source, rows)| {
                let n = rows.len();
                let avg_actual = rows.iter().map(|(a, _)| a).sum::<f64>() / n as f64;
                let scored: Vec<f64> = rows
                    .iter()
                    .filter_map(|(a, est)| est.map(|e| accuracy(*a, e)))
                    .collect();
                let avg_accuracy = if scored.is_empty() {
                    0.0
                } else {
                    scored.iter().sum::<f64>() / scored.len() as f64
                };
                SourceStats {
                    source,
                    tracked: n,
                    avg_accuracy,
                    avg_actual_profit_7d: avg_actual,
                }
            })
            .collect();
        by_source.sort_by(|a, b| a.source.cmp(&b.source));

        Ok(TrackingStatsSummary {
            total_tracked: tracked.len(),
            by_source,
        })
    }
}
