//! Report/stream consistency checking and backfill repair
//!
//! The two tracks should agree once attribution settles. A divergence
//! above the tolerance on any field counts as one failed check; three
//! consecutive failures raise an alert. Stream rows that never received
//! a report counterpart within the backfill threshold are queued for
//! re-fetch from the report track.

use crate::models::SnapshotSource;
use crate::store::snapshots::{SnapshotStore, UnmatchedStreamRow, WindowTotals};
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Relative divergence tolerated between the tracks.
const DIVERGENCE_TOLERANCE: f64 = 0.05;
/// Consecutive failing checks before the alert trips.
const ALERT_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDivergence {
    pub field: String,
    pub report_value: f64,
    pub stream_value: f64,
    pub divergence_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub account_id: i64,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub consistent: bool,
    pub divergences: Vec<FieldDivergence>,
    pub consecutive_failures: u32,
    pub alert: bool,
}

/// Rows needing report re-fetch, grouped for one repair pass.
#[derive(Debug, Clone)]
pub struct RepairPlan {
    pub account_id: i64,
    pub rows: Vec<UnmatchedStreamRow>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct dates covered by the plan, the unit a report re-fetch
    /// works in.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.rows.iter().map(|r| r.date).collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }
}

pub struct ConsistencyChecker {
    snapshots: SnapshotStore,
    backfill_threshold_hours: i64,
    failures: Mutex<HashMap<i64, u32>>,
}

impl ConsistencyChecker {
    pub fn new(snapshots: SnapshotStore, backfill_threshold_hours: i64) -> Self {
        Self {
            snapshots,
            backfill_threshold_hours,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Compare report vs stream sums for the window and update the
    /// per-account consecutive-failure counter.
    pub fn check(
        &self,
        account_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ConsistencyReport> {
        let report =
            self.snapshots
                .totals(account_id, None, start, end, SnapshotSource::Report)?;
        let stream =
            self.snapshots
                .totals(account_id, None, start, end, SnapshotSource::Stream)?;

        let divergences = divergent_fields(&report, &stream);
        let consistent = divergences.is_empty();

        let mut failures = self.failures.lock();
        let counter = failures.entry(account_id).or_insert(0);
        if consistent {
            *counter = 0;
        } else {
            *counter += 1;
            warn!(
                account_id,
                consecutive = *counter,
                fields = divergences.len(),
                "report/stream divergence detected"
            );
        }
        let consecutive_failures = *counter;
        let alert = consecutive_failures >= ALERT_AFTER_FAILURES;
        drop(failures);

        if alert {
            error!(
                account_id,
                consecutive_failures, "dual-track consistency alert"
            );
        }

        Ok(ConsistencyReport {
            account_id,
            start,
            end,
            consistent,
            divergences,
            consecutive_failures,
            alert,
        })
    }

    /// Stream rows past the backfill threshold with no matching report
    /// row. The caller re-fetches the covered dates from reports and
    /// ingests them, which clears the rows from the next plan.
    pub fn repair_plan(&self, account_id: i64) -> Result<RepairPlan> {
        self.repair_plan_at(account_id, Utc::now())
    }

    pub fn repair_plan_at(&self, account_id: i64, now: DateTime<Utc>) -> Result<RepairPlan> {
        let threshold = now - Duration::hours(self.backfill_threshold_hours);
        let rows = self.snapshots.unmatched_stream_rows(account_id, threshold)?;
        if !rows.is_empty() {
            info!(
                account_id,
                rows = rows.len(),
                "backfill repair plan assembled"
            );
        }
        Ok(RepairPlan { account_id, rows })
    }
}

fn divergence(report: f64, stream: f64) -> f64 {
    let denom = report.abs().max(1e-9);
    ((stream - report) / denom).abs()
}

fn divergent_fields(report: &WindowTotals, stream: &WindowTotals) -> Vec<FieldDivergence> {
    let pairs: [(&'static str, f64, f64); 5] = [
        ("impressions", report.impressions as f64, stream.impressions as f64),
        ("clicks", report.clicks as f64, stream.clicks as f64),
        ("spend", report.spend, stream.spend),
        ("sales", report.sales, stream.sales),
        ("orders", report.orders as f64, stream.orders as f64),
    ];
    pairs
        .into_iter()
        .filter_map(|(field, r, s)| {
            // Both tracks empty on a field is agreement, not divergence.
            if r == 0.0 && s == 0.0 {
                return None;
            }
            let d = divergence(r, s);
            if d > DIVERGENCE_TOLERANCE {
                Some(FieldDivergence {
                    field: field.to_string(),
                    report_value: r,
                    stream_value: s,
                    divergence_pct: d * 100.0,
                })
            } else {
                None
            }
        })
        .collect()
}
