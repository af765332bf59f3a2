//! Dual-track data plane
//!
//! Two tracks feed the system: slow authoritative report rows and fast
//! streaming telemetry. Conversions attribute with up to 48 hours of
//! delay, so the trailing days of data systematically under-count
//! successes. Algorithms therefore read only the frozen-safe window,
//! while the realtime guard channel reads the live buffer and exposes
//! only the fields that are trustworthy intraday: spend, clicks,
//! impressions.

pub mod consistency;

use crate::models::{
    AlgorithmParams, EntityKind, PerformanceSnapshot, SnapshotSource,
};
use crate::store::SnapshotStore;
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

pub use consistency::{ConsistencyChecker, ConsistencyReport, RepairPlan};

/// Stream data older than this is considered stale for guard reads.
const GUARD_STALENESS_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    Bid,
    Placement,
    Dayparting,
    SearchTerm,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::Bid => "bid",
            AlgorithmKind::Placement => "placement",
            AlgorithmKind::Dayparting => "dayparting",
            AlgorithmKind::SearchTerm => "search_term",
        }
    }
}

/// A safe-window daily row with the conversion-derived fields algorithms
/// may use beyond the freeze horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmRow {
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
    pub cvr: f64,
    pub roas: f64,
    pub acos: f64,
}

impl AlgorithmRow {
    fn from_snapshot(s: &PerformanceSnapshot) -> Self {
        Self {
            date: s.date,
            impressions: s.impressions,
            clicks: s.clicks,
            spend: s.spend,
            sales: s.sales,
            orders: s.orders,
            cvr: s.cvr(),
            roas: s.roas(),
            acos: s.acos(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmData {
    pub rows: Vec<AlgorithmRow>,
    pub safe_end_date: NaiveDate,
    pub excluded_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeSource {
    Stream,
    ReportFallback,
}

/// Guard-channel response. By contract this carries only spend, clicks
/// and impressions plus metadata: conversion-derived fields are
/// untrusted on the intraday horizon and must not influence realtime
/// decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSpend {
    pub spend: f64,
    pub clicks: u64,
    pub impressions: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub source: RealtimeSource,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualTrackStatus {
    pub account_id: i64,
    pub latest_stream_event: Option<DateTime<Utc>>,
    pub stream_lag_minutes: Option<i64>,
    pub stream_stale: bool,
    pub freeze_horizon_days: Vec<(String, i64)>,
}

pub struct DataPlane {
    snapshots: SnapshotStore,
    params: AlgorithmParams,
    /// Single writer per account on the ingest path; readers are
    /// lock-free against this (SQLite WAL serves them).
    ingest_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl DataPlane {
    pub fn new(snapshots: SnapshotStore, params: AlgorithmParams) -> Self {
        Self {
            snapshots,
            params,
            ingest_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn exclude_days(&self, kind: AlgorithmKind) -> i64 {
        match kind {
            AlgorithmKind::Bid => self.params.exclude_days_bid,
            AlgorithmKind::Placement => self.params.exclude_days_placement,
            AlgorithmKind::Dayparting => self.params.exclude_days_dayparting,
            AlgorithmKind::SearchTerm => self.params.exclude_days_search_term,
        }
    }

    fn account_ingest_lock(&self, account_id: i64) -> Arc<Mutex<()>> {
        self.ingest_locks
            .lock()
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append stream telemetry for one account.
    pub fn ingest_stream(&self, account_id: i64, rows: &[PerformanceSnapshot]) -> Result<()> {
        let lock = self.account_ingest_lock(account_id);
        let _guard = lock.lock();
        debug_assert!(rows.iter().all(|r| r.account_id == account_id));
        let stamped: Vec<PerformanceSnapshot> = rows
            .iter()
            .map(|r| PerformanceSnapshot {
                source: SnapshotSource::Stream,
                ..r.clone()
            })
            .collect();
        self.snapshots.insert_many(&stamped)
    }

    /// Append report rows for one account (the authoritative track).
    pub fn ingest_report(&self, account_id: i64, rows: &[PerformanceSnapshot]) -> Result<()> {
        let lock = self.account_ingest_lock(account_id);
        let _guard = lock.lock();
        debug_assert!(rows.iter().all(|r| r.account_id == account_id));
        let stamped: Vec<PerformanceSnapshot> = rows
            .iter()
            .map(|r| PerformanceSnapshot {
                source: SnapshotSource::Report,
                ..r.clone()
            })
            .collect();
        self.snapshots.insert_many(&stamped)
    }

    /// Account-level daily rows over the safe window for an algorithm
    /// kind: dates in `[safe_end − lookback, safe_end]` where
    /// `safe_end = today − exclude_days(kind)`.
    pub fn data_for_algorithm(
        &self,
        account_id: i64,
        kind: AlgorithmKind,
        lookback_days: i64,
    ) -> Result<AlgorithmData> {
        self.data_for_algorithm_at(account_id, kind, lookback_days, Utc::now())
    }

    /// Clock-injected variant; `now` is a parameter so the freeze window
    /// is testable.
    pub fn data_for_algorithm_at(
        &self,
        account_id: i64,
        kind: AlgorithmKind,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Result<AlgorithmData> {
        let excluded_days = self.exclude_days(kind);
        let safe_end = now.date_naive() - Duration::days(excluded_days);
        let start = safe_end - Duration::days(lookback_days);

        let rows = self.merged_daily_rows(account_id, EntityKind::Campaign, None, start, safe_end)?;
        Ok(AlgorithmData {
            rows,
            safe_end_date: safe_end,
            excluded_days,
        })
    }

    /// Safe-window daily rows for a single target.
    pub fn target_data_for_algorithm(
        &self,
        account_id: i64,
        target_id: i64,
        kind: AlgorithmKind,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Result<AlgorithmData> {
        let excluded_days = self.exclude_days(kind);
        let safe_end = now.date_naive() - Duration::days(excluded_days);
        let start = safe_end - Duration::days(lookback_days);
        let rows = self.merged_daily_rows(
            account_id,
            EntityKind::Target,
            Some(target_id),
            start,
            safe_end,
        )?;
        Ok(AlgorithmData {
            rows,
            safe_end_date: safe_end,
            excluded_days,
        })
    }

    /// Report rows win; stream rows only fill days the report track has
    /// not covered yet.
    fn merged_daily_rows(
        &self,
        account_id: i64,
        entity_kind: EntityKind,
        entity_id: Option<i64>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AlgorithmRow>> {
        let mut by_date: BTreeMap<NaiveDate, AlgorithmRow> = BTreeMap::new();

        let fetch = |source: SnapshotSource| -> Result<Vec<PerformanceSnapshot>> {
            match entity_id {
                Some(id) => self
                    .snapshots
                    .daily_rows(account_id, entity_kind, id, start, end, source),
                None => {
                    // Account-wide: sum campaign rows per day.
                    let mut merged: BTreeMap<NaiveDate, PerformanceSnapshot> = BTreeMap::new();
                    for row in self.snapshots.daily_rows_for_account(
                        account_id,
                        entity_kind,
                        start,
                        end,
                        source,
                    )? {
                        merged
                            .entry(row.date)
                            .and_modify(|acc| {
                                acc.impressions += row.impressions;
                                acc.clicks += row.clicks;
                                acc.spend += row.spend;
                                acc.sales += row.sales;
                                acc.orders += row.orders;
                            })
                            .or_insert(row);
                    }
                    Ok(merged.into_values().collect())
                }
            }
        };

        for snap in fetch(SnapshotSource::Stream)? {
            by_date.insert(snap.date, AlgorithmRow::from_snapshot(&snap));
        }
        // Report rows overwrite any stream-filled day.
        for snap in fetch(SnapshotSource::Report)? {
            by_date.insert(snap.date, AlgorithmRow::from_snapshot(&snap));
        }

        Ok(by_date.into_values().collect())
    }

    /// Realtime spend for the pacing guard: stream-preferred, report
    /// fallback with a stale warning. Restricted by contract to spend,
    /// clicks, impressions.
    pub fn realtime_spend_for_guard(
        &self,
        account_id: i64,
        campaign_id: Option<i64>,
    ) -> Result<RealtimeSpend> {
        self.realtime_spend_for_guard_at(account_id, campaign_id, Utc::now())
    }

    pub fn realtime_spend_for_guard_at(
        &self,
        account_id: i64,
        campaign_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<RealtimeSpend> {
        let today = now.date_naive();
        let last_update = self.snapshots.latest_stream_event(account_id)?;
        let stream_fresh = last_update
            .map(|t| now - t <= Duration::minutes(GUARD_STALENESS_MINUTES))
            .unwrap_or(false);

        if stream_fresh {
            let totals =
                self.snapshots
                    .totals(account_id, campaign_id, today, today, SnapshotSource::Stream)?;
            return Ok(RealtimeSpend {
                spend: totals.spend,
                clicks: totals.clicks,
                impressions: totals.impressions,
                last_update,
                source: RealtimeSource::Stream,
                stale: false,
            });
        }

        warn!(
            account_id,
            "stream buffer stale; guard falling back to report track"
        );
        let totals =
            self.snapshots
                .totals(account_id, campaign_id, today, today, SnapshotSource::Report)?;
        Ok(RealtimeSpend {
            spend: totals.spend,
            clicks: totals.clicks,
            impressions: totals.impressions,
            last_update,
            source: RealtimeSource::ReportFallback,
            stale: true,
        })
    }

    pub fn dual_track_status(&self, account_id: i64) -> Result<DualTrackStatus> {
        let now = Utc::now();
        let latest_stream_event = self.snapshots.latest_stream_event(account_id)?;
        let stream_lag_minutes = latest_stream_event.map(|t| (now - t).num_minutes());
        Ok(DualTrackStatus {
            account_id,
            latest_stream_event,
            stream_lag_minutes,
            stream_stale: stream_lag_minutes
                .map(|m| m > GUARD_STALENESS_MINUTES)
                .unwrap_or(true),
            freeze_horizon_days: vec![
                ("bid".to_string(), self.params.exclude_days_bid),
                ("placement".to_string(), self.params.exclude_days_placement),
                ("dayparting".to_string(), self.params.exclude_days_dayparting),
                ("search_term".to_string(), self.params.exclude_days_search_term),
            ],
        })
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use crate::testutil::snapshot_on;

    fn plane() -> DataPlane {
        let db = Database::open_in_memory().unwrap();
        DataPlane::new(SnapshotStore::new(db), AlgorithmParams::default())
    }

    fn seed_days(plane: &DataPlane, account_id: i64, now: DateTime<Utc>, days_back: i64) {
        let mut rows = Vec::new();
        for d in 0..days_back {
            let date = now.date_naive() - Duration::days(d);
            rows.push(snapshot_on(
                account_id,
                EntityKind::Campaign,
                10,
                date,
                SnapshotSource::Report,
                1000,
                50,
                25.0,
                100.0,
                5,
            ));
        }
        plane.ingest_report(account_id, &rows).unwrap();
    }

    #[test]
    fn test_freeze_horizon_for_dayparting() {
        let p = plane();
        let now = Utc::now();
        seed_days(&p, 7, now, 40);

        let data = p
            .data_for_algorithm_at(7, AlgorithmKind::Dayparting, 30, now)
            .unwrap();
        assert_eq!(data.excluded_days, 3);
        let d = now.date_naive();
        assert_eq!(data.safe_end_date, d - Duration::days(3));
        // Every returned row respects the freeze horizon and lookback.
        for row in &data.rows {
            assert!(row.date <= d - Duration::days(3));
            assert!(row.date >= d - Duration::days(33));
        }
        // The three frozen days are absent even though ingested.
        assert!(data.rows.iter().all(|r| r.date != d));
        assert!(data.rows.iter().all(|r| r.date != d - Duration::days(2)));
    }

    #[test]
    fn test_bid_algorithm_excludes_one_day() {
        let p = plane();
        let now = Utc::now();
        seed_days(&p, 7, now, 10);
        let data = p
            .data_for_algorithm_at(7, AlgorithmKind::Bid, 7, now)
            .unwrap();
        assert_eq!(data.excluded_days, 1);
        assert!(data.rows.iter().all(|r| r.date < now.date_naive()));
    }

    #[test]
    fn test_report_rows_win_over_stream() {
        let p = plane();
        let now = Utc::now();
        let d = now.date_naive() - Duration::days(5);
        p.ingest_stream(
            1,
            &[snapshot_on(1, EntityKind::Campaign, 10, d, SnapshotSource::Stream, 10, 1, 1.0, 0.0, 0)],
        )
        .unwrap();
        p.ingest_report(
            1,
            &[snapshot_on(1, EntityKind::Campaign, 10, d, SnapshotSource::Report, 500, 25, 12.0, 40.0, 2)],
        )
        .unwrap();

        let data = p.data_for_algorithm_at(1, AlgorithmKind::Bid, 7, now).unwrap();
        let row = data.rows.iter().find(|r| r.date == d).unwrap();
        assert_eq!(row.impressions, 500);
        assert!((row.roas - 40.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_guard_prefers_fresh_stream() {
        let p = plane();
        let now = Utc::now();
        let today = now.date_naive();
        p.ingest_stream(
            1,
            &[snapshot_on(1, EntityKind::Campaign, 10, today, SnapshotSource::Stream, 2000, 80, 90.0, 500.0, 9)],
        )
        .unwrap();

        let guard = p.realtime_spend_for_guard_at(1, Some(10), now).unwrap();
        assert_eq!(guard.source, RealtimeSource::Stream);
        assert!(!guard.stale);
        assert_eq!(guard.clicks, 80);
        assert!((guard.spend - 90.0).abs() < 1e-9);
        // The restricted contract: no conversion-derived fields exist on
        // the guard response type; spot-check the serialized form too.
        let json = serde_json::to_value(&guard).unwrap();
        assert!(json.get("sales").is_none());
        assert!(json.get("orders").is_none());
        assert!(json.get("roas").is_none());
        assert!(json.get("acos").is_none());
        assert!(json.get("cvr").is_none());
    }

    #[test]
    fn test_guard_falls_back_to_report_when_stream_stale() {
        let p = plane();
        let now = Utc::now();
        let today = now.date_naive();
        let mut old_stream =
            snapshot_on(1, EntityKind::Campaign, 10, today, SnapshotSource::Stream, 10, 1, 1.0, 0.0, 0);
        old_stream.event_time = now - Duration::hours(3);
        p.snapshots().insert(&old_stream).unwrap();
        p.ingest_report(
            1,
            &[snapshot_on(1, EntityKind::Campaign, 10, today, SnapshotSource::Report, 900, 45, 50.0, 0.0, 0)],
        )
        .unwrap();

        let guard = p.realtime_spend_for_guard_at(1, Some(10), now).unwrap();
        assert_eq!(guard.source, RealtimeSource::ReportFallback);
        assert!(guard.stale);
        assert!((guard.spend - 50.0).abs() < 1e-9);
    }
}
