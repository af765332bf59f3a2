//! Performance snapshot store
//!
//! Append-only day-keyed rows from the slow report track and the fast
//! stream track. Rows are immutable once written; late arrivals land as
//! new rows keyed by `(source, event_time)`.

use crate::models::{EntityKind, PerformanceSnapshot, SnapshotSource};
use crate::store::Database;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Row};

#[derive(Clone)]
pub struct SnapshotStore {
    db: Database,
}

/// Aggregate over a window, one source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowTotals {
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
}

/// Stream row lacking a report-side counterpart; candidate for backfill
/// repair.
#[derive(Debug, Clone)]
pub struct UnmatchedStreamRow {
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub date: NaiveDate,
    pub event_time: DateTime<Utc>,
}

impl SnapshotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, snap: &PerformanceSnapshot) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO performance_snapshots
               (account_id, entity_kind, entity_id, date, impressions, clicks,
                spend, sales, orders, source, event_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                snap.account_id,
                snap.entity_kind.as_str(),
                snap.entity_id,
                snap.date.format("%Y-%m-%d").to_string(),
                snap.impressions as i64,
                snap.clicks as i64,
                snap.spend,
                snap.sales,
                snap.orders as i64,
                snap.source.as_str(),
                snap.event_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_many(&self, snaps: &[PerformanceSnapshot]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO performance_snapshots
                   (account_id, entity_kind, entity_id, date, impressions, clicks,
                    spend, sales, orders, source, event_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for snap in snaps {
                stmt.execute(params![
                    snap.account_id,
                    snap.entity_kind.as_str(),
                    snap.entity_id,
                    snap.date.format("%Y-%m-%d").to_string(),
                    snap.impressions as i64,
                    snap.clicks as i64,
                    snap.spend,
                    snap.sales,
                    snap.orders as i64,
                    snap.source.as_str(),
                    snap.event_time.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Daily rows for one entity within `[start, end]`, restricted to a
    /// source. Multiple rows for the same day are summed (late arrivals).
    pub fn daily_rows(
        &self,
        account_id: i64,
        entity_kind: EntityKind,
        entity_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        source: SnapshotSource,
    ) -> Result<Vec<PerformanceSnapshot>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, entity_kind, entity_id, date,
                    SUM(impressions), SUM(clicks), SUM(spend), SUM(sales), SUM(orders),
                    source, MAX(event_time)
             FROM performance_snapshots
             WHERE account_id = ?1 AND entity_kind = ?2 AND entity_id = ?3
               AND date >= ?4 AND date <= ?5 AND source = ?6
             GROUP BY date
             ORDER BY date",
        )?;
        let rows = stmt
            .query_map(
                params![
                    account_id,
                    entity_kind.as_str(),
                    entity_id,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                    source.as_str(),
                ],
                snapshot_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Per-entity daily rows across a whole account for one source.
    pub fn daily_rows_for_account(
        &self,
        account_id: i64,
        entity_kind: EntityKind,
        start: NaiveDate,
        end: NaiveDate,
        source: SnapshotSource,
    ) -> Result<Vec<PerformanceSnapshot>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, entity_kind, entity_id, date,
                    SUM(impressions), SUM(clicks), SUM(spend), SUM(sales), SUM(orders),
                    source, MAX(event_time)
             FROM performance_snapshots
             WHERE account_id = ?1 AND entity_kind = ?2
               AND date >= ?3 AND date <= ?4 AND source = ?5
             GROUP BY entity_id, date
             ORDER BY date, entity_id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    account_id,
                    entity_kind.as_str(),
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                    source.as_str(),
                ],
                snapshot_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Account-wide totals for one source over `[start, end]`, optionally
    /// restricted to a campaign's rows.
    pub fn totals(
        &self,
        account_id: i64,
        campaign_id: Option<i64>,
        start: NaiveDate,
        end: NaiveDate,
        source: SnapshotSource,
    ) -> Result<WindowTotals> {
        let conn = self.db.lock();
        let sql = if campaign_id.is_some() {
            "SELECT COALESCE(SUM(impressions),0), COALESCE(SUM(clicks),0),
                    COALESCE(SUM(spend),0), COALESCE(SUM(sales),0), COALESCE(SUM(orders),0)
             FROM performance_snapshots
             WHERE account_id = ?1 AND source = ?2 AND date >= ?3 AND date <= ?4
               AND entity_kind = 'campaign' AND entity_id = ?5"
        } else {
            "SELECT COALESCE(SUM(impressions),0), COALESCE(SUM(clicks),0),
                    COALESCE(SUM(spend),0), COALESCE(SUM(sales),0), COALESCE(SUM(orders),0)
             FROM performance_snapshots
             WHERE account_id = ?1 AND source = ?2 AND date >= ?3 AND date <= ?4
               AND entity_kind = 'campaign' AND ?5 IS NULL"
        };
        let row = conn.query_row(
            sql,
            params![
                account_id,
                source.as_str(),
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string(),
                campaign_id,
            ],
            |r| {
                Ok(WindowTotals {
                    impressions: r.get::<_, i64>(0)? as u64,
                    clicks: r.get::<_, i64>(1)? as u64,
                    spend: r.get(2)?,
                    sales: r.get(3)?,
                    orders: r.get::<_, i64>(4)? as u64,
                })
            },
        )?;
        Ok(row)
    }

    /// Most recent stream event time for the account, if any.
    pub fn latest_stream_event(&self, account_id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(event_time) FROM performance_snapshots
             WHERE account_id = ?1 AND source = 'stream'",
            params![account_id],
            |r| r.get(0),
        )?;
        Ok(ts.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    /// Stream rows whose event time is older than `threshold` and for
    /// which no report row exists on the same `(entity, date)`.
    pub fn unmatched_stream_rows(
        &self,
        account_id: i64,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<UnmatchedStreamRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT s.entity_kind, s.entity_id, s.date, s.event_time
             FROM performance_snapshots s
             WHERE s.account_id = ?1 AND s.source = 'stream' AND s.event_time < ?2
               AND NOT EXISTS (
                 SELECT 1 FROM performance_snapshots r
                 WHERE r.account_id = s.account_id AND r.source = 'report'
                   AND r.entity_kind = s.entity_kind AND r.entity_id = s.entity_id
                   AND r.date = s.date
               )
             ORDER BY s.date",
        )?;
        let rows = stmt
            .query_map(params![account_id, threshold.to_rfc3339()], |r| {
                let kind: String = r.get(0)?;
                let date: String = r.get(2)?;
                let event_time: String = r.get(3)?;
                Ok((kind, r.get::<_, i64>(1)?, date, event_time))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(kind, entity_id, date, event_time)| {
                Some(UnmatchedStreamRow {
                    entity_kind: EntityKind::parse(&kind)?,
                    entity_id,
                    date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?,
                    event_time: DateTime::parse_from_rfc3339(&event_time)
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect())
    }
}

fn snapshot_from_row(r: &Row<'_>) -> rusqlite::Result<PerformanceSnapshot> {
    let kind: String = r.get(1)?;
    let date: String = r.get(3)?;
    let source: String = r.get(9)?;
    let event_time: String = r.get(10)?;
    Ok(PerformanceSnapshot {
        account_id: r.get(0)?,
        entity_kind: EntityKind::parse(&kind).unwrap_or(EntityKind::Target),
        entity_id: r.get(2)?,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").unwrap_or_default(),
        impressions: r.get::<_, i64>(4)? as u64,
        clicks: r.get::<_, i64>(5)? as u64,
        spend: r.get(6)?,
        sales: r.get(7)?,
        orders: r.get::<_, i64>(8)? as u64,
        source: SnapshotSource::parse(&source).unwrap_or(SnapshotSource::Report),
        event_time: DateTime::parse_from_rfc3339(&event_time)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
