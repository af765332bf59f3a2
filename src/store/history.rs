//! Bid-adjustment history and coordination audit log
//!
//! The history table is append-only: applied bid changes are never
//! edited, only flagged `is_rolled_back` by a later reversal. The effect
//! tracker joins against it by adjustment id.

use crate::models::{round_to_cents, TargetType};
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentSource {
    AutoOptimal,
    AutoDayparting,
    AutoPlacement,
    BatchCampaign,
    BatchGroup,
    Coordinator,
    Manual,
    Rollback,
}

impl AdjustmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentSource::AutoOptimal => "auto_optimal",
            AdjustmentSource::AutoDayparting => "auto_dayparting",
            AdjustmentSource::AutoPlacement => "auto_placement",
            AdjustmentSource::BatchCampaign => "batch_campaign",
            AdjustmentSource::BatchGroup => "batch_group",
            AdjustmentSource::Coordinator => "coordinator",
            AdjustmentSource::Manual => "manual",
            AdjustmentSource::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_optimal" => Some(AdjustmentSource::AutoOptimal),
            "auto_dayparting" => Some(AdjustmentSource::AutoDayparting),
            "auto_placement" => Some(AdjustmentSource::AutoPlacement),
            "batch_campaign" => Some(AdjustmentSource::BatchCampaign),
            "batch_group" => Some(AdjustmentSource::BatchGroup),
            "coordinator" => Some(AdjustmentSource::Coordinator),
            "manual" => Some(AdjustmentSource::Manual),
            "rollback" => Some(AdjustmentSource::Rollback),
            _ => None,
        }
    }
}

/// Pre-adjustment KPIs captured when a bid change is applied, the
/// baseline the effect tracker measures against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiBaseline {
    pub window_days: i64,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAdjustmentRecord {
    pub id: i64,
    pub account_id: i64,
    pub target_id: i64,
    pub target_type: TargetType,
    pub previous_bid: f64,
    pub new_bid: f64,
    pub source: AdjustmentSource,
    pub reason: String,
    pub expected_profit_delta: Option<f64>,
    pub applied_by: String,
    pub applied_at: DateTime<Utc>,
    pub is_rolled_back: bool,
    pub baseline: Option<KpiBaseline>,
}

/// New adjustment about to be appended; id and timestamp assigned by the
/// store.
#[derive(Debug, Clone)]
pub struct NewAdjustment {
    pub account_id: i64,
    pub target_id: i64,
    pub target_type: TargetType,
    pub previous_bid: f64,
    pub new_bid: f64,
    pub source: AdjustmentSource,
    pub reason: String,
    pub expected_profit_delta: Option<f64>,
    pub applied_by: String,
    pub baseline: Option<KpiBaseline>,
}

/// Post-adjustment measurements at the 7/14/30-day horizons. Horizon
/// cells are written once, never back-dated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffectRecord {
    pub adjustment_id: i64,
    pub actual_profit_7d: Option<f64>,
    pub actual_profit_14d: Option<f64>,
    pub actual_profit_30d: Option<f64>,
    pub actual_spend_7d: Option<f64>,
    pub actual_clicks_7d: Option<i64>,
    pub actual_conversions_7d: Option<i64>,
    pub tracked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub account_id: Option<i64>,
    pub target_id: Option<i64>,
    pub source: Option<AdjustmentSource>,
    pub include_rolled_back: bool,
}

#[derive(Clone)]
pub struct HistoryStore {
    db: Database,
}

impl HistoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(&self, adj: &NewAdjustment) -> Result<i64> {
        let baseline_json = adj
            .baseline
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize KPI baseline")?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO bid_adjustment_history
               (account_id, target_id, target_type, previous_bid, new_bid,
                source, reason, expected_profit_delta, applied_by, applied_at,
                is_rolled_back, baseline_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                adj.account_id,
                adj.target_id,
                adj.target_type.as_str(),
                round_to_cents(adj.previous_bid),
                round_to_cents(adj.new_bid),
                adj.source.as_str(),
                adj.reason,
                adj.expected_profit_delta,
                adj.applied_by,
                Utc::now().to_rfc3339(),
                baseline_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<BidAdjustmentRecord>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_SQL),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn latest_for_target(&self, target_id: i64) -> Result<Option<BidAdjustmentRecord>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "{} WHERE target_id = ?1 ORDER BY applied_at DESC, id DESC LIMIT 1",
                    SELECT_SQL
                ),
                params![target_id],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Applied adjustments for a target since `since`, for the daily cap
    /// and cooldown checks.
    pub fn count_since(&self, target_id: i64, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bid_adjustment_history
             WHERE target_id = ?1 AND applied_at >= ?2",
            params![target_id, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn query(
        &self,
        filter: &HistoryFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<BidAdjustmentRecord>> {
        let mut sql = format!("{} WHERE 1=1", SELECT_SQL);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(account_id) = filter.account_id {
            args.push(Box::new(account_id));
            sql.push_str(&format!(" AND account_id = ?{}", args.len()));
        }
        if let Some(target_id) = filter.target_id {
            args.push(Box::new(target_id));
            sql.push_str(&format!(" AND target_id = ?{}", args.len()));
        }
        if let Some(source) = filter.source {
            args.push(Box::new(source.as_str().to_string()));
            sql.push_str(&format!(" AND source = ?{}", args.len()));
        }
        if !filter.include_rolled_back {
            sql.push_str(" AND is_rolled_back = 0");
        }
        args.push(Box::new(page_size as i64));
        sql.push_str(&format!(" ORDER BY applied_at DESC, id DESC LIMIT ?{}", args.len()));
        args.push(Box::new((page as i64) * (page_size as i64)));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_rolled_back(&self, id: i64) -> Result<()> {
        let changed = self.db.lock().execute(
            "UPDATE bid_adjustment_history SET is_rolled_back = 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            anyhow::bail!("adjustment {} does not exist", id);
        }
        Ok(())
    }

    // =========================================================================
    // Effect tracking cells
    // =========================================================================

    /// Adjustments whose `applied_at + horizon` has passed and whose
    /// horizon cell is still empty.
    pub fn due_for_horizon(
        &self,
        horizon_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BidAdjustmentRecord>> {
        let column = horizon_column(horizon_days)?;
        let cutoff = now - chrono::Duration::days(horizon_days);
        let sql = format!(
            "{} WHERE applied_at <= ?1 AND id NOT IN (
                 SELECT adjustment_id FROM effect_tracking WHERE {} IS NOT NULL
             ) ORDER BY applied_at",
            SELECT_SQL, column
        );
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn write_horizon_profit(
        &self,
        adjustment_id: i64,
        horizon_days: i64,
        profit: f64,
        seven_day_detail: Option<(f64, i64, i64)>,
    ) -> Result<()> {
        let column = horizon_column(horizon_days)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO effect_tracking (adjustment_id, tracked_at)
             VALUES (?1, ?2)
             ON CONFLICT(adjustment_id) DO UPDATE SET tracked_at = ?2",
            params![adjustment_id, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            &format!(
                "UPDATE effect_tracking SET {} = ?2 WHERE adjustment_id = ?1",
                column
            ),
            params![adjustment_id, profit],
        )?;
        if let Some((spend, clicks, conversions)) = seven_day_detail {
            conn.execute(
                "UPDATE effect_tracking
                 SET actual_spend_7d = ?2, actual_clicks_7d = ?3, actual_conversions_7d = ?4
                 WHERE adjustment_id = ?1",
                params![adjustment_id, spend, clicks, conversions],
            )?;
        }
        Ok(())
    }

    pub fn effect(&self, adjustment_id: i64) -> Result<Option<EffectRecord>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT adjustment_id, actual_profit_7d, actual_profit_14d,
                        actual_profit_30d, actual_spend_7d, actual_clicks_7d,
                        actual_conversions_7d, tracked_at
                 FROM effect_tracking WHERE adjustment_id = ?1",
                params![adjustment_id],
                |r| {
                    let tracked_at: Option<String> = r.get(7)?;
                    Ok(EffectRecord {
                        adjustment_id: r.get(0)?,
                        actual_profit_7d: r.get(1)?,
                        actual_profit_14d: r.get(2)?,
                        actual_profit_30d: r.get(3)?,
                        actual_spend_7d: r.get(4)?,
                        actual_clicks_7d: r.get(5)?,
                        actual_conversions_7d: r.get(6)?,
                        tracked_at: tracked_at.and_then(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .ok()
                                .map(|d| d.with_timezone(&Utc))
                        }),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Adjustments with a filled cell at the given horizon, newest first.
    pub fn tracked_at_horizon(
        &self,
        horizon_days: i64,
        account_id: Option<i64>,
    ) -> Result<Vec<(BidAdjustmentRecord, f64)>> {
        let column = horizon_column(horizon_days)?;
        let sql = format!(
            "SELECT h.id, h.account_id, h.target_id, h.target_type, h.previous_bid,
                    h.new_bid, h.source, h.reason, h.expected_profit_delta,
                    h.applied_by, h.applied_at, h.is_rolled_back, h.baseline_json,
                    e.{}
             FROM bid_adjustment_history h
             JOIN effect_tracking e ON e.adjustment_id = h.id
             WHERE e.{} IS NOT NULL AND (?1 IS NULL OR h.account_id = ?1)
             ORDER BY h.applied_at DESC",
            column, column
        );
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![account_id], |r| {
                let record = record_from_row(r)?;
                let actual: f64 = r.get(13)?;
                Ok((record, actual))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Coordination audit log
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn log_coordination(
        &self,
        account_id: i64,
        campaign_id: i64,
        target_id: i64,
        original_bid: f64,
        final_bid: f64,
        theoretical_max_cpc: f64,
        effective_multiplier: f64,
        circuit_breaker_tripped: bool,
        reason: &str,
        warnings_json: &str,
        proposals_json: &str,
    ) -> Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO coordination_log
               (account_id, campaign_id, target_id, original_bid, final_bid,
                theoretical_max_cpc, effective_multiplier, circuit_breaker_tripped,
                reason, warnings_json, proposals_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                account_id,
                campaign_id,
                target_id,
                original_bid,
                final_bid,
                theoretical_max_cpc,
                effective_multiplier,
                circuit_breaker_tripped as i64,
                reason,
                warnings_json,
                proposals_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

const SELECT_SQL: &str = "SELECT id, account_id, target_id, target_type, previous_bid, new_bid,
        source, reason, expected_profit_delta, applied_by, applied_at,
        is_rolled_back, baseline_json
 FROM bid_adjustment_history";

fn horizon_column(horizon_days: i64) -> Result<&'static str> {
    match horizon_days {
        7 => Ok("actual_profit_7d"),
        14 => Ok("actual_profit_14d"),
        30 => Ok("actual_profit_30d"),
        other => anyhow::bail!("unsupported tracking horizon: {} days", other),
    }
}

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<BidAdjustmentRecord> {
    let target_type: String = r.get(3)?;
    let source: String = r.get(6)?;
    let applied_at: String = r.get(10)?;
    let baseline_json: Option<String> = r.get(12)?;
    Ok(BidAdjustmentRecord {
        id: r.get(0)?,
        account_id: r.get(1)?,
        target_id: r.get(2)?,
        target_type: TargetType::parse(&target_type).unwrap_or(TargetType::Keyword),
        previous_bid: r.get(4)?,
        new_bid: r.get(5)?,
        source: AdjustmentSource::parse(&source).unwrap_or(AdjustmentSource::Manual),
        reason: r.get(7)?,
        expected_profit_delta: r.get(8)?,
        applied_by: r.get(9)?,
        applied_at: DateTime::parse_from_rfc3339(&applied_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        is_rolled_back: r.get::<_, i64>(11)? != 0,
        baseline: baseline_json.and_then(|j| serde_json::from_str(&j).ok()),
    })
}
