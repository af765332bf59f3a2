//! Rollback rules and suggestions
//!
//! Rules are versioned: every update bumps `version`, and evaluations
//! record the drop observed at evaluation time, so a later rule change
//! never retro-evaluates past records.

use crate::store::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Relative profit drop that triggers the rule, positive percent
    /// (20.0 means "actual fell 20% short of estimate").
    pub profit_threshold_pct: f64,
    /// One of 7, 14, 30.
    pub min_tracking_days: i64,
    pub min_sample_count: i64,
    pub include_negative_adjustments: bool,
    pub auto_rollback: bool,
    pub send_notification: bool,
    pub priority: i64,
    pub version: i64,
}

/// Fields a caller provides when creating or updating a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub enabled: bool,
    pub profit_threshold_pct: f64,
    pub min_tracking_days: i64,
    pub min_sample_count: i64,
    pub include_negative_adjustments: bool,
    pub auto_rollback: bool,
    pub send_notification: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Executed => "executed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "approved" => Some(SuggestionStatus::Approved),
            "rejected" => Some(SuggestionStatus::Rejected),
            "executed" => Some(SuggestionStatus::Executed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSuggestion {
    pub id: String,
    pub rule_id: i64,
    pub adjustment_id: i64,
    pub account_id: i64,
    pub target_id: i64,
    pub estimated_profit: f64,
    pub actual_profit: f64,
    /// Relative shortfall at evaluation time, negative fraction.
    pub drop_pct: f64,
    pub priority: i64,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
}

#[derive(Clone)]
pub struct RuleStore {
    db: Database,
}

impl RuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_rule(&self, spec: &RuleSpec) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO rollback_rules
               (name, enabled, profit_threshold_pct, min_tracking_days,
                min_sample_count, include_negative_adjustments, auto_rollback,
                send_notification, priority, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
            params![
                spec.name,
                spec.enabled as i64,
                spec.profit_threshold_pct,
                spec.min_tracking_days,
                spec.min_sample_count,
                spec.include_negative_adjustments as i64,
                spec.auto_rollback as i64,
                spec.send_notification as i64,
                spec.priority,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_rule(&self, id: i64, spec: &RuleSpec) -> Result<bool> {
        let changed = self.db.lock().execute(
            "UPDATE rollback_rules SET
               name = ?2, enabled = ?3, profit_threshold_pct = ?4,
               min_tracking_days = ?5, min_sample_count = ?6,
               include_negative_adjustments = ?7, auto_rollback = ?8,
               send_notification = ?9, priority = ?10,
               version = version + 1, updated_at = ?11
             WHERE id = ?1",
            params![
                id,
                spec.name,
                spec.enabled as i64,
                spec.profit_threshold_pct,
                spec.min_tracking_days,
                spec.min_sample_count,
                spec.include_negative_adjustments as i64,
                spec.auto_rollback as i64,
                spec.send_notification as i64,
                spec.priority,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<RollbackRule>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", RULE_SELECT),
                params![id],
                rule_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_rules(&self, enabled_only: bool) -> Result<Vec<RollbackRule>> {
        let sql = if enabled_only {
            format!("{} WHERE enabled = 1 ORDER BY priority DESC, id", RULE_SELECT)
        } else {
            format!("{} ORDER BY priority DESC, id", RULE_SELECT)
        };
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Suggestions
    // =========================================================================

    pub fn insert_suggestion(&self, s: &RollbackSuggestion) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO rollback_suggestions
               (id, rule_id, adjustment_id, account_id, target_id,
                estimated_profit, actual_profit, drop_pct, priority, status,
                created_at, reviewed_at, executed_at, batch_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, NULL)",
            params![
                s.id,
                s.rule_id,
                s.adjustment_id,
                s.account_id,
                s.target_id,
                s.estimated_profit,
                s.actual_profit,
                s.drop_pct,
                s.priority,
                s.status.as_str(),
                s.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// One open suggestion per adjustment; evaluation must not stack
    /// duplicates while an earlier one is unresolved.
    pub fn has_open_suggestion(&self, adjustment_id: i64) -> Result<bool> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rollback_suggestions
             WHERE adjustment_id = ?1 AND status IN ('pending', 'approved')",
            params![adjustment_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_suggestion(&self, id: &str) -> Result<Option<RollbackSuggestion>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SUGGESTION_SELECT),
                params![id],
                suggestion_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_suggestions(
        &self,
        status: Option<SuggestionStatus>,
        limit: u32,
    ) -> Result<Vec<RollbackSuggestion>> {
        let conn = self.db.lock();
        let sql = format!(
            "{} WHERE (?1 IS NULL OR status = ?1)
             ORDER BY priority DESC, created_at DESC LIMIT ?2",
            SUGGESTION_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str().to_string()), limit as i64],
                suggestion_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Compare-and-swap status move; false when the suggestion was not in
    /// `from`.
    pub fn transition_suggestion(
        &self,
        id: &str,
        from: SuggestionStatus,
        to: SuggestionStatus,
        batch_id: Option<&str>,
    ) -> Result<bool> {
        let column = match to {
            SuggestionStatus::Executed => "executed_at",
            _ => "reviewed_at",
        };
        let sql = format!(
            "UPDATE rollback_suggestions
             SET status = ?1, {} = ?2, batch_id = COALESCE(?3, batch_id)
             WHERE id = ?4 AND status = ?5",
            column
        );
        let changed = self.db.lock().execute(
            &sql,
            params![to.as_str(), Utc::now().to_rfc3339(), batch_id, id, from.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Drop suggestions older than the retention window; returns how many
    /// were removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let changed = self.db.lock().execute(
            "DELETE FROM rollback_suggestions WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }
}

const RULE_SELECT: &str = "SELECT id, name, enabled, profit_threshold_pct, min_tracking_days,
        min_sample_count, include_negative_adjustments, auto_rollback,
        send_notification, priority, version
 FROM rollback_rules";

const SUGGESTION_SELECT: &str = "SELECT id, rule_id, adjustment_id, account_id, target_id,
        estimated_profit, actual_profit, drop_pct, priority, status,
        created_at, reviewed_at, executed_at, batch_id
 FROM rollback_suggestions";

fn rule_from_row(r: &Row<'_>) -> rusqlite::Result<RollbackRule> {
    Ok(RollbackRule {
        id: r.get(0)?,
        name: r.get(1)?,
        enabled: r.get::<_, i64>(2)? != 0,
        profit_threshold_pct: r.get(3)?,
        min_tracking_days: r.get(4)?,
        min_sample_count: r.get(5)?,
        include_negative_adjustments: r.get::<_, i64>(6)? != 0,
        auto_rollback: r.get::<_, i64>(7)? != 0,
        send_notification: r.get::<_, i64>(8)? != 0,
        priority: r.get(9)?,
        version: r.get(10)?,
    })
}

fn suggestion_from_row(r: &Row<'_>) -> rusqlite::Result<RollbackSuggestion> {
    let status: String = r.get(9)?;
    let created_at: String = r.get(10)?;
    let reviewed_at: Option<String> = r.get(11)?;
    let executed_at: Option<String> = r.get(12)?;
    let parse = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    };
    Ok(RollbackSuggestion {
        id: r.get(0)?,
        rule_id: r.get(1)?,
        adjustment_id: r.get(2)?,
        account_id: r.get(3)?,
        target_id: r.get(4)?,
        estimated_profit: r.get(5)?,
        actual_profit: r.get(6)?,
        drop_pct: r.get(7)?,
        priority: r.get(8)?,
        status: SuggestionStatus::parse(&status).unwrap_or(SuggestionStatus::Pending),
        created_at: parse(created_at).unwrap_or_else(Utc::now),
        reviewed_at: reviewed_at.and_then(parse),
        executed_at: executed_at.and_then(parse),
        batch_id: r.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RuleStore {
        RuleStore::new(Database::open_in_memory().unwrap())
    }

    fn spec() -> RuleSpec {
        RuleSpec {
            name: "profit drop 20%".into(),
            enabled: true,
            profit_threshold_pct: 20.0,
            min_tracking_days: 7,
            min_sample_count: 1,
            include_negative_adjustments: true,
            auto_rollback: false,
            send_notification: true,
            priority: 5,
        }
    }

    fn suggestion(id: &str, adjustment_id: i64) -> RollbackSuggestion {
        RollbackSuggestion {
            id: id.to_string(),
            rule_id: 1,
            adjustment_id,
            account_id: 1,
            target_id: 42,
            estimated_profit: 20.0,
            actual_profit: -5.0,
            drop_pct: -1.25,
            priority: 5,
            status: SuggestionStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
            executed_at: None,
            batch_id: None,
        }
    }

    #[test]
    fn test_update_bumps_version() {
        let s = store();
        let id = s.create_rule(&spec()).unwrap();
        assert_eq!(s.get_rule(id).unwrap().unwrap().version, 1);
        let mut updated = spec();
        updated.profit_threshold_pct = 30.0;
        assert!(s.update_rule(id, &updated).unwrap());
        let rule = s.get_rule(id).unwrap().unwrap();
        assert_eq!(rule.version, 2);
        assert_eq!(rule.profit_threshold_pct, 30.0);
    }

    #[test]
    fn test_suggestion_lifecycle() {
        let s = store();
        s.insert_suggestion(&suggestion("s1", 10)).unwrap();
        assert!(s.has_open_suggestion(10).unwrap());

        assert!(s
            .transition_suggestion("s1", SuggestionStatus::Pending, SuggestionStatus::Approved, None)
            .unwrap());
        // Still counts as open until executed.
        assert!(s.has_open_suggestion(10).unwrap());
        assert!(s
            .transition_suggestion(
                "s1",
                SuggestionStatus::Approved,
                SuggestionStatus::Executed,
                Some("batch-9"),
            )
            .unwrap());
        let done = s.get_suggestion("s1").unwrap().unwrap();
        assert_eq!(done.status, SuggestionStatus::Executed);
        assert_eq!(done.batch_id.as_deref(), Some("batch-9"));
        assert!(!s.has_open_suggestion(10).unwrap());

        // Stale transition is rejected.
        assert!(!s
            .transition_suggestion("s1", SuggestionStatus::Pending, SuggestionStatus::Rejected, None)
            .unwrap());
    }

    #[test]
    fn test_purge_retention() {
        let s = store();
        let mut old = suggestion("old", 1);
        old.created_at = Utc::now() - chrono::Duration::days(120);
        s.insert_suggestion(&old).unwrap();
        s.insert_suggestion(&suggestion("fresh", 2)).unwrap();

        let removed = s
            .purge_older_than(Utc::now() - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(s.get_suggestion("old").unwrap().is_none());
        assert!(s.get_suggestion("fresh").unwrap().is_some());
    }
}
