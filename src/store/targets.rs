//! Entity store: accounts, campaigns, performance groups, targets,
//! negative keywords and the dayparting multiplier tables.
//!
//! Cross-entity references are ids, resolved through explicit fetches;
//! a dangling id surfaces as `None` at this layer and `NotFound` at the
//! service boundary.

use crate::models::{
    round_to_cents, Account, Campaign, EntityStatus, MatchType, OptimizationGoal,
    PerformanceGroup, Target, TargetType,
};
use crate::store::Database;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct EntityStore {
    db: Database,
}

#[derive(Debug, Clone)]
pub struct NegativeKeyword {
    pub id: i64,
    pub account_id: i64,
    pub campaign_id: i64,
    pub ad_group_id: Option<i64>,
    pub keyword: String,
    pub match_type: MatchType,
}

impl EntityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub fn upsert_account(&self, account: &Account) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO accounts (id, name, needs_reauth) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = ?2, needs_reauth = ?3",
            params![account.id, account.name, account.needs_reauth as i64],
        )?;
        Ok(())
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT id, name, needs_reauth FROM accounts WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Account {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        needs_reauth: r.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT id, name, needs_reauth FROM accounts ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Account {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    needs_reauth: r.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Flag an account as needing re-authentication. Downstream syncs for
    /// this account halt; other accounts are unaffected.
    pub fn mark_needs_reauth(&self, account_id: i64) -> Result<()> {
        self.db.lock().execute(
            "UPDATE accounts SET needs_reauth = 1 WHERE id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Campaigns & groups
    // =========================================================================

    pub fn upsert_campaign(&self, c: &Campaign) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO campaigns
               (id, account_id, name, daily_budget, placement_top_pct,
                placement_product_pct, placement_rest_pct, dayparting_enabled,
                performance_group_id, min_bid, max_bid, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
               name = ?3, daily_budget = ?4, placement_top_pct = ?5,
               placement_product_pct = ?6, placement_rest_pct = ?7,
               dayparting_enabled = ?8, performance_group_id = ?9,
               min_bid = ?10, max_bid = ?11, status = ?12",
            params![
                c.id,
                c.account_id,
                c.name,
                round_to_cents(c.daily_budget),
                c.placement_top_pct,
                c.placement_product_pct,
                c.placement_rest_pct,
                c.dayparting_enabled as i64,
                c.performance_group_id,
                c.min_bid,
                c.max_bid,
                c.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_campaign(&self, id: i64) -> Result<Option<Campaign>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT id, account_id, name, daily_budget, placement_top_pct,
                        placement_product_pct, placement_rest_pct, dayparting_enabled,
                        performance_group_id, min_bid, max_bid, status
                 FROM campaigns WHERE id = ?1",
                params![id],
                campaign_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_campaigns(&self, account_id: i64) -> Result<Vec<Campaign>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, daily_budget, placement_top_pct,
                    placement_product_pct, placement_rest_pct, dayparting_enabled,
                    performance_group_id, min_bid, max_bid, status
             FROM campaigns WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![account_id], campaign_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_enabled_campaigns(&self, account_id: i64) -> Result<Vec<Campaign>> {
        Ok(self
            .list_campaigns(account_id)?
            .into_iter()
            .filter(|c| c.status == EntityStatus::Enabled)
            .collect())
    }

    pub fn list_group_campaigns(&self, group_id: i64) -> Result<Vec<Campaign>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, daily_budget, placement_top_pct,
                    placement_product_pct, placement_rest_pct, dayparting_enabled,
                    performance_group_id, min_bid, max_bid, status
             FROM campaigns WHERE performance_group_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![group_id], campaign_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_campaign_status(&self, id: i64, status: EntityStatus) -> Result<()> {
        let changed = self.db.lock().execute(
            "UPDATE campaigns SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            bail!("campaign {} does not exist", id);
        }
        Ok(())
    }

    pub fn set_campaign_budget(&self, id: i64, daily_budget: f64) -> Result<()> {
        let changed = self.db.lock().execute(
            "UPDATE campaigns SET daily_budget = ?2 WHERE id = ?1",
            params![id, round_to_cents(daily_budget)],
        )?;
        if changed == 0 {
            bail!("campaign {} does not exist", id);
        }
        Ok(())
    }

    pub fn upsert_group(&self, g: &PerformanceGroup) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO performance_groups (id, account_id, name, goal, goal_value)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = ?3, goal = ?4, goal_value = ?5",
            params![g.id, g.account_id, g.name, g.goal.as_str(), g.goal_value],
        )?;
        Ok(())
    }

    pub fn get_group(&self, id: i64) -> Result<Option<PerformanceGroup>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT id, account_id, name, goal, goal_value
                 FROM performance_groups WHERE id = ?1",
                params![id],
                |r| {
                    let goal: String = r.get(3)?;
                    Ok(PerformanceGroup {
                        id: r.get(0)?,
                        account_id: r.get(1)?,
                        name: r.get(2)?,
                        goal: OptimizationGoal::parse(&goal)
                            .unwrap_or(OptimizationGoal::MaximizeSales),
                        goal_value: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // =========================================================================
    // Targets
    // =========================================================================

    pub fn upsert_target(&self, t: &Target) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO targets
               (id, account_id, campaign_id, ad_group_id, target_type,
                expression, match_type, bid, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               expression = ?6, match_type = ?7, bid = ?8, status = ?9",
            params![
                t.id,
                t.account_id,
                t.campaign_id,
                t.ad_group_id,
                t.target_type.as_str(),
                t.expression,
                t.match_type.map(|m| m.as_str()),
                round_to_cents(t.bid),
                t.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_target(&self, id: i64) -> Result<Option<Target>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT id, account_id, campaign_id, ad_group_id, target_type,
                        expression, match_type, bid, status
                 FROM targets WHERE id = ?1",
                params![id],
                target_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_targets(&self, campaign_id: i64) -> Result<Vec<Target>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, campaign_id, ad_group_id, target_type,
                    expression, match_type, bid, status
             FROM targets WHERE campaign_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![campaign_id], target_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Write a target bid. The value is clamped against the owning
    /// campaign's bounds before the write; callers that need an error on
    /// out-of-bounds values validate first.
    pub fn update_bid(&self, target_id: i64, bid: f64) -> Result<f64> {
        let target = self
            .get_target(target_id)?
            .with_context(|| format!("target {} does not exist", target_id))?;
        let campaign = self
            .get_campaign(target.campaign_id)?
            .with_context(|| format!("campaign {} does not exist", target.campaign_id))?;
        let clamped = round_to_cents(bid.clamp(campaign.min_bid, campaign.max_bid));
        self.db.lock().execute(
            "UPDATE targets SET bid = ?2 WHERE id = ?1",
            params![target_id, clamped],
        )?;
        Ok(clamped)
    }

    pub fn set_target_status(&self, target_id: i64, status: EntityStatus) -> Result<()> {
        let changed = self.db.lock().execute(
            "UPDATE targets SET status = ?2 WHERE id = ?1",
            params![target_id, status.as_str()],
        )?;
        if changed == 0 {
            bail!("target {} does not exist", target_id);
        }
        Ok(())
    }

    /// Create a new keyword target (keyword migration destination) and
    /// return its id.
    pub fn create_keyword(
        &self,
        account_id: i64,
        campaign_id: i64,
        ad_group_id: i64,
        keyword: &str,
        match_type: MatchType,
        bid: f64,
    ) -> Result<i64> {
        let conn = self.db.lock();
        let next_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM targets",
            [],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO targets
               (id, account_id, campaign_id, ad_group_id, target_type,
                expression, match_type, bid, status)
             VALUES (?1, ?2, ?3, ?4, 'keyword', ?5, ?6, ?7, 'enabled')",
            params![
                next_id,
                account_id,
                campaign_id,
                ad_group_id,
                keyword,
                match_type.as_str(),
                round_to_cents(bid),
            ],
        )?;
        Ok(next_id)
    }

    // =========================================================================
    // Negative keywords
    // =========================================================================

    pub fn add_negative_keyword(
        &self,
        account_id: i64,
        campaign_id: i64,
        ad_group_id: Option<i64>,
        keyword: &str,
        match_type: MatchType,
    ) -> Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO negative_keywords
               (account_id, campaign_id, ad_group_id, keyword, match_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account_id,
                campaign_id,
                ad_group_id,
                keyword,
                match_type.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn remove_negative_keyword(
        &self,
        campaign_id: i64,
        keyword: &str,
        match_type: MatchType,
    ) -> Result<bool> {
        let changed = self.db.lock().execute(
            "DELETE FROM negative_keywords
             WHERE campaign_id = ?1 AND keyword = ?2 AND match_type = ?3",
            params![campaign_id, keyword, match_type.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn list_negative_keywords(&self, campaign_id: i64) -> Result<Vec<NegativeKeyword>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, campaign_id, ad_group_id, keyword, match_type
             FROM negative_keywords WHERE campaign_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![campaign_id], |r| {
                let mt: String = r.get(5)?;
                Ok(NegativeKeyword {
                    id: r.get(0)?,
                    account_id: r.get(1)?,
                    campaign_id: r.get(2)?,
                    ad_group_id: r.get(3)?,
                    keyword: r.get(4)?,
                    match_type: MatchType::parse(&mt).unwrap_or(MatchType::Broad),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Dayparting
    // =========================================================================

    pub fn set_schedule_multiplier(
        &self,
        campaign_id: i64,
        hour_of_week: u32,
        multiplier: f64,
    ) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO dayparting_schedule (campaign_id, hour_of_week, multiplier)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(campaign_id, hour_of_week) DO UPDATE SET multiplier = ?3",
            params![campaign_id, hour_of_week, multiplier],
        )?;
        Ok(())
    }

    /// Intraday override for a single hour of a single day. The pacing
    /// controller is the only writer; `(campaign_id, date, hour)` keys
    /// make concurrent writes to different hours safe.
    pub fn set_hourly_override(
        &self,
        campaign_id: i64,
        date: NaiveDate,
        hour: u32,
        multiplier: f64,
        reason: &str,
    ) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO dayparting_overrides
               (campaign_id, date, hour, multiplier, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(campaign_id, date, hour)
             DO UPDATE SET multiplier = ?4, reason = ?5, created_at = ?6",
            params![
                campaign_id,
                date.format("%Y-%m-%d").to_string(),
                hour,
                multiplier,
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Effective dayparting multiplier for a campaign at `now`: the
    /// intraday override for the current hour wins over the weekly
    /// schedule; absent both, 1.0.
    pub fn current_dayparting_multiplier(
        &self,
        campaign_id: i64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let date = now.date_naive();
        let hour = now.hour();
        let conn = self.db.lock();

        let override_mult: Option<f64> = conn
            .query_row(
                "SELECT multiplier FROM dayparting_overrides
                 WHERE campaign_id = ?1 AND date = ?2 AND hour = ?3",
                params![campaign_id, date.format("%Y-%m-%d").to_string(), hour],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(m) = override_mult {
            return Ok(m);
        }

        let hour_of_week =
            now.date_naive().weekday().num_days_from_monday() * 24 + hour;
        let schedule_mult: Option<f64> = conn
            .query_row(
                "SELECT multiplier FROM dayparting_schedule
                 WHERE campaign_id = ?1 AND hour_of_week = ?2",
                params![campaign_id, hour_of_week],
                |r| r.get(0),
            )
            .optional()?;
        Ok(schedule_mult.unwrap_or(1.0))
    }
}

fn campaign_from_row(r: &Row<'_>) -> rusqlite::Result<Campaign> {
    let status: String = r.get(11)?;
    Ok(Campaign {
        id: r.get(0)?,
        account_id: r.get(1)?,
        name: r.get(2)?,
        daily_budget: r.get(3)?,
        placement_top_pct: r.get(4)?,
        placement_product_pct: r.get(5)?,
        placement_rest_pct: r.get(6)?,
        dayparting_enabled: r.get::<_, i64>(7)? != 0,
        performance_group_id: r.get(8)?,
        min_bid: r.get(9)?,
        max_bid: r.get(10)?,
        status: EntityStatus::parse(&status).unwrap_or(EntityStatus::Paused),
    })
}

fn target_from_row(r: &Row<'_>) -> rusqlite::Result<Target> {
    let target_type: String = r.get(4)?;
    let match_type: Option<String> = r.get(6)?;
    let status: String = r.get(8)?;
    Ok(Target {
        id: r.get(0)?,
        account_id: r.get(1)?,
        campaign_id: r.get(2)?,
        ad_group_id: r.get(3)?,
        target_type: TargetType::parse(&target_type).unwrap_or(TargetType::Keyword),
        expression: r.get(5)?,
        match_type: match_type.as_deref().and_then(MatchType::parse),
        bid: r.get(7)?,
        status: EntityStatus::parse(&status).unwrap_or(EntityStatus::Paused),
    })
}
