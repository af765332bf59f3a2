//! Intraday pacing controller
//!
//! A budget-runway loop that compares spend-so-far against an ideal
//! intraday curve and throttles via temporary hourly multipliers. The
//! controller reads only the guard channel (spend, clicks, impressions;
//! conversion metrics are untrusted intraday by contract) and writes
//! only the hourly-multiplier override table. Base bids are never
//! touched from here.

use crate::data_plane::DataPlane;
use crate::models::{AlgorithmParams, Campaign, EntityStatus};
use crate::store::EntityStore;
use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const START_HOUR: u32 = 0;
const TARGET_END_HOUR: u32 = 22;
/// The ideal curve has hour resolution; thresholds tolerate the
/// quantization.
const RATIO_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingStatus {
    OnTrack,
    Underspending,
    Overspending,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingAction {
    None,
    ReduceBid,
    IncreaseBid,
    Pause,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ClickFraud,
    BudgetDrain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub kind: AnomalyKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingCheck {
    pub campaign_id: i64,
    pub status: PacingStatus,
    pub ideal_spend_pct: f64,
    pub actual_spend_pct: f64,
    pub pacing_ratio: f64,
    pub suggested_action: PacingAction,
    pub suggested_multiplier: Option<f64>,
    pub anomalies: Vec<AnomalyFinding>,
    pub data_stale: bool,
}

/// A throttle decision scoped to one campaign and one hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntradayAdjustment {
    pub campaign_id: i64,
    pub hour: u32,
    pub multiplier: f64,
    pub reason: String,
}

pub struct PacingController {
    data_plane: Arc<DataPlane>,
    entities: EntityStore,
    params: AlgorithmParams,
}

impl PacingController {
    pub fn new(data_plane: Arc<DataPlane>, entities: EntityStore, params: AlgorithmParams) -> Self {
        Self {
            data_plane,
            entities,
            params,
        }
    }

    pub fn check_campaign(&self, campaign: &Campaign) -> Result<PacingCheck> {
        self.check_campaign_at(campaign, Utc::now())
    }

    pub fn check_campaign_at(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<PacingCheck> {
        let guard =
            self.data_plane
                .realtime_spend_for_guard_at(campaign.account_id, Some(campaign.id), now)?;

        let hour = now.hour();
        let elapsed = hour.saturating_sub(START_HOUR);
        let ideal_spend_pct =
            (elapsed as f64 / (TARGET_END_HOUR - START_HOUR) as f64).clamp(0.0, 1.0);
        let actual_spend_pct = if campaign.daily_budget > 0.0 {
            guard.spend / campaign.daily_budget
        } else {
            0.0
        };

        let pacing_ratio = if ideal_spend_pct > 0.0 {
            actual_spend_pct / ideal_spend_pct
        } else {
            0.0
        };

        let (status, suggested_action, suggested_multiplier) = if ideal_spend_pct <= 0.0 {
            // Day has not started against the curve yet.
            (PacingStatus::OnTrack, PacingAction::None, None)
        } else if pacing_ratio >= self.params.pacing_critical_ratio - RATIO_TOLERANCE {
            (PacingStatus::Critical, PacingAction::ReduceBid, Some(0.5))
        } else if pacing_ratio >= self.params.pacing_overspend_ratio - RATIO_TOLERANCE {
            (PacingStatus::Overspending, PacingAction::ReduceBid, Some(0.8))
        } else if pacing_ratio <= self.params.pacing_underspend_ratio {
            (PacingStatus::Underspending, PacingAction::IncreaseBid, Some(1.2))
        } else {
            (PacingStatus::OnTrack, PacingAction::None, None)
        };

        let anomalies = self.detect_anomalies(guard.clicks, guard.impressions, guard.spend, hour);
        // Click-fraud overrides the pacing ladder; budget drain only
        // alerts.
        let (suggested_action, suggested_multiplier) = if anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::ClickFraud)
        {
            (PacingAction::Pause, None)
        } else if anomalies.iter().any(|a| a.kind == AnomalyKind::BudgetDrain)
            && suggested_action == PacingAction::None
        {
            (PacingAction::Alert, None)
        } else {
            (suggested_action, suggested_multiplier)
        };

        if status == PacingStatus::Critical {
            warn!(
                campaign_id = campaign.id,
                pacing_ratio, "campaign pacing critical"
            );
        }

        Ok(PacingCheck {
            campaign_id: campaign.id,
            status,
            ideal_spend_pct,
            actual_spend_pct,
            pacing_ratio,
            suggested_action,
            suggested_multiplier,
            anomalies,
            data_stale: guard.stale,
        })
    }

    fn detect_anomalies(
        &self,
        clicks: u64,
        impressions: u64,
        spend: f64,
        hour: u32,
    ) -> Vec<AnomalyFinding> {
        let mut findings = Vec::new();
        let hours_elapsed = hour.max(1) as f64;
        let clicks_per_hour = clicks as f64 / hours_elapsed;
        if clicks_per_hour > self.params.anomaly_clicks_per_hour as f64 {
            findings.push(AnomalyFinding {
                kind: AnomalyKind::ClickFraud,
                detail: format!("{:.0} clicks/hour", clicks_per_hour),
            });
        }
        if impressions > 0 {
            let ctr_pct = clicks as f64 / impressions as f64 * 100.0;
            if ctr_pct > self.params.anomaly_ctr_pct {
                findings.push(AnomalyFinding {
                    kind: AnomalyKind::ClickFraud,
                    detail: format!("CTR {:.1}%", ctr_pct),
                });
            }
        }
        if clicks > self.params.anomaly_drain_clicks {
            let cpc = spend / clicks as f64;
            if cpc > self.params.anomaly_drain_cpc {
                findings.push(AnomalyFinding {
                    kind: AnomalyKind::BudgetDrain,
                    detail: format!("CPC {:.2} over {} clicks", cpc, clicks),
                });
            }
        }
        findings
    }

    /// Turn a check into an hourly override for the current hour only.
    pub fn adjustment_for(&self, check: &PacingCheck, now: DateTime<Utc>) -> Option<IntradayAdjustment> {
        let multiplier = check.suggested_multiplier?;
        Some(IntradayAdjustment {
            campaign_id: check.campaign_id,
            hour: now.hour(),
            multiplier,
            reason: format!(
                "pacing {:?}: ratio {:.2} at hour {}",
                check.status,
                check.pacing_ratio,
                now.hour()
            ),
        })
    }

    /// Write the override row for `(campaign, today, hour)`.
    pub fn apply_adjustment(&self, adjustment: &IntradayAdjustment, now: DateTime<Utc>) -> Result<()> {
        self.entities.set_hourly_override(
            adjustment.campaign_id,
            now.date_naive(),
            adjustment.hour,
            adjustment.multiplier,
            &adjustment.reason,
        )?;
        info!(
            campaign_id = adjustment.campaign_id,
            hour = adjustment.hour,
            multiplier = adjustment.multiplier,
            "hourly multiplier override applied"
        );
        Ok(())
    }

    /// One pass over every enabled campaign of an account.
    pub fn check_all_campaigns(&self, account_id: i64) -> Result<Vec<PacingCheck>> {
        let now = Utc::now();
        let mut checks = Vec::new();
        for campaign in self.entities.list_enabled_campaigns(account_id)? {
            if campaign.status != EntityStatus::Enabled {
                continue;
            }
            match self.check_campaign_at(&campaign, now) {
                Ok(check) => {
                    if let Some(adjustment) = self.adjustment_for(&check, now) {
                        self.apply_adjustment(&adjustment, now)?;
                    }
                    checks.push(check);
                }
                Err(e) => {
                    // One campaign's failure must not stall the account.
                    warn!(campaign_id = campaign.id, error = %e, "pacing check failed");
                }
            }
        }
        Ok(checks)
    }

    pub fn critical_campaigns(&self, account_id: i64) -> Result<Vec<PacingCheck>> {
        Ok(self
            .check_all_campaigns(account_id)?
            .into_iter()
            .filter(|c| c.status == PacingStatus::Critical)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, SnapshotSource};
    use crate::store::{Database, SnapshotStore};
    use crate::testutil::{sample_campaign, snapshot_on};
    use chrono::TimeZone;

    struct Fixture {
        controller: PacingController,
        entities: EntityStore,
        data_plane: Arc<DataPlane>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let entities = EntityStore::new(db.clone());
        let data_plane = Arc::new(DataPlane::new(
            SnapshotStore::new(db),
            AlgorithmParams::default(),
        ));
        let controller = PacingController::new(
            data_plane.clone(),
            entities.clone(),
            AlgorithmParams::default(),
        );
        Fixture {
            controller,
            entities,
            data_plane,
        }
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, 30, 0).unwrap()
    }

    fn seed_today(f: &Fixture, now: DateTime<Utc>, clicks: u64, impressions: u64, spend: f64) {
        let mut snap = snapshot_on(
            1,
            EntityKind::Campaign,
            10,
            now.date_naive(),
            SnapshotSource::Stream,
            impressions,
            clicks,
            spend,
            0.0,
            0,
        );
        snap.event_time = now;
        f.data_plane.snapshots().insert(&snap).unwrap();
    }

    #[test]
    fn test_critical_at_ninety_spent_by_hour_ten() {
        let f = fixture();
        let campaign = sample_campaign(1, 10);
        f.entities.upsert_campaign(&campaign).unwrap();
        let now = at_hour(10);
        seed_today(&f, now, 45, 9000, 90.0);

        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        assert_eq!(check.status, PacingStatus::Critical);
        assert_eq!(check.suggested_action, PacingAction::ReduceBid);
        assert_eq!(check.suggested_multiplier, Some(0.5));
        assert!((check.ideal_spend_pct - 10.0 / 22.0).abs() < 1e-9);
        assert!((check.actual_spend_pct - 0.9).abs() < 1e-9);
        assert!(check.pacing_ratio > 1.9);
    }

    #[test]
    fn test_underspending_gets_boost() {
        let f = fixture();
        let campaign = sample_campaign(1, 10);
        f.entities.upsert_campaign(&campaign).unwrap();
        let now = at_hour(12);
        seed_today(&f, now, 10, 4000, 20.0); // 20% spent at 55% of the day

        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        assert_eq!(check.status, PacingStatus::Underspending);
        assert_eq!(check.suggested_multiplier, Some(1.2));
    }

    #[test]
    fn test_on_track_no_action() {
        let f = fixture();
        let campaign = sample_campaign(1, 10);
        f.entities.upsert_campaign(&campaign).unwrap();
        let now = at_hour(11);
        seed_today(&f, now, 20, 8000, 50.0); // 50% spent at 50% of the day

        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        assert_eq!(check.status, PacingStatus::OnTrack);
        assert_eq!(check.suggested_action, PacingAction::None);
        assert!(check.suggested_multiplier.is_none());
    }

    #[test]
    fn test_click_fraud_pauses() {
        let f = fixture();
        let campaign = sample_campaign(1, 10);
        f.entities.upsert_campaign(&campaign).unwrap();
        let now = at_hour(5);
        // 600 clicks in 5 hours = 120/hour.
        seed_today(&f, now, 600, 10_000, 40.0);

        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        assert_eq!(check.suggested_action, PacingAction::Pause);
        assert!(check
            .anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::ClickFraud));
    }

    #[test]
    fn test_budget_drain_alerts_without_pause() {
        let f = fixture();
        let mut campaign = sample_campaign(1, 10);
        campaign.daily_budget = 400.0;
        f.entities.upsert_campaign(&campaign).unwrap();
        let now = at_hour(11);
        // 60 clicks at $3.33 each; CTR and clicks/hour stay sane, and
        // 50% of budget at 50% of day keeps pacing on track.
        seed_today(&f, now, 60, 6000, 200.0);

        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        assert_eq!(check.suggested_action, PacingAction::Alert);
        assert!(check
            .anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::BudgetDrain));
        assert!(check.suggested_multiplier.is_none());
    }

    #[test]
    fn test_adjustment_writes_override_not_base_bids() {
        let f = fixture();
        let campaign = sample_campaign(1, 10);
        f.entities.upsert_campaign(&campaign).unwrap();
        let target = crate::testutil::sample_target(1, 10, 42, 1.0);
        f.entities.upsert_target(&target).unwrap();

        let now = at_hour(10);
        seed_today(&f, now, 45, 9000, 90.0);
        let check = f.controller.check_campaign_at(&campaign, now).unwrap();
        let adjustment = f.controller.adjustment_for(&check, now).unwrap();
        assert_eq!(adjustment.hour, 10);
        f.controller.apply_adjustment(&adjustment, now).unwrap();

        // Override landed for the current hour.
        assert_eq!(
            f.entities.current_dayparting_multiplier(10, now).unwrap(),
            0.5
        );
        // A different hour is untouched.
        assert_eq!(
            f.entities
                .current_dayparting_multiplier(10, at_hour(15))
                .unwrap(),
            1.0
        );
        // Base bid unchanged.
        assert_eq!(f.entities.get_target(42).unwrap().unwrap().bid, 1.0);
    }
}
