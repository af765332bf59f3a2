//! Shared fixtures for unit and integration tests.

use crate::models::{
    Campaign, EntityKind, EntityStatus, MatchType, PerformanceSnapshot, SnapshotSource, Target,
    TargetType,
};
use chrono::{NaiveDate, Utc};

pub fn sample_campaign(account_id: i64, id: i64) -> Campaign {
    Campaign {
        id,
        account_id,
        name: format!("campaign-{}", id),
        daily_budget: 100.0,
        placement_top_pct: 50,
        placement_product_pct: 0,
        placement_rest_pct: 0,
        dayparting_enabled: true,
        performance_group_id: None,
        min_bid: 0.02,
        max_bid: 100.0,
        status: EntityStatus::Enabled,
    }
}

pub fn sample_target(account_id: i64, campaign_id: i64, id: i64, bid: f64) -> Target {
    Target {
        id,
        account_id,
        campaign_id,
        ad_group_id: campaign_id * 10,
        target_type: TargetType::Keyword,
        expression: format!("keyword {}", id),
        match_type: Some(MatchType::Exact),
        bid,
        status: EntityStatus::Enabled,
    }
}

pub fn snapshot_on(
    account_id: i64,
    entity_kind: EntityKind,
    entity_id: i64,
    date: NaiveDate,
    source: SnapshotSource,
    impressions: u64,
    clicks: u64,
    spend: f64,
    sales: f64,
    orders: u64,
) -> PerformanceSnapshot {
    PerformanceSnapshot {
        account_id,
        entity_kind,
        entity_id,
        date,
        impressions,
        clicks,
        spend,
        sales,
        orders,
        source,
        event_time: Utc::now(),
    }
}
