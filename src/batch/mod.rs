//! Batch operation machine
//!
//! Every write to the ad platform flows through a batch: proposed
//! changes are staged as reviewable items, approved, executed with
//! per-item isolation, and reversible while their rollback snapshots
//! remain valid.
//!
//! ```text
//! pending ──approve──▶ approved ──execute──▶ executing ──┬─▶ completed
//!    │                    │                              └─▶ failed
//!    └───cancel───────────┴───▶ cancelled
//!                                    completed ──rollback──▶ rolled_back
//! ```

pub mod executor;
pub mod validation;

use crate::models::{EntityStatus, MatchType, TargetType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use executor::BatchExecutor;
pub use validation::{estimate_execution_time, validate_items};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Approved => "approved",
            BatchStatus::Executing => "executing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "approved" => Some(BatchStatus::Approved),
            "executing" => Some(BatchStatus::Executing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            "rolled_back" => Some(BatchStatus::RolledBack),
            _ => None,
        }
    }

    /// Legal state-machine edges. Everything else is a conflict.
    pub fn can_transition(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Cancelled)
                | (Approved, Executing)
                | (Approved, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Completed, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        use BatchStatus::*;
        matches!(self, Failed | Cancelled | RolledBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Skipped,
    RolledBack,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "success" => Some(ItemStatus::Success),
            "failed" => Some(ItemStatus::Failed),
            "skipped" => Some(ItemStatus::Skipped),
            "rolled_back" => Some(ItemStatus::RolledBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    NegativeKeyword,
    BidAdjustment,
    KeywordMigration,
    CampaignStatus,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::NegativeKeyword => "negative_keyword",
            OperationType::BidAdjustment => "bid_adjustment",
            OperationType::KeywordMigration => "keyword_migration",
            OperationType::CampaignStatus => "campaign_status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "negative_keyword" => Some(OperationType::NegativeKeyword),
            "bid_adjustment" => Some(OperationType::BidAdjustment),
            "keyword_migration" => Some(OperationType::KeywordMigration),
            "campaign_status" => Some(OperationType::CampaignStatus),
            _ => None,
        }
    }
}

/// Where a batch came from; drives the history source tag on applied
/// bid changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSourceType {
    Manual,
    Optimization,
    GroupOptimization,
    ScheduledTask,
    Rollback,
}

impl BatchSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchSourceType::Manual => "manual",
            BatchSourceType::Optimization => "optimization",
            BatchSourceType::GroupOptimization => "group_optimization",
            BatchSourceType::ScheduledTask => "scheduled_task",
            BatchSourceType::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(BatchSourceType::Manual),
            "optimization" => Some(BatchSourceType::Optimization),
            "group_optimization" => Some(BatchSourceType::GroupOptimization),
            "scheduled_task" => Some(BatchSourceType::ScheduledTask),
            "rollback" => Some(BatchSourceType::Rollback),
            _ => None,
        }
    }
}

/// One atomic unit of work inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ItemPayload {
    NegativeKeyword {
        campaign_id: i64,
        ad_group_id: Option<i64>,
        keyword: String,
        match_type: MatchType,
    },
    BidAdjustment {
        target_id: i64,
        target_type: TargetType,
        new_bid: f64,
        /// Coordination audit row this bid came out of, if any.
        coordination_id: Option<i64>,
        expected_profit_delta: Option<f64>,
    },
    KeywordMigration {
        source_target_id: i64,
        dest_campaign_id: i64,
        dest_ad_group_id: i64,
        keyword: String,
        match_type: MatchType,
        bid: f64,
    },
    CampaignStatus {
        campaign_id: i64,
        status: EntityStatus,
    },
}

impl ItemPayload {
    pub fn operation_type(&self) -> OperationType {
        match self {
            ItemPayload::NegativeKeyword { .. } => OperationType::NegativeKeyword,
            ItemPayload::BidAdjustment { .. } => OperationType::BidAdjustment,
            ItemPayload::KeywordMigration { .. } => OperationType::KeywordMigration,
            ItemPayload::CampaignStatus { .. } => OperationType::CampaignStatus,
        }
    }

    /// Entity the item touches, `(kind, id)` for bookkeeping.
    pub fn entity(&self) -> (&'static str, i64) {
        match self {
            ItemPayload::NegativeKeyword { campaign_id, .. } => ("campaign", *campaign_id),
            ItemPayload::BidAdjustment { target_id, .. } => ("target", *target_id),
            ItemPayload::KeywordMigration { source_target_id, .. } => ("target", *source_target_id),
            ItemPayload::CampaignStatus { campaign_id, .. } => ("campaign", *campaign_id),
        }
    }
}

/// Opaque-at-the-edge blob sufficient to reverse an executed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackSnapshot {
    RemoveNegative {
        campaign_id: i64,
        keyword: String,
        match_type: MatchType,
    },
    RestoreBid {
        target_id: i64,
        original_bid: f64,
    },
    UndoMigration {
        created_target_id: i64,
        source_campaign_id: i64,
        keyword: String,
        match_type: MatchType,
    },
    RestoreStatus {
        campaign_id: i64,
        previous: EntityStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: String,
    pub account_id: Option<i64>,
    pub owner: String,
    pub operation_type: OperationType,
    pub name: String,
    pub description: String,
    pub requires_approval: bool,
    pub source_type: BatchSourceType,
    pub source_task_id: Option<String>,
    pub status: BatchStatus,
    pub total_items: u32,
    pub success_items: u32,
    pub failed_items: u32,
    pub skipped_items: u32,
    pub executed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    /// Rollback is legal only from `completed`, within the window, and
    /// only when at least one executed item kept a valid snapshot.
    pub fn can_rollback(&self, window_days: i64, now: DateTime<Utc>, items: &[BatchItem]) -> bool {
        if self.status != BatchStatus::Completed {
            return false;
        }
        let finished = match self.finished_at {
            Some(t) => t,
            None => return false,
        };
        if now - finished > chrono::Duration::days(window_days) {
            return false;
        }
        items
            .iter()
            .any(|i| i.status == ItemStatus::Success && i.rollback.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: i64,
    pub batch_id: String,
    pub seq: u32,
    pub payload: ItemPayload,
    pub rollback: Option<RollbackSnapshot>,
    pub status: ItemStatus,
    pub error_message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}
