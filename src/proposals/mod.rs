//! Proposal sources
//!
//! Independent analyzers inspect a target's safe-window data and emit
//! `BidProposal`s. Sources never write bids; the coordinator fuses their
//! proposals into one final bid per target. Each source is a pure
//! function of its context, so a cycle's proposals all observe the same
//! pre-write bid snapshot.

pub mod bid_algo;
pub mod dayparting;
pub mod inventory;
pub mod organic_rank;
pub mod placement;

use crate::data_plane::AlgorithmRow;
use crate::decision_tree::Prediction;
use crate::market_curve::{MarketCurveModel, OptimalBidResult};
use crate::models::{AlgorithmParams, Campaign, SourceWeights, Target, TargetType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use bid_algo::BidAlgoSource;
pub use dayparting::DaypartingSource;
pub use inventory::InventorySource;
pub use organic_rank::OrganicRankSource;
pub use placement::PlacementSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    BaseAlgo,
    Dayparting,
    Placement,
    Inventory,
    OrganicRank,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::BaseAlgo => "base_algo",
            ProposalKind::Dayparting => "dayparting",
            ProposalKind::Placement => "placement",
            ProposalKind::Inventory => "inventory",
            ProposalKind::OrganicRank => "organic_rank",
        }
    }

    pub fn weight(&self, weights: &SourceWeights) -> f64 {
        match self {
            ProposalKind::BaseAlgo => weights.base_algo,
            ProposalKind::Dayparting => weights.dayparting,
            ProposalKind::Placement => weights.placement,
            ProposalKind::Inventory => weights.inventory,
            ProposalKind::OrganicRank => weights.organic_rank,
        }
    }
}

/// A single suggestion for one target. Carries either a multiplicative
/// suggestion (1.2 = +20%) or an absolute base bid, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidProposal {
    pub target_id: i64,
    pub target_type: TargetType,
    pub source: ProposalKind,
    pub suggested_multiplier: Option<f64>,
    pub suggested_base_bid: Option<f64>,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl BidProposal {
    pub fn multiplier(
        target: &Target,
        source: ProposalKind,
        multiplier: f64,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target.id,
            target_type: target.target_type,
            source,
            suggested_multiplier: Some(multiplier),
            suggested_base_bid: None,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn absolute(
        target: &Target,
        source: ProposalKind,
        bid: f64,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target.id,
            target_type: target.target_type,
            source,
            suggested_multiplier: None,
            suggested_base_bid: Some(bid),
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    /// Absolute distance from the current bid, used for conservatism
    /// tie-breaks.
    pub fn change_magnitude(&self, current_bid: f64) -> f64 {
        if let Some(bid) = self.suggested_base_bid {
            (bid - current_bid).abs()
        } else if let Some(m) = self.suggested_multiplier {
            (current_bid * m - current_bid).abs()
        } else {
            0.0
        }
    }
}

/// Hour-of-day aggregate over the safe window, input to the dayparting
/// analyzer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourlyPerformance {
    pub hour: u32,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
}

/// Stock level for the advertised product behind a target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InventoryStatus {
    pub units_available: i64,
    /// Projected days until stock-out at the current sales velocity.
    pub days_of_cover: f64,
}

/// Organic placement of the product for this keyword.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrganicRankStatus {
    pub rank: u32,
    pub page: u32,
}

/// Everything an analyzer may look at for one target. Assembled once per
/// coordination cycle.
pub struct ProposalContext<'a> {
    pub target: &'a Target,
    pub campaign: &'a Campaign,
    /// Safe-window daily rows for this target.
    pub rows: &'a [AlgorithmRow],
    pub hourly: &'a [HourlyPerformance],
    pub curve: Option<&'a MarketCurveModel>,
    pub optimal: Option<&'a OptimalBidResult>,
    pub cvr_prediction: Option<Prediction>,
    pub inventory: Option<InventoryStatus>,
    pub organic: Option<OrganicRankStatus>,
    pub current_hour: u32,
    pub params: &'a AlgorithmParams,
}

pub trait ProposalSource: Send + Sync {
    fn kind(&self) -> ProposalKind;
    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal>;
}

/// The default analyzer set, in coordinator weight order.
pub fn default_sources() -> Vec<Box<dyn ProposalSource>> {
    vec![
        Box::new(BidAlgoSource),
        Box::new(DaypartingSource),
        Box::new(PlacementSource),
        Box::new(InventorySource),
        Box::new(OrganicRankSource),
    ]
}
