//! Organic-rank analyzer
//!
//! When the product already ranks on top of the first page organically,
//! paid clicks on the same keyword cannibalize free ones. The source
//! only ever suggests reductions; climbing via paid spend is the base
//! algorithm's job.

use super::{BidProposal, OrganicRankStatus, ProposalContext, ProposalKind, ProposalSource};

const STRONG_RANK: u32 = 5;
const TOP_PAGE: u32 = 1;

pub struct OrganicRankSource;

impl ProposalSource for OrganicRankSource {
    fn kind(&self) -> ProposalKind {
        ProposalKind::OrganicRank
    }

    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal> {
        let organic: OrganicRankStatus = match ctx.organic {
            Some(o) => o,
            None => return Vec::new(),
        };

        if organic.page != TOP_PAGE {
            return Vec::new();
        }

        if organic.rank <= STRONG_RANK {
            let multiplier = if organic.rank <= 2 { 0.75 } else { 0.85 };
            return vec![BidProposal::multiplier(
                ctx.target,
                ProposalKind::OrganicRank,
                multiplier,
                0.7,
                format!("organic rank {} on page 1", organic.rank),
            )];
        }

        Vec::new()
    }
}
