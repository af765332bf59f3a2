//! Placement analyzer
//!
//! Reads the target's safe-window efficiency against its break-even
//! ACoS and suggests a modest tilt. Placement percentages already
//! amplify the base bid at auction time, so campaigns running heavy
//! top-of-search uplift get a dampened suggestion.

use super::{BidProposal, ProposalContext, ProposalKind, ProposalSource};

const MIN_CLICKS: u64 = 50;
const TILT_UP: f64 = 1.15;
const TILT_DOWN: f64 = 0.85;

pub struct PlacementSource;

impl ProposalSource for PlacementSource {
    fn kind(&self) -> ProposalKind {
        ProposalKind::Placement
    }

    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal> {
        let clicks: u64 = ctx.rows.iter().map(|r| r.clicks).sum();
        let spend: f64 = ctx.rows.iter().map(|r| r.spend).sum();
        let sales: f64 = ctx.rows.iter().map(|r| r.sales).sum();
        if clicks < MIN_CLICKS || spend <= 0.0 {
            return Vec::new();
        }

        let acos = if sales > 0.0 { spend / sales * 100.0 } else { 100.0 };
        // Break-even ACoS is the margin share of revenue.
        let break_even_acos = ctx.params.margin() * 100.0;

        let placement_pct = ctx.campaign.max_placement_pct() as f64;
        // High uplift means every base-bid point hits the auction harder;
        // damp the tilt accordingly.
        let damping = 1.0 / (1.0 + placement_pct / 100.0);

        let (raw, direction) = if acos <= break_even_acos * 0.6 {
            (TILT_UP, "efficient")
        } else if acos >= break_even_acos * 1.2 {
            (TILT_DOWN, "inefficient")
        } else {
            return Vec::new();
        };
        let multiplier = 1.0 + (raw - 1.0) * damping;

        let confidence = (0.4 + (clicks as f64 / 500.0).min(0.3)).clamp(0.0, 0.7);
        vec![BidProposal::multiplier(
            ctx.target,
            ProposalKind::Placement,
            multiplier,
            confidence,
            format!(
                "{} at placement uplift {}%: ACoS {:.1}% vs break-even {:.1}%",
                direction, placement_pct, acos, break_even_acos
            ),
        )]
    }
}
