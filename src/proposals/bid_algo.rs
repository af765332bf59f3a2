//! Base bid analyzer
//!
//! Turns the fitted market curve's profit-maximizing bid into an
//! absolute proposal. Without a usable curve it falls back to the
//! decision-tree CVR prediction and steers toward the implied
//! break-even CPC at reduced confidence.

use super::{BidProposal, ProposalContext, ProposalKind, ProposalSource};
use crate::models::round_to_cents;

/// Ignore optimal bids within this relative distance of the current bid.
const MIN_RELATIVE_CHANGE: f64 = 0.02;

pub struct BidAlgoSource;

impl ProposalSource for BidAlgoSource {
    fn kind(&self) -> ProposalKind {
        ProposalKind::BaseAlgo
    }

    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal> {
        let current = ctx.target.bid;

        if let Some(optimal) = ctx.optimal {
            if current > 0.0
                && (optimal.optimal_bid - current).abs() / current >= MIN_RELATIVE_CHANGE
            {
                let r_squared = ctx
                    .curve
                    .and_then(|c| c.impression.r_squared())
                    .unwrap_or(0.5);
                // Confidence tracks fit quality; a piecewise fallback fit
                // still earns a usable midpoint.
                let confidence = (0.5 + 0.4 * r_squared).clamp(0.0, 0.9);
                return vec![BidProposal::absolute(
                    ctx.target,
                    ProposalKind::BaseAlgo,
                    optimal.optimal_bid,
                    confidence,
                    format!(
                        "profit-maximizing bid {:.2} (expected profit {:.2}, break-even CPC {:.2})",
                        optimal.optimal_bid, optimal.max_profit, optimal.break_even_cpc
                    ),
                )];
            }
            return Vec::new();
        }

        // No curve: steer toward break-even CPC implied by the predicted
        // conversion rate.
        if let Some(prediction) = ctx.cvr_prediction {
            let orders: u64 = ctx.rows.iter().map(|r| r.orders).sum();
            let sales: f64 = ctx.rows.iter().map(|r| r.sales).sum();
            if orders == 0 || prediction.value <= 0.0 {
                return Vec::new();
            }
            let aov = sales / orders as f64;
            let break_even = round_to_cents(prediction.value * aov * ctx.params.margin());
            if current <= 0.0 || break_even <= 0.0 {
                return Vec::new();
            }
            let raw = break_even / current;
            // Move at most 20% per cycle on a prediction alone.
            let multiplier = raw.clamp(0.8, 1.2);
            if (multiplier - 1.0).abs() < MIN_RELATIVE_CHANGE {
                return Vec::new();
            }
            let confidence = if prediction.low_confidence { 0.25 } else { 0.45 };
            return vec![BidProposal::multiplier(
                ctx.target,
                ProposalKind::BaseAlgo,
                multiplier,
                confidence,
                format!(
                    "predicted CVR {:.3} implies break-even CPC {:.2}",
                    prediction.value, break_even
                ),
            )];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_tree::Prediction;
    use crate::market_curve::OptimalBidResult;
    use crate::proposals::test_support::ContextFixture;

    #[test]
    fn test_optimal_bid_becomes_absolute_proposal() {
        let fixture = ContextFixture::new();
        let optimal = OptimalBidResult {
            optimal_bid: 1.45,
            max_profit: 12.0,
            break_even_cpc: 2.1,
            profit_margin: 0.7,
        };
        let mut ctx = fixture.context();
        ctx.optimal = Some(&optimal);

        let proposals = BidAlgoSource.analyze(&ctx);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].suggested_base_bid, Some(1.45));
        assert!(proposals[0].suggested_multiplier.is_none());
        assert!(proposals[0].confidence > 0.0);
    }

    #[test]
    fn test_near_identical_optimal_is_skipped() {
        let fixture = ContextFixture::new();
        let optimal = OptimalBidResult {
            optimal_bid: 1.01, // within 2% of the current 1.00
            max_profit: 1.0,
            break_even_cpc: 2.0,
            profit_margin: 0.7,
        };
        let mut ctx = fixture.context();
        ctx.optimal = Some(&optimal);
        assert!(BidAlgoSource.analyze(&ctx).is_empty());
    }

    #[test]
    fn test_prediction_fallback_is_capped_and_low_confidence() {
        let mut fixture = ContextFixture::new();
        fixture.rows = vec![crate::data_plane::AlgorithmRow {
            date: chrono::Utc::now().date_naive(),
            impressions: 1000,
            clicks: 100,
            spend: 50.0,
            sales: 300.0,
            orders: 10,
            cvr: 0.1,
            roas: 6.0,
            acos: 16.7,
        }];
        let mut ctx = fixture.context();
        ctx.cvr_prediction = Some(Prediction {
            value: 0.2,
            low_confidence: true,
        });

        let proposals = BidAlgoSource.analyze(&ctx);
        assert_eq!(proposals.len(), 1);
        let m = proposals[0].suggested_multiplier.unwrap();
        // break-even = 0.2 · 30 · 0.7 = 4.2 against bid 1.0; capped at 1.2.
        assert!((m - 1.2).abs() < 1e-9);
        assert_eq!(proposals[0].confidence, 0.25);
    }

    #[test]
    fn test_no_signal_no_proposal() {
        let fixture = ContextFixture::new();
        assert!(BidAlgoSource.analyze(&fixture.context()).is_empty());
    }
}
