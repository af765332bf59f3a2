//! Dayparting analyzer
//!
//! Compares the current hour's historical efficiency against the
//! target's all-hours baseline and suggests a multiplicative tilt.
//! Hours with too few clicks stay silent.

use super::{BidProposal, HourlyPerformance, ProposalContext, ProposalKind, ProposalSource};

const MIN_HOUR_CLICKS: u64 = 20;
const MIN_TOTAL_CLICKS: u64 = 100;
/// Tilt bounds per cycle.
const MAX_UP: f64 = 1.25;
const MAX_DOWN: f64 = 0.75;

pub struct DaypartingSource;

impl DaypartingSource {
    fn roas(spend: f64, sales: f64) -> Option<f64> {
        if spend > 0.0 {
            Some(sales / spend)
        } else {
            None
        }
    }
}

impl ProposalSource for DaypartingSource {
    fn kind(&self) -> ProposalKind {
        ProposalKind::Dayparting
    }

    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal> {
        if !ctx.campaign.dayparting_enabled {
            return Vec::new();
        }

        let total_clicks: u64 = ctx.hourly.iter().map(|h| h.clicks).sum();
        let total_spend: f64 = ctx.hourly.iter().map(|h| h.spend).sum();
        let total_sales: f64 = ctx.hourly.iter().map(|h| h.sales).sum();
        if total_clicks < MIN_TOTAL_CLICKS {
            return Vec::new();
        }

        let hour: &HourlyPerformance = match ctx.hourly.iter().find(|h| h.hour == ctx.current_hour)
        {
            Some(h) if h.clicks >= MIN_HOUR_CLICKS => h,
            _ => return Vec::new(),
        };

        let baseline = match Self::roas(total_spend, total_sales) {
            Some(r) if r > 0.0 => r,
            _ => return Vec::new(),
        };
        let hour_roas = match Self::roas(hour.spend, hour.sales) {
            Some(r) => r,
            None => return Vec::new(),
        };

        let ratio = hour_roas / baseline;
        let multiplier = ratio.sqrt().clamp(MAX_DOWN, MAX_UP);
        if (multiplier - 1.0).abs() < 0.05 {
            return Vec::new();
        }

        // Confidence grows with the hour's share of total evidence.
        let confidence = (0.5 + 0.5 * (hour.clicks as f64 / total_clicks as f64).min(0.5))
            .clamp(0.0, 0.85);
        vec![BidProposal::multiplier(
            ctx.target,
            ProposalKind::Dayparting,
            multiplier,
            confidence,
            format!(
                "hour {} ROAS {:.2} vs baseline {:.2}",
                ctx.current_hour, hour_roas, baseline
            ),
        )]
    }
}
