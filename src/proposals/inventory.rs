//! Inventory analyzer
//!
//! Stock protection: a target selling down to empty shelves must not
//! keep buying clicks. This source carries the highest coordinator
//! weight because its suggestions encode hard constraints, not
//! preferences.

use super::{BidProposal, InventoryStatus, ProposalContext, ProposalKind, ProposalSource};

/// Below this cover the bid is cut hard.
const CRITICAL_DAYS_OF_COVER: f64 = 3.0;
/// Below this cover the bid is eased down.
const LOW_DAYS_OF_COVER: f64 = 7.0;

pub struct InventorySource;

impl ProposalSource for InventorySource {
    fn kind(&self) -> ProposalKind {
        ProposalKind::Inventory
    }

    fn analyze(&self, ctx: &ProposalContext<'_>) -> Vec<BidProposal> {
        let status: InventoryStatus = match ctx.inventory {
            Some(s) => s,
            None => return Vec::new(),
        };

        if status.units_available <= 0 {
            return vec![BidProposal::multiplier(
                ctx.target,
                ProposalKind::Inventory,
                0.3,
                1.0,
                "out of stock: protect remaining budget",
            )];
        }

        if status.days_of_cover < CRITICAL_DAYS_OF_COVER {
            return vec![BidProposal::multiplier(
                ctx.target,
                ProposalKind::Inventory,
                0.5,
                0.95,
                format!(
                    "{:.1} days of cover left ({} units)",
                    status.days_of_cover, status.units_available
                ),
            )];
        }

        if status.days_of_cover < LOW_DAYS_OF_COVER {
            return vec![BidProposal::multiplier(
                ctx.target,
                ProposalKind::Inventory,
                0.8,
                0.8,
                format!("low stock: {:.1} days of cover", status.days_of_cover),
            )];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::test_support::ContextFixture;

    fn with_inventory(units: i64, days: f64) -> Vec<BidProposal> {
        let fixture = ContextFixture::new();
        let mut ctx = fixture.context();
        ctx.inventory = Some(InventoryStatus {
            units_available: units,
            days_of_cover: days,
        });
        InventorySource.analyze(&ctx)
    }

    #[test]
    fn test_out_of_stock_cuts_hard_at_full_confidence() {
        let proposals = with_inventory(0, 0.0);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].suggested_multiplier, Some(0.3));
        assert_eq!(proposals[0].confidence, 1.0);
    }

    #[test]
    fn test_critical_cover_halves_bid() {
        let proposals = with_inventory(40, 2.0);
        assert_eq!(proposals[0].suggested_multiplier, Some(0.5));
    }

    #[test]
    fn test_low_cover_eases_down() {
        let proposals = with_inventory(200, 5.5);
        assert_eq!(proposals[0].suggested_multiplier, Some(0.8));
    }

    #[test]
    fn test_healthy_stock_is_silent() {
        assert!(with_inventory(5000, 45.0).is_empty());
    }

    #[test]
    fn test_no_inventory_data_is_silent() {
        let fixture = ContextFixture::new();
        assert!(InventorySource.analyze(&fixture.context()).is_empty());
    }
}
