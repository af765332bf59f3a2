//! Central bid coordinator
//!
//! Fuses proposals from every source into a single final bid per
//! target, under a hard theoretical-CPC cap. Placement and dayparting
//! multipliers amplify whatever base bid is written, so the breaker
//! reasons about the worst-case per-click cost, not the base bid alone.
//!
//! Per target, bid writes are totally ordered: `apply` holds an
//! exclusive `(account, target)` lock from the pre-write read until the
//! adjustment record is durable.

use crate::models::{round_to_cents, AlgorithmParams, Campaign, Target};
use crate::proposals::{BidProposal, ProposalKind};
use crate::store::history::{AdjustmentSource, HistoryStore, KpiBaseline, NewAdjustment};
use crate::store::EntityStore;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub target_id: i64,
    pub original_bid: f64,
    pub final_bid: f64,
    pub theoretical_max_cpc: f64,
    pub effective_multiplier: f64,
    pub proposals: Vec<BidProposal>,
    pub circuit_breaker_tripped: bool,
    pub reason: String,
    pub warnings: Vec<String>,
    /// Audit row id once persisted.
    pub coordination_id: Option<i64>,
}

/// Outcome of an apply attempt; `applied = false` carries the skip
/// reason (cooldown, daily cap, below-change threshold).
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub result: CoordinationResult,
    pub applied: bool,
    pub skip_reason: Option<String>,
    pub adjustment_id: Option<i64>,
}

/// Inputs the coordinator reasons over for one target.
#[derive(Debug, Clone)]
pub struct CoordinationInput<'a> {
    pub campaign: &'a Campaign,
    pub target: &'a Target,
    pub proposals: Vec<BidProposal>,
    pub current_base_bid: f64,
    /// Integer percent, the external placement convention.
    pub current_placement_pct: i64,
    pub current_dayparting_multiplier: f64,
}

pub struct BidCoordinator {
    params: AlgorithmParams,
    entities: EntityStore,
    history: HistoryStore,
    write_locks: Mutex<HashMap<(i64, i64), Arc<Mutex<()>>>>,
}

impl BidCoordinator {
    pub fn new(params: AlgorithmParams, entities: EntityStore, history: HistoryStore) -> Self {
        Self {
            params,
            entities,
            history,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn target_lock(&self, account_id: i64, target_id: i64) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .entry((account_id, target_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Pure fusion step: same inputs always yield the same final bid.
    pub fn coordinate(&self, input: &CoordinationInput<'_>) -> CoordinationResult {
        let current = input.current_base_bid;
        let mut warnings = Vec::new();

        // One representative per source: highest confidence wins, ties go
        // to the smaller change (conservatism).
        let representatives = select_representatives(&input.proposals, current);

        // Absolute proposals average across sources, weighted by source
        // weight and confidence; multiplicative proposals stack.
        let mut absolute_weight = 0.0;
        let mut absolute_sum = 0.0;
        let mut multiplier = 1.0;
        let mut reasons = Vec::new();
        for p in &representatives {
            let weight = p.source.weight(&self.params.weights);
            if let Some(bid) = p.suggested_base_bid {
                let w = weight * p.confidence;
                absolute_sum += bid * w;
                absolute_weight += w;
            } else if let Some(m) = p.suggested_multiplier {
                multiplier *= 1.0 + (m - 1.0) * weight * p.confidence;
            }
            reasons.push(format!("{}: {}", p.source.as_str(), p.reason));
        }

        let base = if absolute_weight > 0.0 {
            absolute_sum / absolute_weight
        } else {
            current
        };
        let mut new_bid = base * multiplier;

        let stack = multiplier_stack(
            input.current_dayparting_multiplier,
            input.current_placement_pct,
        );
        let mut theoretical_cpc = new_bid * stack;
        let mut tripped = false;

        // Hard cap: solve for the largest base bid the stack allows, and
        // never let a trip raise the bid beyond its ceiling multiple.
        if theoretical_cpc > self.params.max_allowed_cpc {
            tripped = true;
            let safe_bid = self.params.max_allowed_cpc / stack;
            let ceiling = current * self.params.circuit_breaker_multiplier;
            let capped = safe_bid.min(ceiling);
            warnings.push(format!(
                "[circuit-breaker] theoretical CPC {:.2} exceeds cap {:.2}; base bid {:.2} -> {:.2}",
                theoretical_cpc, self.params.max_allowed_cpc, new_bid, capped
            ));
            new_bid = capped;
            theoretical_cpc = new_bid * stack;
        } else if theoretical_cpc > self.params.cpc_warning_threshold {
            warnings.push(format!(
                "theoretical CPC {:.2} above warning threshold {:.2}",
                theoretical_cpc, self.params.cpc_warning_threshold
            ));
        }

        if stack > self.params.max_total_multiplier {
            warnings.push(format!(
                "combined multiplier stack {:.2} exceeds {:.2}",
                stack, self.params.max_total_multiplier
            ));
        }

        let final_bid = round_to_cents(new_bid.clamp(self.params.min_bid, self.params.max_bid));
        let theoretical_max_cpc = round_to_cents(final_bid * stack);
        let effective_multiplier = if current > 0.0 { final_bid / current } else { 1.0 };

        CoordinationResult {
            target_id: input.target.id,
            original_bid: current,
            final_bid,
            theoretical_max_cpc,
            effective_multiplier,
            proposals: input.proposals.clone(),
            circuit_breaker_tripped: tripped,
            reason: if reasons.is_empty() {
                "no proposals; recheck against CPC cap".to_string()
            } else {
                reasons.join("; ")
            },
            warnings,
            coordination_id: None,
        }
    }

    /// Coordinate and write: lock the target, re-read its bid, fuse,
    /// persist the bid, the audit row and the history record.
    pub fn apply(
        &self,
        input: &CoordinationInput<'_>,
        baseline: Option<KpiBaseline>,
        expected_profit_delta: Option<f64>,
        applied_by: &str,
    ) -> Result<ApplyOutcome> {
        let lock = self.target_lock(input.target.account_id, input.target.id);
        let _guard = lock.lock();

        // Pre-write snapshot under the lock; a concurrent cycle may have
        // moved the bid since the caller assembled its input.
        let live = self
            .entities
            .get_target(input.target.id)?
            .with_context(|| format!("target {} does not exist", input.target.id))?;
        let mut locked_input = input.clone();
        locked_input.current_base_bid = live.bid;

        let mut result = self.coordinate(&locked_input);

        if let Some(reason) = self.skip_reason(&live, &result)? {
            return Ok(ApplyOutcome {
                result,
                applied: false,
                skip_reason: Some(reason),
                adjustment_id: None,
            });
        }

        let coordination_id = self.history.log_coordination(
            live.account_id,
            input.campaign.id,
            live.id,
            result.original_bid,
            result.final_bid,
            result.theoretical_max_cpc,
            result.effective_multiplier,
            result.circuit_breaker_tripped,
            &result.reason,
            &serde_json::to_string(&result.warnings)?,
            &serde_json::to_string(&result.proposals)?,
        )?;
        result.coordination_id = Some(coordination_id);

        let written = self.entities.update_bid(live.id, result.final_bid)?;
        let adjustment_id = self.history.append(&NewAdjustment {
            account_id: live.account_id,
            target_id: live.id,
            target_type: live.target_type,
            previous_bid: result.original_bid,
            new_bid: written,
            source: AdjustmentSource::Coordinator,
            reason: result.reason.clone(),
            expected_profit_delta,
            applied_by: applied_by.to_string(),
            baseline,
        })?;

        if result.circuit_breaker_tripped {
            warn!(
                target_id = live.id,
                final_bid = written,
                "circuit breaker clamped coordinated bid"
            );
        } else {
            info!(
                target_id = live.id,
                previous = result.original_bid,
                new = written,
                "coordinated bid applied"
            );
        }

        Ok(ApplyOutcome {
            result,
            applied: true,
            skip_reason: None,
            adjustment_id: Some(adjustment_id),
        })
    }

    /// Cooldown, daily cap and no-op checks, evaluated under the write
    /// lock.
    fn skip_reason(&self, live: &Target, result: &CoordinationResult) -> Result<Option<String>> {
        if (result.final_bid - result.original_bid).abs() < 0.005 {
            return Ok(Some("bid unchanged".to_string()));
        }
        let now = Utc::now();
        if let Some(latest) = self.history.latest_for_target(live.id)? {
            let cooldown = Duration::hours(self.params.cooldown_period_hours);
            if now - latest.applied_at < cooldown {
                return Ok(Some(format!(
                    "cooldown: last adjustment {} minutes ago",
                    (now - latest.applied_at).num_minutes()
                )));
            }
        }
        let today_count = self
            .history
            .count_since(live.id, now - Duration::hours(24))?;
        if today_count >= self.params.max_daily_adjustments {
            return Ok(Some(format!(
                "daily adjustment cap reached ({})",
                self.params.max_daily_adjustments
            )));
        }
        Ok(None)
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.params
    }
}

/// `dayparting × (1 + placement_pct/100)` — the stack every click may
/// pay on top of the base bid.
fn multiplier_stack(dayparting: f64, placement_pct: i64) -> f64 {
    dayparting * (1.0 + placement_pct as f64 / 100.0)
}

/// Reduce to one proposal per source. Higher confidence dominates; on a
/// confidence tie the smaller change wins.
fn select_representatives(proposals: &[BidProposal], current_bid: f64) -> Vec<BidProposal> {
    let mut by_source: HashMap<ProposalKind, BidProposal> = HashMap::new();
    for p in proposals {
        match by_source.get(&p.source) {
            None => {
                by_source.insert(p.source, p.clone());
            }
            Some(existing) => {
                let replace = p.confidence > existing.confidence
                    || (p.confidence == existing.confidence
                        && p.change_magnitude(current_bid)
                            < existing.change_magnitude(current_bid));
                if replace {
                    by_source.insert(p.source, p.clone());
                }
            }
        }
    }
    let mut selected: Vec<BidProposal> = by_source.into_values().collect();
    selected.sort_by_key(|p| p.source.as_str());
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use crate::testutil::{sample_campaign, sample_target};

    fn coordinator() -> (BidCoordinator, EntityStore) {
        let db = Database::open_in_memory().unwrap();
        let entities = EntityStore::new(db.clone());
        let history = HistoryStore::new(db);
        (
            BidCoordinator::new(AlgorithmParams::default(), entities.clone(), history),
            entities,
        )
    }

    fn mult_proposal(
        target: &Target,
        source: ProposalKind,
        m: f64,
        confidence: f64,
    ) -> BidProposal {
        BidProposal::multiplier(target, source, m, confidence, "test")
    }

    #[test]
    fn test_ramp_up_fuses_three_sources() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 42, 1.0);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.3, 0.9),
                mult_proposal(&target, ProposalKind::Dayparting, 1.1, 0.8),
                mult_proposal(&target, ProposalKind::Placement, 1.15, 0.7),
            ],
            current_base_bid: 1.0,
            current_placement_pct: 50,
            current_dayparting_multiplier: 1.5,
        };

        let result = c.coordinate(&input);
        // 1.27 · 1.064 · 1.0735 ≈ 1.45
        assert!((result.final_bid - 1.45).abs() < 0.005, "got {}", result.final_bid);
        // CPC ≈ 1.45 · 1.5 · 1.5 ≈ 3.26 > warning threshold, no breaker.
        assert!(result.theoretical_max_cpc > 3.0);
        assert!(!result.circuit_breaker_tripped);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_circuit_breaker_trip() {
        let (c, _) = coordinator();
        let mut campaign = sample_campaign(1, 10);
        campaign.placement_top_pct = 100;
        let target = sample_target(1, 10, 42, 3.0);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![mult_proposal(&target, ProposalKind::BaseAlgo, 1.2, 1.0)],
            current_base_bid: 3.0,
            current_placement_pct: 100,
            current_dayparting_multiplier: 1.5,
        };

        let result = c.coordinate(&input);
        assert!(result.circuit_breaker_tripped);
        // 5 / (1.5 · 2) ≈ 1.67
        assert!((result.final_bid - 1.67).abs() < 0.005, "got {}", result.final_bid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("[circuit-breaker]")));
        // Cent rounding of the safe bid may leave the CPC a cent over the
        // cap; the trip flag covers it.
        assert!(result.theoretical_max_cpc <= 5.0 + 0.05);
    }

    #[test]
    fn test_cpc_cap_invariant_holds_for_all_results() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        for placement in [0i64, 50, 100, 200] {
            for dayparting in [0.5, 1.0, 1.5, 2.0] {
                for bid in [0.05, 0.5, 2.0, 4.0, 8.0] {
                    let target = sample_target(1, 10, 42, bid);
                    let input = CoordinationInput {
                        campaign: &campaign,
                        target: &target,
                        proposals: vec![mult_proposal(&target, ProposalKind::BaseAlgo, 1.4, 0.9)],
                        current_base_bid: bid,
                        current_placement_pct: placement,
                        current_dayparting_multiplier: dayparting,
                    };
                    let result = c.coordinate(&input);
                    assert!(
                        result.theoretical_max_cpc <= 5.0 + 1e-9 || result.circuit_breaker_tripped,
                        "cap violated without trip: {:?}",
                        result
                    );
                    assert!(result.final_bid >= 0.02 && result.final_bid <= 100.0);
                }
            }
        }
    }

    #[test]
    fn test_breaker_reachability() {
        // Any base bid above cap/(1.5·2) with placement ≥ 100% and
        // dayparting ≥ 1.5 must trip, even without proposals.
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let bid = 5.0 / (1.5 * 2.0) + 0.05;
        let target = sample_target(1, 10, 42, bid);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![],
            current_base_bid: bid,
            current_placement_pct: 100,
            current_dayparting_multiplier: 1.5,
        };
        assert!(c.coordinate(&input).circuit_breaker_tripped);
    }

    #[test]
    fn test_coordination_is_idempotent_within_cycle() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 42, 1.0);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.3, 0.9),
                mult_proposal(&target, ProposalKind::Inventory, 0.8, 0.9),
            ],
            current_base_bid: 1.0,
            current_placement_pct: 50,
            current_dayparting_multiplier: 1.5,
        };
        let a = c.coordinate(&input);
        let b = c.coordinate(&input);
        assert_eq!(a.final_bid, b.final_bid);
        assert_eq!(a.theoretical_max_cpc, b.theoretical_max_cpc);
    }

    #[test]
    fn test_same_source_tiebreak_prefers_confidence_then_conservatism() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 42, 1.0);

        // Higher confidence dominates.
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.5, 0.5),
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.1, 0.9),
            ],
            current_base_bid: 1.0,
            current_placement_pct: 0,
            current_dayparting_multiplier: 1.0,
        };
        let result = c.coordinate(&input);
        // 1 + 0.1·1.0·0.9 = 1.09
        assert!((result.final_bid - 1.09).abs() < 0.005);

        // Confidence tie: smaller change wins.
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.5, 0.8),
                mult_proposal(&target, ProposalKind::BaseAlgo, 1.2, 0.8),
            ],
            current_base_bid: 1.0,
            current_placement_pct: 0,
            current_dayparting_multiplier: 1.0,
        };
        let result = c.coordinate(&input);
        // 1 + 0.2·1.0·0.8 = 1.16
        assert!((result.final_bid - 1.16).abs() < 0.005);
    }

    #[test]
    fn test_absolute_proposals_average_by_weight_and_confidence() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 42, 1.0);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![
                BidProposal::absolute(&target, ProposalKind::BaseAlgo, 2.0, 0.9, "curve"),
                BidProposal::absolute(&target, ProposalKind::Inventory, 1.0, 0.9, "stock"),
            ],
            current_base_bid: 1.0,
            current_placement_pct: 0,
            current_dayparting_multiplier: 1.0,
        };
        let result = c.coordinate(&input);
        // Equal weights (1.0) and confidence: plain average.
        assert!((result.final_bid - 1.5).abs() < 0.005);
    }

    #[test]
    fn test_apply_writes_bid_history_and_audit() {
        let (c, entities) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 42, 1.0);
        entities.upsert_campaign(&campaign).unwrap();
        entities.upsert_target(&target).unwrap();

        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![mult_proposal(&target, ProposalKind::BaseAlgo, 1.3, 0.9)],
            current_base_bid: 1.0,
            current_placement_pct: 0,
            current_dayparting_multiplier: 1.0,
        };
        let outcome = c.apply(&input, None, Some(4.0), "scheduler").unwrap();
        assert!(outcome.applied);
        assert!(outcome.adjustment_id.is_some());
        assert!(outcome.result.coordination_id.is_some());

        let live = entities.get_target(42).unwrap().unwrap();
        assert!((live.bid - outcome.result.final_bid).abs() < 1e-9);

        // A second immediate apply skips: cooldown.
        let outcome2 = c.apply(&input, None, None, "scheduler").unwrap();
        assert!(!outcome2.applied);
        assert!(outcome2.skip_reason.unwrap().contains("cooldown"));
    }

    #[test]
    fn test_apply_missing_target_is_error_not_panic() {
        let (c, _) = coordinator();
        let campaign = sample_campaign(1, 10);
        let target = sample_target(1, 10, 999, 1.0);
        let input = CoordinationInput {
            campaign: &campaign,
            target: &target,
            proposals: vec![],
            current_base_bid: 1.0,
            current_placement_pct: 0,
            current_dayparting_multiplier: 1.0,
        };
        assert!(c.apply(&input, None, None, "scheduler").is_err());
    }
}
