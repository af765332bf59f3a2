//! Batch creation validation
//!
//! Runs before anything is persisted: one bad item aborts the whole
//! creation atomically. Execution-time problems (dangling targets,
//! platform failures) are item-level outcomes instead.

use crate::batch::{ItemPayload, OperationType};
use crate::models::{AlgorithmParams, MatchType};
use crate::store::EntityStore;
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

/// Fixed scheduling overhead plus a per-item cost by operation type;
/// surfaced to callers for progress display.
pub fn estimate_execution_time(operation_type: OperationType, item_count: usize) -> Duration {
    let per_item_ms = match operation_type {
        OperationType::NegativeKeyword => 300,
        OperationType::BidAdjustment => 200,
        OperationType::KeywordMigration => 800,
        OperationType::CampaignStatus => 250,
    };
    Duration::from_millis(500 + per_item_ms * item_count as u64)
}

/// Validate a prospective batch. Returns the list of violations; empty
/// means the batch may be created.
pub fn validate_items(
    params: &AlgorithmParams,
    entities: &EntityStore,
    items: &[ItemPayload],
) -> Result<Vec<String>> {
    let mut violations = Vec::new();
    if items.is_empty() {
        violations.push("batch has no items".to_string());
        return Ok(violations);
    }

    let mut negative_match_types: HashMap<(i64, String), MatchType> = HashMap::new();

    for (idx, item) in items.iter().enumerate() {
        match item {
            ItemPayload::BidAdjustment {
                target_id, new_bid, ..
            } => {
                if *new_bid < params.min_bid {
                    violations.push(format!(
                        "item {}: bid {:.2} below minimum {:.2}",
                        idx, new_bid, params.min_bid
                    ));
                } else if *new_bid > params.max_bid {
                    violations.push(format!(
                        "item {}: bid {:.2} above maximum {:.2}",
                        idx, new_bid, params.max_bid
                    ));
                }
                // Relative-change cap applies only when the target is
                // resolvable now; a dangling id fails at execution, not
                // here.
                if let Some(target) = entities.get_target(*target_id)? {
                    if target.bid > 0.0 {
                        let change_pct = (new_bid - target.bid).abs() / target.bid * 100.0;
                        if change_pct > params.max_adjustment_pct {
                            violations.push(format!(
                                "item {}: adjustment {:.0}% exceeds permitted {:.0}%",
                                idx, change_pct, params.max_adjustment_pct
                            ));
                        }
                    }
                }
            }
            ItemPayload::NegativeKeyword {
                campaign_id,
                keyword,
                match_type,
                ..
            } => {
                if keyword.trim().is_empty() {
                    violations.push(format!("item {}: empty negative keyword", idx));
                    continue;
                }
                if *match_type == MatchType::Broad {
                    violations.push(format!(
                        "item {}: negative keywords support phrase and exact match only",
                        idx
                    ));
                }
                let key = (*campaign_id, keyword.trim().to_lowercase());
                match negative_match_types.get(&key) {
                    Some(existing) if existing != match_type => {
                        violations.push(format!(
                            "item {}: conflicting match types for negative keyword '{}'",
                            idx, keyword
                        ));
                    }
                    _ => {
                        negative_match_types.insert(key, *match_type);
                    }
                }
            }
            ItemPayload::KeywordMigration { keyword, bid, .. } => {
                if keyword.trim().is_empty() {
                    violations.push(format!("item {}: empty migration keyword", idx));
                }
                if *bid < params.min_bid || *bid > params.max_bid {
                    violations.push(format!(
                        "item {}: migration bid {:.2} outside [{:.2}, {:.2}]",
                        idx, bid, params.min_bid, params.max_bid
                    ));
                }
            }
            ItemPayload::CampaignStatus { .. } => {}
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;
    use crate::store::Database;
    use crate::testutil::{sample_campaign, sample_target};

    fn entities() -> EntityStore {
        EntityStore::new(Database::open_in_memory().unwrap())
    }

    fn bid_item(target_id: i64, new_bid: f64) -> ItemPayload {
        ItemPayload::BidAdjustment {
            target_id,
            target_type: TargetType::Keyword,
            new_bid,
            coordination_id: None,
            expected_profit_delta: None,
        }
    }

    fn negative_item(keyword: &str, match_type: MatchType) -> ItemPayload {
        ItemPayload::NegativeKeyword {
            campaign_id: 10,
            ad_group_id: None,
            keyword: keyword.to_string(),
            match_type,
        }
    }

    #[test]
    fn test_bid_bounds_enforced() {
        let params = AlgorithmParams::default();
        let e = entities();
        let violations =
            validate_items(&params, &e, &[bid_item(1, 0.01), bid_item(2, 150.0)]).unwrap();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("below minimum"));
        assert!(violations[1].contains("above maximum"));
    }

    #[test]
    fn test_adjustment_percent_cap() {
        let params = AlgorithmParams::default();
        let e = entities();
        e.upsert_campaign(&sample_campaign(1, 10)).unwrap();
        e.upsert_target(&sample_target(1, 10, 42, 1.0)).unwrap();

        // 1.0 -> 2.5 is a 150% change against the 100% default cap.
        let violations = validate_items(&params, &e, &[bid_item(42, 2.5)]).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("exceeds permitted"));

        // Unknown target: no percent check, no violation.
        assert!(validate_items(&params, &e, &[bid_item(999, 2.5)])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_negative_keyword_rules() {
        let params = AlgorithmParams::default();
        let e = entities();
        let violations = validate_items(
            &params,
            &e,
            &[
                negative_item("  ", MatchType::Phrase),
                negative_item("free stuff", MatchType::Broad),
                negative_item("cheap", MatchType::Phrase),
                negative_item("cheap", MatchType::Exact),
            ],
        )
        .unwrap();
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("empty"));
        assert!(violations[1].contains("phrase and exact"));
        assert!(violations[2].contains("conflicting match types"));
    }

    #[test]
    fn test_estimate_scales_with_items() {
        let small = estimate_execution_time(OperationType::BidAdjustment, 10);
        let large = estimate_execution_time(OperationType::BidAdjustment, 100);
        assert!(large > small);
        let migration = estimate_execution_time(OperationType::KeywordMigration, 10);
        assert!(migration > small);
    }
}
