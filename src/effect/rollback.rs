//! Rule-driven auto-rollback
//!
//! Rules score tracked adjustments against their estimated profit; a
//! sufficient shortfall produces a prioritized rollback suggestion.
//! Approval stays manual unless the matching rule opts into auto
//! rollback. Executing a suggestion goes through the normal batch
//! machinery: a one-item bid_adjustment batch restoring the previous
//! bid.

use crate::batch::{
    BatchExecutor, BatchOperation, BatchSourceType, BatchStatus, ItemPayload, OperationType,
};
use crate::errors::{OpError, OpResult};
use crate::models::AlgorithmParams;
use crate::scheduler::CancellationToken;
use crate::store::history::HistoryStore;
use crate::store::rules::{RollbackRule, RollbackSuggestion, RuleStore, SuggestionStatus};
use crate::store::BatchStore;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const DROP_EPS: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub rules_evaluated: usize,
    pub adjustments_checked: usize,
    pub suggestions_created: usize,
    pub auto_approved: usize,
}

pub struct RollbackEngine {
    history: HistoryStore,
    rules: RuleStore,
    batches: BatchStore,
    params: AlgorithmParams,
}

impl RollbackEngine {
    pub fn new(
        history: HistoryStore,
        rules: RuleStore,
        batches: BatchStore,
        params: AlgorithmParams,
    ) -> Self {
        Self {
            history,
            rules,
            batches,
            params,
        }
    }

    /// Evaluate every enabled rule over its tracking horizon. Rules see
    /// only adjustments with a filled horizon cell; a changed ruleset
    /// affects future evaluations, not past records.
    pub fn evaluate(&self, account_id: Option<i64>) -> Result<EvaluationSummary> {
        let rules = self.rules.list_rules(true)?;
        let mut checked = 0;
        let mut created = 0;
        let mut auto_approved = 0;

        for rule in &rules {
            let tracked = self
                .history
                .tracked_at_horizon(rule.min_tracking_days, account_id)?;
            if (tracked.len() as i64) < rule.min_sample_count {
                continue;
            }
            for (record, actual) in &tracked {
                checked += 1;
                if record.is_rolled_back {
                    continue;
                }
                let estimated = match record.expected_profit_delta {
                    Some(e) => e,
                    None => continue,
                };
                if !rule.include_negative_adjustments && record.new_bid < record.previous_bid {
                    continue;
                }

                let drop = (actual - estimated) / estimated.abs().max(DROP_EPS);
                if drop > -(rule.profit_threshold_pct / 100.0) {
                    continue;
                }
                if self.rules.has_open_suggestion(record.id)? {
                    continue;
                }

                let suggestion = RollbackSuggestion {
                    id: Uuid::new_v4().to_string(),
                    rule_id: rule.id,
                    adjustment_id: record.id,
                    account_id: record.account_id,
                    target_id: record.target_id,
                    estimated_profit: estimated,
                    actual_profit: *actual,
                    drop_pct: drop,
                    priority: rule.priority,
                    status: SuggestionStatus::Pending,
                    created_at: Utc::now(),
                    reviewed_at: None,
                    executed_at: None,
                    batch_id: None,
                };
                self.rules.insert_suggestion(&suggestion)?;
                created += 1;
                info!(
                    adjustment_id = record.id,
                    rule_id = rule.id,
                    drop_pct = drop * 100.0,
                    "rollback suggested"
                );

                if rule.auto_rollback {
                    self.rules.transition_suggestion(
                        &suggestion.id,
                        SuggestionStatus::Pending,
                        SuggestionStatus::Approved,
                        None,
                    )?;
                    auto_approved += 1;
                }
            }
        }

        Ok(EvaluationSummary {
            rules_evaluated: rules.len(),
            adjustments_checked: checked,
            suggestions_created: created,
            auto_approved,
        })
    }

    pub fn review(&self, suggestion_id: &str, approve: bool) -> OpResult<()> {
        let to = if approve {
            SuggestionStatus::Approved
        } else {
            SuggestionStatus::Rejected
        };
        let moved =
            self.rules
                .transition_suggestion(suggestion_id, SuggestionStatus::Pending, to, None)?;
        if !moved {
            let current = self
                .rules
                .get_suggestion(suggestion_id)?
                .ok_or_else(|| OpError::NotFound(format!("suggestion {}", suggestion_id)))?;
            return Err(OpError::Conflict(format!(
                "suggestion is {}, not pending",
                current.status.as_str()
            )));
        }
        Ok(())
    }

    /// Execute an approved suggestion: build and run a one-item restore
    /// batch, then mark the original adjustment rolled back.
    pub async fn execute_suggestion(
        &self,
        suggestion_id: &str,
        executor: &BatchExecutor,
        executed_by: &str,
    ) -> OpResult<String> {
        let suggestion = self
            .rules
            .get_suggestion(suggestion_id)?
            .ok_or_else(|| OpError::NotFound(format!("suggestion {}", suggestion_id)))?;
        if suggestion.status != SuggestionStatus::Approved {
            return Err(OpError::Conflict(format!(
                "suggestion is {}, not approved",
                suggestion.status.as_str()
            )));
        }
        let record = self
            .history
            .get(suggestion.adjustment_id)?
            .ok_or_else(|| OpError::NotFound(format!("adjustment {}", suggestion.adjustment_id)))?;

        let batch_id = Uuid::new_v4().to_string();
        let batch = BatchOperation {
            id: batch_id.clone(),
            account_id: Some(record.account_id),
            owner: executed_by.to_string(),
            operation_type: OperationType::BidAdjustment,
            name: format!("rollback adjustment {}", record.id),
            description: format!(
                "restore bid {:.2} (profit shortfall {:.0}%)",
                record.previous_bid,
                suggestion.drop_pct.abs() * 100.0
            ),
            requires_approval: false,
            source_type: BatchSourceType::Rollback,
            source_task_id: None,
            status: BatchStatus::Approved,
            total_items: 1,
            success_items: 0,
            failed_items: 0,
            skipped_items: 0,
            executed_by: None,
            created_at: Utc::now(),
            approved_at: Some(Utc::now()),
            executed_at: None,
            finished_at: None,
        };
        self.batches.create(
            &batch,
            &[ItemPayload::BidAdjustment {
                target_id: record.target_id,
                target_type: record.target_type,
                new_bid: record.previous_bid,
                coordination_id: None,
                expected_profit_delta: None,
            }],
        )?;

        let summary = executor
            .execute(&batch_id, &CancellationToken::new(), executed_by)
            .await?;
        if summary.status != BatchStatus::Completed || summary.success_items == 0 {
            warn!(
                suggestion_id,
                batch_id, "rollback batch did not complete cleanly"
            );
            return Err(OpError::ExternalFailure(format!(
                "rollback batch {} finished as {}",
                batch_id,
                summary.status.as_str()
            )));
        }

        self.history.mark_rolled_back(record.id)?;
        self.rules.transition_suggestion(
            suggestion_id,
            SuggestionStatus::Approved,
            SuggestionStatus::Executed,
            Some(&batch_id),
        )?;
        info!(suggestion_id, batch_id, "rollback executed");
        Ok(batch_id)
    }

    /// Drop suggestions past the retention window.
    pub fn cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.params.suggestion_retention_days);
        self.rules.purge_older_than(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads_api::RecordingAdsApi;
    use crate::models::TargetType;
    use crate::store::history::{AdjustmentSource, NewAdjustment};
    use crate::store::rules::RuleSpec;
    use crate::store::{Database, EntityStore};
    use crate::testutil::{sample_campaign, sample_target};
    use std::sync::Arc;

    struct Fixture {
        engine: RollbackEngine,
        history: HistoryStore,
        rules: RuleStore,
        entities: EntityStore,
        executor: BatchExecutor,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let history = HistoryStore::new(db.clone());
        let rules = RuleStore::new(db.clone());
        let batches = BatchStore::new(db.clone());
        let entities = EntityStore::new(db.clone());
        let executor = BatchExecutor::new(
            batches.clone(),
            entities.clone(),
            history.clone(),
            Arc::new(RecordingAdsApi::new()),
            AlgorithmParams::default(),
        );
        let engine = RollbackEngine::new(
            history.clone(),
            rules.clone(),
            batches,
            AlgorithmParams::default(),
        );
        Fixture {
            engine,
            history,
            rules,
            entities,
            executor,
        }
    }

    fn rule_spec(threshold: f64, auto: bool) -> RuleSpec {
        RuleSpec {
            name: "drop".into(),
            enabled: true,
            profit_threshold_pct: threshold,
            min_tracking_days: 7,
            min_sample_count: 1,
            include_negative_adjustments: true,
            auto_rollback: auto,
            send_notification: true,
            priority: 5,
        }
    }

    /// Adjustment with estimated +$20 and a tracked 7d actual of −$5.
    fn seed_regressed_adjustment(f: &Fixture) -> i64 {
        let id = f
            .history
            .append(&NewAdjustment {
                account_id: 1,
                target_id: 42,
                target_type: TargetType::Keyword,
                previous_bid: 1.0,
                new_bid: 1.3,
                source: AdjustmentSource::Coordinator,
                reason: "optimize".into(),
                expected_profit_delta: Some(20.0),
                applied_by: "system".into(),
                baseline: None,
            })
            .unwrap();
        f.history.write_horizon_profit(id, 7, -5.0, None).unwrap();
        id
    }

    #[test]
    fn test_shortfall_produces_prioritized_suggestion() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, false)).unwrap();
        seed_regressed_adjustment(&f);

        let summary = f.engine.evaluate(None).unwrap();
        assert_eq!(summary.suggestions_created, 1);
        assert_eq!(summary.auto_approved, 0);

        let pending = f
            .rules
            .list_suggestions(Some(SuggestionStatus::Pending), 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        // (−5 − 20) / 20 = −1.25
        assert!((pending[0].drop_pct + 1.25).abs() < 1e-9);
        assert_eq!(pending[0].priority, 5);
    }

    #[test]
    fn test_within_threshold_is_left_alone() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, false)).unwrap();
        let id = f
            .history
            .append(&NewAdjustment {
                account_id: 1,
                target_id: 42,
                target_type: TargetType::Keyword,
                previous_bid: 1.0,
                new_bid: 1.3,
                source: AdjustmentSource::Coordinator,
                reason: "optimize".into(),
                expected_profit_delta: Some(20.0),
                applied_by: "system".into(),
                baseline: None,
            })
            .unwrap();
        // Actual 18 against estimated 20: only a 10% shortfall.
        f.history.write_horizon_profit(id, 7, 18.0, None).unwrap();

        let summary = f.engine.evaluate(None).unwrap();
        assert_eq!(summary.suggestions_created, 0);
    }

    #[test]
    fn test_evaluation_does_not_stack_duplicates() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, false)).unwrap();
        seed_regressed_adjustment(&f);

        f.engine.evaluate(None).unwrap();
        let second = f.engine.evaluate(None).unwrap();
        assert_eq!(second.suggestions_created, 0);
    }

    #[test]
    fn test_auto_rollback_rule_pre_approves() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, true)).unwrap();
        seed_regressed_adjustment(&f);

        let summary = f.engine.evaluate(None).unwrap();
        assert_eq!(summary.auto_approved, 1);
        let approved = f
            .rules
            .list_suggestions(Some(SuggestionStatus::Approved), 10)
            .unwrap();
        assert_eq!(approved.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_restores_bid_and_marks_record() {
        let f = fixture();
        f.entities.upsert_campaign(&sample_campaign(1, 10)).unwrap();
        f.entities.upsert_target(&sample_target(1, 10, 42, 1.3)).unwrap();
        f.rules.create_rule(&rule_spec(20.0, true)).unwrap();
        let adjustment_id = seed_regressed_adjustment(&f);
        f.engine.evaluate(None).unwrap();

        let suggestion = f
            .rules
            .list_suggestions(Some(SuggestionStatus::Approved), 1)
            .unwrap()
            .remove(0);
        let batch_id = f
            .engine
            .execute_suggestion(&suggestion.id, &f.executor, "auto")
            .await
            .unwrap();

        assert_eq!(f.entities.get_target(42).unwrap().unwrap().bid, 1.0);
        assert!(f.history.get(adjustment_id).unwrap().unwrap().is_rolled_back);
        let executed = f.rules.get_suggestion(&suggestion.id).unwrap().unwrap();
        assert_eq!(executed.status, SuggestionStatus::Executed);
        assert_eq!(executed.batch_id.as_deref(), Some(batch_id.as_str()));
    }

    #[tokio::test]
    async fn test_execute_requires_approval() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, false)).unwrap();
        seed_regressed_adjustment(&f);
        f.engine.evaluate(None).unwrap();

        let pending = f
            .rules
            .list_suggestions(Some(SuggestionStatus::Pending), 1)
            .unwrap()
            .remove(0);
        let result = f
            .engine
            .execute_suggestion(&pending.id, &f.executor, "auto")
            .await;
        assert!(matches!(result, Err(OpError::Conflict(_))));
    }

    #[test]
    fn test_review_reject() {
        let f = fixture();
        f.rules.create_rule(&rule_spec(20.0, false)).unwrap();
        seed_regressed_adjustment(&f);
        f.engine.evaluate(None).unwrap();

        let pending = f
            .rules
            .list_suggestions(Some(SuggestionStatus::Pending), 1)
            .unwrap()
            .remove(0);
        f.engine.review(&pending.id, false).unwrap();
        let rejected = f.rules.get_suggestion(&pending.id).unwrap().unwrap();
        assert_eq!(rejected.status, SuggestionStatus::Rejected);

        // Rejected is terminal for review.
        assert!(matches!(
            f.engine.review(&pending.id, true),
            Err(OpError::Conflict(_))
        ));
    }
}
