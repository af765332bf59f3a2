//! Batch execution and rollback
//!
//! Items execute sequentially in stored order with per-item isolation:
//! a failure is recorded on the item and execution continues. The batch
//! only fails as a whole when every item failed. The cancellation token
//! is checked between items; cancelled batches keep their already
//! executed items as-is.

use crate::ads_api::{with_retries, AdsApi, ApiError, IdempotencyToken, RetryPolicy};
use crate::batch::{
    BatchItem, BatchOperation, BatchSourceType, BatchStatus, ItemPayload, ItemStatus,
    RollbackSnapshot,
};
use crate::errors::{OpError, OpResult};
use crate::models::AlgorithmParams;
use crate::scheduler::CancellationToken;
use crate::store::history::{AdjustmentSource, HistoryStore, NewAdjustment};
use crate::store::{BatchStore, EntityStore};
use anyhow::anyhow;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct BatchExecutor {
    batches: BatchStore,
    entities: EntityStore,
    history: HistoryStore,
    api: Arc<dyn AdsApi>,
    policy: RetryPolicy,
    params: AlgorithmParams,
}

#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub success_items: u32,
    pub failed_items: u32,
    pub skipped_items: u32,
}

impl BatchExecutor {
    pub fn new(
        batches: BatchStore,
        entities: EntityStore,
        history: HistoryStore,
        api: Arc<dyn AdsApi>,
        params: AlgorithmParams,
    ) -> Self {
        Self {
            batches,
            entities,
            history,
            api,
            policy: RetryPolicy::default(),
            params,
        }
    }

    fn load(&self, batch_id: &str) -> OpResult<BatchOperation> {
        self.batches
            .get(batch_id)?
            .ok_or_else(|| OpError::NotFound(format!("batch {}", batch_id)))
    }

    pub fn approve(&self, batch_id: &str) -> OpResult<()> {
        let batch = self.load(batch_id)?;
        if !self
            .batches
            .transition(batch_id, BatchStatus::Pending, BatchStatus::Approved, Some("approved_at"))?
        {
            return Err(OpError::Conflict(format!(
                "cannot approve batch in state {}",
                batch.status.as_str()
            )));
        }
        info!(batch_id, "batch approved");
        Ok(())
    }

    pub fn cancel(&self, batch_id: &str) -> OpResult<()> {
        let batch = self.load(batch_id)?;
        let from = match batch.status {
            BatchStatus::Pending | BatchStatus::Approved => batch.status,
            other => {
                return Err(OpError::Conflict(format!(
                    "cannot cancel batch in state {}",
                    other.as_str()
                )))
            }
        };
        if !self.batches.transition(batch_id, from, BatchStatus::Cancelled, None)? {
            return Err(OpError::Conflict("batch state moved concurrently".to_string()));
        }
        info!(batch_id, "batch cancelled");
        Ok(())
    }

    /// Execute an approved batch. Never returns an item-level error: per
    /// item outcomes land on the items, and the summary reflects them.
    pub async fn execute(
        &self,
        batch_id: &str,
        cancellation: &CancellationToken,
        executed_by: &str,
    ) -> OpResult<ExecutionSummary> {
        let batch = self.load(batch_id)?;
        if !self.batches.transition(
            batch_id,
            BatchStatus::Approved,
            BatchStatus::Executing,
            Some("executed_at"),
        )? {
            return Err(OpError::Conflict(format!(
                "cannot execute batch in state {}",
                batch.status.as_str()
            )));
        }
        self.batches.set_executed_by(batch_id, executed_by)?;

        let items = self.batches.items(batch_id)?;
        let account_id = batch.account_id.unwrap_or(0);
        let mut cancelled = false;

        for item in &items {
            if item.status != ItemStatus::Pending {
                continue;
            }
            if cancellation.is_cancelled() {
                cancelled = true;
                self.batches
                    .record_item_result(item.id, ItemStatus::Skipped, Some("batch cancelled"), None)?;
                continue;
            }
            match self.execute_item(&batch, account_id, item).await {
                Ok(snapshot) => {
                    self.batches
                        .record_item_result(item.id, ItemStatus::Success, None, Some(&snapshot))?;
                }
                Err(e) => {
                    warn!(batch_id, item_id = item.id, error = %e, "batch item failed");
                    self.batches.record_item_result(
                        item.id,
                        ItemStatus::Failed,
                        Some(&e.to_string()),
                        None,
                    )?;
                }
            }
        }

        self.batches.refresh_counts(batch_id)?;
        let refreshed = self.load(batch_id)?;
        let final_status = if cancelled {
            BatchStatus::Cancelled
        } else if refreshed.failed_items == refreshed.total_items {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        self.batches
            .transition(batch_id, BatchStatus::Executing, final_status, None)?;

        info!(
            batch_id,
            status = final_status.as_str(),
            success = refreshed.success_items,
            failed = refreshed.failed_items,
            "batch execution finished"
        );
        Ok(ExecutionSummary {
            batch_id: batch_id.to_string(),
            status: final_status,
            success_items: refreshed.success_items,
            failed_items: refreshed.failed_items,
            skipped_items: refreshed.skipped_items,
        })
    }

    async fn execute_item(
        &self,
        batch: &BatchOperation,
        account_id: i64,
        item: &BatchItem,
    ) -> anyhow::Result<RollbackSnapshot> {
        match &item.payload {
            ItemPayload::BidAdjustment {
                target_id,
                new_bid,
                expected_profit_delta,
                ..
            } => {
                let target = self
                    .entities
                    .get_target(*target_id)?
                    .ok_or_else(|| anyhow!("target {} not found", target_id))?;
                let original_bid = target.bid;

                self.platform_call("update_target_bid", item.id, |token| {
                    let api = self.api.clone();
                    let bid = *new_bid;
                    let target_id = *target_id;
                    async move { api.update_target_bid(&token, account_id, target_id, bid).await }
                })
                .await?;

                let written = self.entities.update_bid(*target_id, *new_bid)?;
                self.history.append(&NewAdjustment {
                    account_id: target.account_id,
                    target_id: *target_id,
                    target_type: target.target_type,
                    previous_bid: original_bid,
                    new_bid: written,
                    source: adjustment_source(batch.source_type),
                    reason: format!("batch {} ({})", batch.id, batch.name),
                    expected_profit_delta: *expected_profit_delta,
                    applied_by: batch
                        .executed_by
                        .clone()
                        .unwrap_or_else(|| batch.owner.clone()),
                    baseline: None,
                })?;
                Ok(RollbackSnapshot::RestoreBid {
                    target_id: *target_id,
                    original_bid,
                })
            }
            ItemPayload::NegativeKeyword {
                campaign_id,
                ad_group_id,
                keyword,
                match_type,
            } => {
                self.platform_call("create_negative_keyword", item.id, |token| {
                    let api = self.api.clone();
                    let keyword = keyword.clone();
                    let campaign_id = *campaign_id;
                    let ad_group_id = *ad_group_id;
                    let match_type = *match_type;
                    async move {
                        api.create_negative_keyword(
                            &token,
                            account_id,
                            campaign_id,
                            ad_group_id,
                            &keyword,
                            match_type,
                        )
                        .await
                    }
                })
                .await?;
                self.entities.add_negative_keyword(
                    account_id,
                    *campaign_id,
                    *ad_group_id,
                    keyword,
                    *match_type,
                )?;
                Ok(RollbackSnapshot::RemoveNegative {
                    campaign_id: *campaign_id,
                    keyword: keyword.clone(),
                    match_type: *match_type,
                })
            }
            ItemPayload::KeywordMigration {
                source_target_id,
                dest_campaign_id,
                dest_ad_group_id,
                keyword,
                match_type,
                bid,
            } => {
                let source = self
                    .entities
                    .get_target(*source_target_id)?
                    .ok_or_else(|| anyhow!("source target {} not found", source_target_id))?;

                self.platform_call("create_keyword", item.id, |token| {
                    let api = self.api.clone();
                    let keyword = keyword.clone();
                    let (campaign_id, ad_group_id, match_type, bid) =
                        (*dest_campaign_id, *dest_ad_group_id, *match_type, *bid);
                    async move {
                        api.create_keyword(
                            &token, account_id, campaign_id, ad_group_id, &keyword, match_type, bid,
                        )
                        .await
                    }
                })
                .await?;
                let created_target_id = self.entities.create_keyword(
                    account_id,
                    *dest_campaign_id,
                    *dest_ad_group_id,
                    keyword,
                    *match_type,
                    *bid,
                )?;

                // Exact negative in the source stops the old match-type
                // from competing with the migrated keyword.
                self.platform_call("create_negative_keyword", item.id, |token| {
                    let api = self.api.clone();
                    let keyword = keyword.clone();
                    let campaign_id = source.campaign_id;
                    async move {
                        api.create_negative_keyword(
                            &token,
                            account_id,
                            campaign_id,
                            None,
                            &keyword,
                            crate::models::MatchType::Exact,
                        )
                        .await
                    }
                })
                .await?;
                self.entities.add_negative_keyword(
                    account_id,
                    source.campaign_id,
                    None,
                    keyword,
                    crate::models::MatchType::Exact,
                )?;

                Ok(RollbackSnapshot::UndoMigration {
                    created_target_id,
                    source_campaign_id: source.campaign_id,
                    keyword: keyword.clone(),
                    match_type: crate::models::MatchType::Exact,
                })
            }
            ItemPayload::CampaignStatus {
                campaign_id,
                status,
            } => {
                let campaign = self
                    .entities
                    .get_campaign(*campaign_id)?
                    .ok_or_else(|| anyhow!("campaign {} not found", campaign_id))?;
                let previous = campaign.status;

                self.platform_call("set_campaign_status", item.id, |token| {
                    let api = self.api.clone();
                    let (campaign_id, status) = (*campaign_id, *status);
                    async move {
                        api.set_campaign_status(&token, account_id, campaign_id, status).await
                    }
                })
                .await?;
                self.entities.set_campaign_status(*campaign_id, *status)?;
                Ok(RollbackSnapshot::RestoreStatus {
                    campaign_id: *campaign_id,
                    previous,
                })
            }
        }
    }

    async fn platform_call<T, F, Fut>(
        &self,
        operation: &str,
        item_id: i64,
        mut call: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut(IdempotencyToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        with_retries(&self.policy, operation, |attempt| {
            call(IdempotencyToken::derive(item_id, attempt))
        })
        .await
        .map_err(|e| anyhow!("{}: {}", operation, e))
    }

    /// Reverse a completed batch from its item snapshots.
    pub async fn rollback(&self, batch_id: &str, executed_by: &str) -> OpResult<ExecutionSummary> {
        let batch = self.load(batch_id)?;
        let items = self.batches.items(batch_id)?;
        if !batch.can_rollback(self.params.rollback_window_days, Utc::now(), &items) {
            return Err(OpError::Conflict(format!(
                "batch {} is not rollbackable (state {}, window {} days)",
                batch_id,
                batch.status.as_str(),
                self.params.rollback_window_days
            )));
        }

        let account_id = batch.account_id.unwrap_or(0);
        for item in &items {
            let snapshot = match (&item.status, &item.rollback) {
                (ItemStatus::Success, Some(snapshot)) => snapshot.clone(),
                _ => continue,
            };
            match self.rollback_item(account_id, item.id, &snapshot, executed_by).await {
                Ok(()) => {
                    self.batches
                        .record_item_result(item.id, ItemStatus::RolledBack, None, None)?;
                }
                Err(e) => {
                    error!(batch_id, item_id = item.id, error = %e, "rollback item failed");
                    self.batches.record_item_result(
                        item.id,
                        ItemStatus::Failed,
                        Some(&format!("rollback failed: {}", e)),
                        None,
                    )?;
                }
            }
        }

        if !self
            .batches
            .transition(batch_id, BatchStatus::Completed, BatchStatus::RolledBack, None)?
        {
            return Err(OpError::Conflict("batch state moved during rollback".to_string()));
        }
        self.batches.refresh_counts(batch_id)?;
        let refreshed = self.load(batch_id)?;
        info!(batch_id, "batch rolled back");
        Ok(ExecutionSummary {
            batch_id: batch_id.to_string(),
            status: BatchStatus::RolledBack,
            success_items: refreshed.success_items,
            failed_items: refreshed.failed_items,
            skipped_items: refreshed.skipped_items,
        })
    }

    async fn rollback_item(
        &self,
        account_id: i64,
        item_id: i64,
        snapshot: &RollbackSnapshot,
        executed_by: &str,
    ) -> anyhow::Result<()> {
        match snapshot {
            RollbackSnapshot::RestoreBid {
                target_id,
                original_bid,
            } => {
                let target = self
                    .entities
                    .get_target(*target_id)?
                    .ok_or_else(|| anyhow!("target {} not found", target_id))?;
                self.platform_call("update_target_bid", item_id, |token| {
                    let api = self.api.clone();
                    let (target_id, bid) = (*target_id, *original_bid);
                    async move { api.update_target_bid(&token, account_id, target_id, bid).await }
                })
                .await?;
                let written = self.entities.update_bid(*target_id, *original_bid)?;
                self.history.append(&NewAdjustment {
                    account_id: target.account_id,
                    target_id: *target_id,
                    target_type: target.target_type,
                    previous_bid: target.bid,
                    new_bid: written,
                    source: AdjustmentSource::Rollback,
                    reason: "batch rollback".to_string(),
                    expected_profit_delta: None,
                    applied_by: executed_by.to_string(),
                    baseline: None,
                })?;
            }
            RollbackSnapshot::RemoveNegative {
                campaign_id,
                keyword,
                match_type,
            } => {
                self.platform_call("remove_negative_keyword", item_id, |token| {
                    let api = self.api.clone();
                    let keyword = keyword.clone();
                    let (campaign_id, match_type) = (*campaign_id, *match_type);
                    async move {
                        api.remove_negative_keyword(&token, account_id, campaign_id, &keyword, match_type)
                            .await
                    }
                })
                .await?;
                self.entities
                    .remove_negative_keyword(*campaign_id, keyword, *match_type)?;
            }
            RollbackSnapshot::UndoMigration {
                created_target_id,
                source_campaign_id,
                keyword,
                match_type,
            } => {
                self.platform_call("archive_target", item_id, |token| {
                    let api = self.api.clone();
                    let target_id = *created_target_id;
                    async move { api.archive_target(&token, account_id, target_id).await }
                })
                .await?;
                self.entities
                    .set_target_status(*created_target_id, crate::models::EntityStatus::Archived)?;
                self.platform_call("remove_negative_keyword", item_id, |token| {
                    let api = self.api.clone();
                    let keyword = keyword.clone();
                    let (campaign_id, match_type) = (*source_campaign_id, *match_type);
                    async move {
                        api.remove_negative_keyword(&token, account_id, campaign_id, &keyword, match_type)
                            .await
                    }
                })
                .await?;
                self.entities
                    .remove_negative_keyword(*source_campaign_id, keyword, *match_type)?;
            }
            RollbackSnapshot::RestoreStatus {
                campaign_id,
                previous,
            } => {
                self.platform_call("set_campaign_status", item_id, |token| {
                    let api = self.api.clone();
                    let (campaign_id, status) = (*campaign_id, *previous);
                    async move {
                        api.set_campaign_status(&token, account_id, campaign_id, status).await
                    }
                })
                .await?;
                self.entities.set_campaign_status(*campaign_id, *previous)?;
            }
        }
        Ok(())
    }
}

fn adjustment_source(source_type: BatchSourceType) -> AdjustmentSource {
    match source_type {
        BatchSourceType::Manual => AdjustmentSource::Manual,
        BatchSourceType::Optimization | BatchSourceType::ScheduledTask => {
            AdjustmentSource::BatchCampaign
        }
        BatchSourceType::GroupOptimization => AdjustmentSource::BatchGroup,
        BatchSourceType::Rollback => AdjustmentSource::Rollback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads_api::RecordingAdsApi;
    use crate::batch::OperationType;
    use crate::models::TargetType;
    use crate::store::Database;
    use crate::testutil::{sample_campaign, sample_target};

    struct Fixture {
        executor: BatchExecutor,
        batches: BatchStore,
        entities: EntityStore,
        api: Arc<RecordingAdsApi>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let batches = BatchStore::new(db.clone());
        let entities = EntityStore::new(db.clone());
        let history = HistoryStore::new(db);
        let api = Arc::new(RecordingAdsApi::new());
        let executor = BatchExecutor::new(
            batches.clone(),
            entities.clone(),
            history,
            api.clone(),
            AlgorithmParams::default(),
        );
        Fixture {
            executor,
            batches,
            entities,
            api,
        }
    }

    fn seed_targets(f: &Fixture) {
        f.entities.upsert_campaign(&sample_campaign(1, 10)).unwrap();
        f.entities.upsert_target(&sample_target(1, 10, 1, 0.50)).unwrap();
        f.entities.upsert_target(&sample_target(1, 10, 2, 1.00)).unwrap();
    }

    fn bid_batch(f: &Fixture, id: &str, items: Vec<ItemPayload>) {
        let batch = BatchOperation {
            id: id.to_string(),
            account_id: Some(1),
            owner: "ops".into(),
            operation_type: OperationType::BidAdjustment,
            name: "adjustments".into(),
            description: String::new(),
            requires_approval: true,
            source_type: BatchSourceType::Manual,
            source_task_id: None,
            status: BatchStatus::Pending,
            total_items: items.len() as u32,
            success_items: 0,
            failed_items: 0,
            skipped_items: 0,
            executed_by: None,
            created_at: Utc::now(),
            approved_at: None,
            executed_at: None,
            finished_at: None,
        };
        f.batches.create(&batch, &items).unwrap();
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

    #[tokio::test]
    async fn test_execute_then_rollback_restores_bids() {
        let f = fixture();
        seed_targets(&f);
        bid_batch(&f, "b1", vec![bid_item(1, 0.80), bid_item(2, 1.40)]);

        f.executor.approve("b1").unwrap();
        let token = CancellationToken::new();
        let summary = f.executor.execute("b1", &token, "ops").await.unwrap();
        assert_eq!(summary.status, BatchStatus::Completed);
        assert_eq!(summary.success_items, 2);
        assert_eq!(f.entities.get_target(1).unwrap().unwrap().bid, 0.80);
        assert_eq!(f.entities.get_target(2).unwrap().unwrap().bid, 1.40);

        let rollback = f.executor.rollback("b1", "ops").await.unwrap();
        assert_eq!(rollback.status, BatchStatus::RolledBack);
        assert_eq!(f.entities.get_target(1).unwrap().unwrap().bid, 0.50);
        assert_eq!(f.entities.get_target(2).unwrap().unwrap().bid, 1.00);
        assert_eq!(
            f.batches.get("b1").unwrap().unwrap().status,
            BatchStatus::RolledBack
        );
    }

    #[tokio::test]
    async fn test_failure_isolation_continues_past_bad_item() {
        let f = fixture();
        seed_targets(&f);
        // Target 999 does not exist: the item fails, the next succeeds.
        bid_batch(&f, "b1", vec![bid_item(999, 0.80), bid_item(2, 1.40)]);

        f.executor.approve("b1").unwrap();
        let summary = f
            .executor
            .execute("b1", &CancellationToken::new(), "ops")
            .await
            .unwrap();
        assert_eq!(summary.status, BatchStatus::Completed);
        assert_eq!(summary.success_items, 1);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(f.entities.get_target(2).unwrap().unwrap().bid, 1.40);

        let items = f.batches.items("b1").unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert!(items[0].error_message.as_ref().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_all_items_failed_marks_batch_failed() {
        let f = fixture();
        seed_targets(&f);
        f.api.fail_target(1);
        f.api.fail_target(2);
        bid_batch(&f, "b1", vec![bid_item(1, 0.80), bid_item(2, 1.40)]);

        f.executor.approve("b1").unwrap();
        let summary = f
            .executor
            .execute("b1", &CancellationToken::new(), "ops")
            .await
            .unwrap();
        assert_eq!(summary.status, BatchStatus::Failed);
        assert_eq!(summary.failed_items, 2);
        // Local bids untouched when the platform rejected the writes.
        assert_eq!(f.entities.get_target(1).unwrap().unwrap().bid, 0.50);
    }

    #[tokio::test]
    async fn test_execute_requires_approval() {
        let f = fixture();
        seed_targets(&f);
        bid_batch(&f, "b1", vec![bid_item(1, 0.80)]);

        let result = f.executor.execute("b1", &CancellationToken::new(), "ops").await;
        assert!(matches!(result, Err(OpError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_remaining_items() {
        let f = fixture();
        seed_targets(&f);
        bid_batch(&f, "b1", vec![bid_item(1, 0.80), bid_item(2, 1.40)]);
        f.executor.approve("b1").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let summary = f.executor.execute("b1", &token, "ops").await.unwrap();
        assert_eq!(summary.status, BatchStatus::Cancelled);
        assert_eq!(summary.skipped_items, 2);
        assert_eq!(f.entities.get_target(1).unwrap().unwrap().bid, 0.50);
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending_or_approved() {
        let f = fixture();
        seed_targets(&f);
        bid_batch(&f, "b1", vec![bid_item(1, 0.80)]);
        f.executor.approve("b1").unwrap();
        f.executor
            .execute("b1", &CancellationToken::new(), "ops")
            .await
            .unwrap();

        assert!(matches!(f.executor.cancel("b1"), Err(OpError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_negative_keyword_roundtrip() {
        let f = fixture();
        seed_targets(&f);
        let batch = BatchOperation {
            id: "neg".to_string(),
            account_id: Some(1),
            owner: "ops".into(),
            operation_type: OperationType::NegativeKeyword,
            name: "negatives".into(),
            description: String::new(),
            requires_approval: false,
            source_type: BatchSourceType::Manual,
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
        f.batches
            .create(
                &batch,
                &[ItemPayload::NegativeKeyword {
                    campaign_id: 10,
                    ad_group_id: None,
                    keyword: "free".into(),
                    match_type: crate::models::MatchType::Phrase,
                }],
            )
            .unwrap();

        f.executor
            .execute("neg", &CancellationToken::new(), "ops")
            .await
            .unwrap();
        assert_eq!(f.entities.list_negative_keywords(10).unwrap().len(), 1);

        f.executor.rollback("neg", "ops").await.unwrap();
        assert!(f.entities.list_negative_keywords(10).unwrap().is_empty());
    }
}
