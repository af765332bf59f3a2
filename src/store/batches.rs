//! Batch persistence
//!
//! Creation is transactional: the batch row and all item rows land
//! together or not at all. Status transitions are compare-and-swap
//! updates so two executors cannot both move the same batch.

use crate::batch::{
    BatchItem, BatchOperation, BatchSourceType, BatchStatus, ItemPayload, ItemStatus,
    OperationType, RollbackSnapshot,
};
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct BatchStore {
    db: Database,
}

#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub account_id: Option<i64>,
    pub status: Option<BatchStatus>,
    pub operation_type: Option<OperationType>,
}

impl BatchStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new batch and its items atomically. Items are stored in
    /// the order given; execution follows that order.
    pub fn create(&self, batch: &BatchOperation, payloads: &[ItemPayload]) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO batch_operations
               (id, account_id, owner, operation_type, name, description,
                requires_approval, source_type, source_task_id, status,
                total_items, success_items, failed_items, skipped_items,
                executed_by, created_at, approved_at, executed_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, 0, 0, 0, NULL, ?12, ?13, NULL, NULL)",
            params![
                batch.id,
                batch.account_id,
                batch.owner,
                batch.operation_type.as_str(),
                batch.name,
                batch.description,
                batch.requires_approval as i64,
                batch.source_type.as_str(),
                batch.source_task_id,
                batch.status.as_str(),
                payloads.len() as i64,
                batch.created_at.to_rfc3339(),
                batch.approved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO batch_items
                   (batch_id, seq, entity_kind, entity_id, payload_json, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            )?;
            for (seq, payload) in payloads.iter().enumerate() {
                let (kind, id) = payload.entity();
                let json =
                    serde_json::to_string(payload).context("failed to serialize item payload")?;
                stmt.execute(params![batch.id, seq as i64, kind, id, json])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<BatchOperation>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_SQL),
                params![id],
                batch_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list(&self, filter: &BatchFilter, limit: u32) -> Result<Vec<BatchOperation>> {
        let mut sql = format!("{} WHERE 1=1", SELECT_SQL);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(account_id) = filter.account_id {
            args.push(Box::new(account_id));
            sql.push_str(&format!(" AND account_id = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(op) = filter.operation_type {
            args.push(Box::new(op.as_str().to_string()));
            sql.push_str(&format!(" AND operation_type = ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                batch_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Compare-and-swap status transition. Returns false when the batch
    /// was not in `from` (someone else moved it, or the edge is stale).
    pub fn transition(
        &self,
        id: &str,
        from: BatchStatus,
        to: BatchStatus,
        timestamp_column: Option<&str>,
    ) -> Result<bool> {
        let sql = match timestamp_column {
            Some(col) => format!(
                "UPDATE batch_operations SET status = ?1, {} = ?2 WHERE id = ?3 AND status = ?4",
                col
            ),
            None => {
                "UPDATE batch_operations SET status = ?1, finished_at = ?2 WHERE id = ?3 AND status = ?4"
                    .to_string()
            }
        };
        let changed = self.db.lock().execute(
            &sql,
            params![to.as_str(), Utc::now().to_rfc3339(), id, from.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_executed_by(&self, id: &str, executor: &str) -> Result<()> {
        self.db.lock().execute(
            "UPDATE batch_operations SET executed_by = ?2 WHERE id = ?1",
            params![id, executor],
        )?;
        Ok(())
    }

    pub fn items(&self, batch_id: &str) -> Result<Vec<BatchItem>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, batch_id, seq, payload_json, rollback_json, status,
                    error_message, executed_at
             FROM batch_items WHERE batch_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![batch_id], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_item_result(
        &self,
        item_id: i64,
        status: ItemStatus,
        error_message: Option<&str>,
        rollback: Option<&RollbackSnapshot>,
    ) -> Result<()> {
        let rollback_json = rollback
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize rollback snapshot")?;
        self.db.lock().execute(
            "UPDATE batch_items
             SET status = ?2, error_message = ?3, executed_at = ?4,
                 rollback_json = COALESCE(?5, rollback_json)
             WHERE id = ?1",
            params![
                item_id,
                status.as_str(),
                error_message,
                Utc::now().to_rfc3339(),
                rollback_json,
            ],
        )?;
        Ok(())
    }

    /// Refresh the per-status counters from the item rows.
    pub fn refresh_counts(&self, batch_id: &str) -> Result<()> {
        self.db.lock().execute(
            "UPDATE batch_operations SET
               success_items = (SELECT COUNT(*) FROM batch_items
                                WHERE batch_id = ?1 AND status = 'success'),
               failed_items = (SELECT COUNT(*) FROM batch_items
                               WHERE batch_id = ?1 AND status = 'failed'),
               skipped_items = (SELECT COUNT(*) FROM batch_items
                                WHERE batch_id = ?1 AND status = 'skipped')
             WHERE id = ?1",
            params![batch_id],
        )?;
        Ok(())
    }
}

const SELECT_SQL: &str = "SELECT id, account_id, owner, operation_type, name, description,
        requires_approval, source_type, source_task_id, status,
        total_items, success_items, failed_items, skipped_items,
        executed_by, created_at, approved_at, executed_at, finished_at
 FROM batch_operations";

fn parse_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    })
}

fn batch_from_row(r: &Row<'_>) -> rusqlite::Result<BatchOperation> {
    let operation_type: String = r.get(3)?;
    let source_type: String = r.get(7)?;
    let status: String = r.get(9)?;
    let created_at: String = r.get(15)?;
    Ok(BatchOperation {
        id: r.get(0)?,
        account_id: r.get(1)?,
        owner: r.get(2)?,
        operation_type: OperationType::parse(&operation_type)
            .unwrap_or(OperationType::BidAdjustment),
        name: r.get(4)?,
        description: r.get(5)?,
        requires_approval: r.get::<_, i64>(6)? != 0,
        source_type: BatchSourceType::parse(&source_type).unwrap_or(BatchSourceType::Manual),
        source_task_id: r.get(8)?,
        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Pending),
        total_items: r.get::<_, i64>(10)? as u32,
        success_items: r.get::<_, i64>(11)? as u32,
        failed_items: r.get::<_, i64>(12)? as u32,
        skipped_items: r.get::<_, i64>(13)? as u32,
        executed_by: r.get(14)?,
        created_at: parse_time(Some(created_at)).unwrap_or_else(Utc::now),
        approved_at: parse_time(r.get(16)?),
        executed_at: parse_time(r.get(17)?),
        finished_at: parse_time(r.get(18)?),
    })
}

fn item_from_row(r: &Row<'_>) -> rusqlite::Result<BatchItem> {
    let payload_json: String = r.get(3)?;
    let rollback_json: Option<String> = r.get(4)?;
    let status: String = r.get(5)?;
    let payload: ItemPayload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(BatchItem {
        id: r.get(0)?,
        batch_id: r.get(1)?,
        seq: r.get::<_, i64>(2)? as u32,
        payload,
        rollback: rollback_json.and_then(|j| serde_json::from_str(&j).ok()),
        status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Pending),
        error_message: r.get(6)?,
        executed_at: parse_time(r.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;

    fn store() -> BatchStore {
        BatchStore::new(Database::open_in_memory().unwrap())
    }

    fn new_batch(id: &str, status: BatchStatus) -> BatchOperation {
        BatchOperation {
            id: id.to_string(),
            account_id: Some(1),
            owner: "ops".into(),
            operation_type: OperationType::BidAdjustment,
            name: "adjustments".into(),
            description: String::new(),
            requires_approval: true,
            source_type: BatchSourceType::Manual,
            source_task_id: None,
            status,
            total_items: 0,
            success_items: 0,
            failed_items: 0,
            skipped_items: 0,
            executed_by: None,
            created_at: Utc::now(),
            approved_at: None,
            executed_at: None,
            finished_at: None,
        }
    }

    fn bid_payload(target_id: i64, new_bid: f64) -> ItemPayload {
        ItemPayload::BidAdjustment {
            target_id,
            target_type: TargetType::Keyword,
            new_bid,
            coordination_id: None,
            expected_profit_delta: None,
        }
    }

    #[test]
    fn test_create_persists_items_in_order() {
        let s = store();
        s.create(
            &new_batch("b1", BatchStatus::Pending),
            &[bid_payload(1, 0.8), bid_payload(2, 1.4)],
        )
        .unwrap();

        let batch = s.get("b1").unwrap().unwrap();
        assert_eq!(batch.total_items, 2);
        let items = s.items("b1").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].seq, 0);
        assert_eq!(items[1].seq, 1);
    }

    #[test]
    fn test_transition_is_compare_and_swap() {
        let s = store();
        s.create(&new_batch("b1", BatchStatus::Pending), &[bid_payload(1, 0.8)])
            .unwrap();

        assert!(s
            .transition("b1", BatchStatus::Pending, BatchStatus::Approved, Some("approved_at"))
            .unwrap());
        // Stale edge: no longer pending.
        assert!(!s
            .transition("b1", BatchStatus::Pending, BatchStatus::Cancelled, None)
            .unwrap());
        assert_eq!(s.get("b1").unwrap().unwrap().status, BatchStatus::Approved);
    }

    #[test]
    fn test_item_result_and_counts() {
        let s = store();
        s.create(
            &new_batch("b1", BatchStatus::Approved),
            &[bid_payload(1, 0.8), bid_payload(2, 1.4)],
        )
        .unwrap();
        let items = s.items("b1").unwrap();
        s.record_item_result(
            items[0].id,
            ItemStatus::Success,
            None,
            Some(&RollbackSnapshot::RestoreBid {
                target_id: 1,
                original_bid: 0.5,
            }),
        )
        .unwrap();
        s.record_item_result(items[1].id, ItemStatus::Failed, Some("target missing"), None)
            .unwrap();
        s.refresh_counts("b1").unwrap();

        let batch = s.get("b1").unwrap().unwrap();
        assert_eq!(batch.success_items, 1);
        assert_eq!(batch.failed_items, 1);
        assert_eq!(
            batch.success_items + batch.failed_items + batch.skipped_items,
            batch.total_items
        );

        let items = s.items("b1").unwrap();
        assert!(matches!(
            items[0].rollback,
            Some(RollbackSnapshot::RestoreBid { original_bid, .. }) if original_bid == 0.5
        ));
        assert_eq!(items[1].error_message.as_deref(), Some("target missing"));
    }
}
