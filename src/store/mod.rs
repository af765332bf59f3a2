//! SQLite persistence layer
//!
//! One WAL-mode connection shared by per-subsystem stores. Readers and
//! writers take the same mutex; critical sections are short and the
//! control loops run at minute granularity, so contention is not a
//! concern here.

pub mod batches;
pub mod history;
pub mod model_registry;
pub mod rules;
pub mod snapshots;
pub mod targets;
pub mod tasks;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;

pub use batches::BatchStore;
pub use history::HistoryStore;
pub use model_registry::ModelRegistry;
pub use rules::RuleStore;
pub use snapshots::SnapshotStore;
pub use targets::EntityStore;
pub use tasks::TaskStore;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    needs_reauth INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS performance_groups (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    goal TEXT NOT NULL,
    goal_value REAL
);

CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    daily_budget REAL NOT NULL,
    placement_top_pct INTEGER NOT NULL DEFAULT 0,
    placement_product_pct INTEGER NOT NULL DEFAULT 0,
    placement_rest_pct INTEGER NOT NULL DEFAULT 0,
    dayparting_enabled INTEGER NOT NULL DEFAULT 0,
    performance_group_id INTEGER,
    min_bid REAL NOT NULL DEFAULT 0.02,
    max_bid REAL NOT NULL DEFAULT 100.0,
    status TEXT NOT NULL DEFAULT 'enabled'
);

CREATE INDEX IF NOT EXISTS idx_campaigns_account ON campaigns(account_id, status);
CREATE INDEX IF NOT EXISTS idx_campaigns_group ON campaigns(performance_group_id);

CREATE TABLE IF NOT EXISTS targets (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    campaign_id INTEGER NOT NULL,
    ad_group_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    expression TEXT NOT NULL,
    match_type TEXT,
    bid REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'enabled'
);

CREATE INDEX IF NOT EXISTS idx_targets_campaign ON targets(campaign_id, status);
CREATE INDEX IF NOT EXISTS idx_targets_account ON targets(account_id);

CREATE TABLE IF NOT EXISTS negative_keywords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    campaign_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword TEXT NOT NULL,
    match_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_negatives_campaign ON negative_keywords(campaign_id);

CREATE TABLE IF NOT EXISTS performance_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    spend REAL NOT NULL DEFAULT 0,
    sales REAL NOT NULL DEFAULT 0,
    orders INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL,
    event_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_entity
    ON performance_snapshots(account_id, entity_kind, entity_id, date);
CREATE INDEX IF NOT EXISTS idx_snapshots_source
    ON performance_snapshots(account_id, source, date);

CREATE TABLE IF NOT EXISTS dayparting_schedule (
    campaign_id INTEGER NOT NULL,
    hour_of_week INTEGER NOT NULL,
    multiplier REAL NOT NULL,
    PRIMARY KEY (campaign_id, hour_of_week)
);

CREATE TABLE IF NOT EXISTS dayparting_overrides (
    campaign_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    hour INTEGER NOT NULL,
    multiplier REAL NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (campaign_id, date, hour)
);

CREATE TABLE IF NOT EXISTS bid_adjustment_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    previous_bid REAL NOT NULL,
    new_bid REAL NOT NULL,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    expected_profit_delta REAL,
    applied_by TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    is_rolled_back INTEGER NOT NULL DEFAULT 0,
    baseline_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_target
    ON bid_adjustment_history(target_id, applied_at DESC);
CREATE INDEX IF NOT EXISTS idx_history_account
    ON bid_adjustment_history(account_id, applied_at DESC);

CREATE TABLE IF NOT EXISTS effect_tracking (
    adjustment_id INTEGER PRIMARY KEY,
    actual_profit_7d REAL,
    actual_profit_14d REAL,
    actual_profit_30d REAL,
    actual_spend_7d REAL,
    actual_clicks_7d INTEGER,
    actual_conversions_7d INTEGER,
    tracked_at TEXT
);

CREATE TABLE IF NOT EXISTS coordination_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    campaign_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    original_bid REAL NOT NULL,
    final_bid REAL NOT NULL,
    theoretical_max_cpc REAL NOT NULL,
    effective_multiplier REAL NOT NULL,
    circuit_breaker_tripped INTEGER NOT NULL,
    reason TEXT NOT NULL,
    warnings_json TEXT NOT NULL,
    proposals_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_operations (
    id TEXT PRIMARY KEY,
    account_id INTEGER,
    owner TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    requires_approval INTEGER NOT NULL,
    source_type TEXT NOT NULL,
    source_task_id TEXT,
    status TEXT NOT NULL,
    total_items INTEGER NOT NULL DEFAULT 0,
    success_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    skipped_items INTEGER NOT NULL DEFAULT 0,
    executed_by TEXT,
    created_at TEXT NOT NULL,
    approved_at TEXT,
    executed_at TEXT,
    finished_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_batches_status ON batch_operations(status, created_at DESC);

CREATE TABLE IF NOT EXISTS batch_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    rollback_json TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    executed_at TEXT,
    FOREIGN KEY (batch_id) REFERENCES batch_operations(id)
);

CREATE INDEX IF NOT EXISTS idx_batch_items_batch ON batch_items(batch_id, seq);

CREATE TABLE IF NOT EXISTS rollback_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    profit_threshold_pct REAL NOT NULL,
    min_tracking_days INTEGER NOT NULL,
    min_sample_count INTEGER NOT NULL,
    include_negative_adjustments INTEGER NOT NULL DEFAULT 0,
    auto_rollback INTEGER NOT NULL DEFAULT 0,
    send_notification INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rollback_suggestions (
    id TEXT PRIMARY KEY,
    rule_id INTEGER NOT NULL,
    adjustment_id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    estimated_profit REAL NOT NULL,
    actual_profit REAL NOT NULL,
    drop_pct REAL NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    reviewed_at TEXT,
    executed_at TEXT,
    batch_id TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_suggestions_status
    ON rollback_suggestions(status, created_at DESC);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    schedule TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    auto_apply INTEGER NOT NULL DEFAULT 0,
    require_approval INTEGER NOT NULL DEFAULT 1,
    parameters_json TEXT NOT NULL,
    next_run TEXT,
    last_run TEXT
);

CREATE TABLE IF NOT EXISTS task_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    summary_json TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS curve_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    model_json TEXT NOT NULL,
    fitted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_curve_models_target
    ON curve_models(target_id, version DESC);

CREATE TABLE IF NOT EXISTS tree_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    model_json TEXT NOT NULL,
    trained_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tree_models_account
    ON tree_models(account_id, kind, version DESC);
"#;

/// Shared database handle. Cheap to clone; every subsystem store wraps
/// one of these.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        info!(path, "database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_applies_twice() {
        let db = Database::open_in_memory().unwrap();
        // Idempotent re-apply must not error.
        db.lock().execute_batch(SCHEMA_SQL).unwrap();
    }
}
