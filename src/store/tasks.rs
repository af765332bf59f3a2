//! Scheduled task registry
//!
//! Task parameters are a tagged union, one variant per task type; the
//! scheduler refuses to run a row whose parameters fail to decode rather
//! than guessing.

use crate::store::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// What a task does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskParameters {
    UnifiedOptimization {
        account_id: i64,
        #[serde(default)]
        campaign_ids: Option<Vec<i64>>,
        #[serde(default)]
        performance_group_ids: Option<Vec<i64>>,
    },
    EffectTracking {
        period_days: i64,
    },
    RollbackEvaluation {
        #[serde(default)]
        account_id: Option<i64>,
    },
    PacingCheck {
        account_id: i64,
    },
    ConsistencyCheck {
        account_id: i64,
        lookback_days: i64,
    },
}

impl TaskParameters {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskParameters::UnifiedOptimization { .. } => "unified_optimization",
            TaskParameters::EffectTracking { .. } => "effect_tracking",
            TaskParameters::RollbackEvaluation { .. } => "rollback_evaluation",
            TaskParameters::PacingCheck { .. } => "pacing_check",
            TaskParameters::ConsistencyCheck { .. } => "consistency_check",
        }
    }
}

/// How often a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    EveryMinutes { minutes: i64 },
    DailyAt { hour: u32, minute: u32 },
}

impl Schedule {
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::EveryMinutes { minutes } => after + chrono::Duration::minutes(*minutes),
            Schedule::DailyAt { hour, minute } => {
                let today = match after.date_naive().and_hms_opt(*hour, *minute, 0) {
                    Some(t) => t.and_utc(),
                    // Out-of-range run time: fall back to a day from now.
                    None => return after + chrono::Duration::days(1),
                };
                if today > after {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub schedule: Schedule,
    pub enabled: bool,
    pub auto_apply: bool,
    pub require_approval: bool,
    pub parameters: TaskParameters,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub summary_json: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        parameters: &TaskParameters,
        schedule: Schedule,
        enabled: bool,
        auto_apply: bool,
        require_approval: bool,
    ) -> Result<i64> {
        let next_run = schedule.next_after(Utc::now());
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO scheduled_tasks
               (task_type, schedule, enabled, auto_apply, require_approval,
                parameters_json, next_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                parameters.task_type(),
                serde_json::to_string(&schedule)?,
                enabled as i64,
                auto_apply as i64,
                require_approval as i64,
                serde_json::to_string(parameters)?,
                next_run.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<ScheduledTask>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", TASK_SELECT),
                params![id],
                task_from_row,
            )
            .optional()
            .context("failed to read scheduled task")?;
        Ok(row.flatten())
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.db.lock().execute(
            "UPDATE scheduled_tasks SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    /// Enabled tasks whose `next_run` is due. Malformed rows are skipped,
    /// not fatal.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run",
            TASK_SELECT
        ))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Advance `next_run` past `now` and stamp `last_run`.
    pub fn mark_fired(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<()> {
        let next = task.schedule.next_after(now);
        self.db.lock().execute(
            "UPDATE scheduled_tasks SET next_run = ?2, last_run = ?3 WHERE id = ?1",
            params![task.id, next.to_rfc3339(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn start_execution(&self, task_id: i64) -> Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO task_executions (task_id, started_at, status)
             VALUES (?1, ?2, 'running')",
            params![task_id, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        summary_json: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.db.lock().execute(
            "UPDATE task_executions
             SET finished_at = ?2, status = ?3, summary_json = ?4, error = ?5
             WHERE id = ?1",
            params![
                execution_id,
                Utc::now().to_rfc3339(),
                status.as_str(),
                summary_json,
                error,
            ],
        )?;
        Ok(())
    }

    pub fn executions(&self, task_id: i64, limit: u32) -> Result<Vec<TaskExecution>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, task_id, started_at, finished_at, status, summary_json, error
             FROM task_executions WHERE task_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], |r| {
                let started_at: String = r.get(2)?;
                let finished_at: Option<String> = r.get(3)?;
                let status: String = r.get(4)?;
                Ok(TaskExecution {
                    id: r.get(0)?,
                    task_id: r.get(1)?,
                    started_at: DateTime::parse_from_rfc3339(&started_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    finished_at: finished_at.and_then(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .ok()
                            .map(|d| d.with_timezone(&Utc))
                    }),
                    status: match status.as_str() {
                        "succeeded" => ExecutionStatus::Succeeded,
                        "failed" => ExecutionStatus::Failed,
                        _ => ExecutionStatus::Running,
                    },
                    summary_json: r.get(5)?,
                    error: r.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

const TASK_SELECT: &str = "SELECT id, schedule, enabled, auto_apply, require_approval,
        parameters_json, next_run, last_run
 FROM scheduled_tasks";

fn task_from_row(r: &Row<'_>) -> rusqlite::Result<Option<ScheduledTask>> {
    let schedule_json: String = r.get(1)?;
    let parameters_json: String = r.get(5)?;
    let next_run: Option<String> = r.get(6)?;
    let last_run: Option<String> = r.get(7)?;

    let schedule = match serde_json::from_str(&schedule_json) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    let parameters = match serde_json::from_str(&parameters_json) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    let parse = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    };
    Ok(Some(ScheduledTask {
        id: r.get(0)?,
        schedule,
        enabled: r.get::<_, i64>(2)? != 0,
        auto_apply: r.get::<_, i64>(3)? != 0,
        require_approval: r.get::<_, i64>(4)? != 0,
        parameters,
        next_run: next_run.and_then(parse),
        last_run: last_run.and_then(parse),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_tagged_parameters_roundtrip() {
        let s = store();
        let params = TaskParameters::ConsistencyCheck {
            account_id: 7,
            lookback_days: 14,
        };
        let id = s
            .create(&params, Schedule::EveryMinutes { minutes: 30 }, true, false, true)
            .unwrap();
        let task = s.get(id).unwrap().unwrap();
        assert_eq!(task.parameters, params);
        assert_eq!(task.schedule, Schedule::EveryMinutes { minutes: 30 });
    }

    #[test]
    fn test_due_and_mark_fired() {
        let s = store();
        let id = s
            .create(
                &TaskParameters::EffectTracking { period_days: 7 },
                Schedule::EveryMinutes { minutes: 60 },
                true,
                true,
                false,
            )
            .unwrap();

        // Not due yet: next_run is one interval in the future.
        assert!(s.due(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::minutes(61);
        let due = s.due(later).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        s.mark_fired(&due[0], later).unwrap();
        assert!(s.due(later).unwrap().is_empty());
        assert!(s.get(id).unwrap().unwrap().last_run.is_some());
    }

    #[test]
    fn test_daily_schedule_rolls_over() {
        let schedule = Schedule::DailyAt { hour: 3, minute: 0 };
        let at_4am = chrono::NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(4, 0, 0)
            .unwrap()
            .and_utc();
        let next = schedule.next_after(at_4am);
        assert_eq!(next.date_naive(), at_4am.date_naive() + chrono::Duration::days(1));
    }

    #[test]
    fn test_execution_records() {
        let s = store();
        let task_id = s
            .create(
                &TaskParameters::RollbackEvaluation { account_id: None },
                Schedule::DailyAt { hour: 2, minute: 0 },
                true,
                false,
                true,
            )
            .unwrap();
        let exec_id = s.start_execution(task_id).unwrap();
        s.finish_execution(exec_id, ExecutionStatus::Failed, None, Some("db locked"))
            .unwrap();
        let execs = s.executions(task_id, 10).unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].status, ExecutionStatus::Failed);
        assert_eq!(execs[0].error.as_deref(), Some("db locked"));
    }
}
