//! Task executions and their steps.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

use super::Store;

/// Lifecycle status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl ExecutionStatus {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Paused => "paused",
        }
    }

    /// Parse from the stored column value.
    pub fn parse(text: &str) -> Self {
        match text {
            "pending" => ExecutionStatus::Pending,
            "in_progress" => ExecutionStatus::InProgress,
            "completed" => ExecutionStatus::Completed,
            "paused" => ExecutionStatus::Paused,
            _ => ExecutionStatus::Failed,
        }
    }

    /// Whether this status blocks another execution for the same
    /// `(entity_id, task_type)`.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::InProgress)
    }
}

/// One run of a step template against an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_type: String,
    pub entity_id: Option<i64>,
    /// Snapshot of the template's step prompt at start time.
    pub step_prompt: String,
    pub initial_context: Option<String>,
    pub current_step: i64,
    pub max_step: i64,
    pub retry_count: i64,
    pub status: ExecutionStatus,
    pub executor_agent_id: Option<i64>,
    pub checker_agent_id: Option<i64>,
    pub config: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskExecution {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let config: Option<String> = row.get("config")?;
        Ok(Self {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            entity_id: row.get("entity_id")?,
            step_prompt: row.get("step_prompt")?,
            initial_context: row.get("initial_context")?,
            current_step: row.get("current_step")?,
            max_step: row.get("max_step")?,
            retry_count: row.get("retry_count")?,
            status: ExecutionStatus::parse(&status),
            executor_agent_id: row.get("executor_agent_id")?,
            checker_agent_id: row.get("checker_agent_id")?,
            config: config.and_then(|c| serde_json::from_str(&c).ok()),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// One persisted step of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionStep {
    pub id: i64,
    pub execution_id: i64,
    pub step_number: i64,
    /// Instruction after placeholder interpolation.
    pub step_instruction: String,
    pub step_output: String,
    pub validation_result: Option<Value>,
    pub attempt_count: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskExecutionStep {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let validation: Option<String> = row.get("validation_result")?;
        Ok(Self {
            id: row.get("id")?,
            execution_id: row.get("execution_id")?,
            step_number: row.get("step_number")?,
            step_instruction: row.get("step_instruction")?,
            step_output: row.get("step_output")?,
            validation_result: validation.and_then(|v| serde_json::from_str(&v).ok()),
            attempt_count: row.get("attempt_count")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Fields needed to create an execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_type: String,
    pub entity_id: Option<i64>,
    pub step_prompt: String,
    pub initial_context: Option<String>,
    pub max_step: i64,
    pub executor_agent_id: Option<i64>,
    pub checker_agent_id: Option<i64>,
    pub config: Option<Value>,
}

impl Store {
    /// Create a pending execution.
    ///
    /// Rejects with [`OrchestratorError::UniquenessViolation`] when an
    /// active execution already exists for `(entity_id, task_type)`.
    pub fn create_execution(&self, new: &NewExecution) -> Result<i64> {
        self.with_tx(|tx| {
            if let Some(entity_id) = new.entity_id {
                let active: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM task_executions
                         WHERE entity_id = ?1 AND task_type = ?2
                           AND status IN ('pending', 'in_progress')",
                        params![entity_id, new.task_type],
                        |row| row.get(0),
                    )
                    .optional()?;
                if active.is_some() {
                    return Err(OrchestratorError::UniquenessViolation {
                        entity_id: new.entity_id,
                        task_type: new.task_type.clone(),
                    });
                }
            }
            let now = Store::now();
            tx.execute(
                "INSERT INTO task_executions (
                     task_type, entity_id, step_prompt, initial_context,
                     current_step, max_step, retry_count, status,
                     executor_agent_id, checker_agent_id, config,
                     created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, 0, ?5, 0, 'pending', ?6, ?7, ?8, ?9, ?9)",
                params![
                    new.task_type,
                    new.entity_id,
                    new.step_prompt,
                    new.initial_context,
                    new.max_step,
                    new.executor_agent_id,
                    new.checker_agent_id,
                    new.config.as_ref().map(|c| c.to_string()),
                    now,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Fetch an execution by id.
    pub fn execution_by_id(&self, id: i64) -> Result<TaskExecution> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM task_executions WHERE id = ?1",
                params![id],
                TaskExecution::from_row,
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "task execution",
                name: id.to_string(),
            })
        })
    }

    /// Update an execution's status.
    pub fn set_execution_status(&self, id: i64, status: ExecutionStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_executions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Store::now(), id],
            )?;
            Ok(())
        })
    }

    /// Advance `current_step` and accumulate retries.
    pub fn advance_execution(&self, id: i64, current_step: i64, retries: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_executions
                 SET current_step = ?1, retry_count = retry_count + ?2, updated_at = ?3
                 WHERE id = ?4",
                params![current_step, retries, Store::now(), id],
            )?;
            Ok(())
        })
    }

    /// Persist one completed (or failed) step, replacing any earlier
    /// record of the same step number in the same transaction.
    pub fn record_execution_step(&self, step: &TaskExecutionStep) -> Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM task_execution_steps
                 WHERE execution_id = ?1 AND step_number = ?2",
                params![step.execution_id, step.step_number],
            )?;
            tx.execute(
                "INSERT INTO task_execution_steps (
                     execution_id, step_number, step_instruction, step_output,
                     validation_result, attempt_count, started_at, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.execution_id,
                    step.step_number,
                    step.step_instruction,
                    step.step_output,
                    step.validation_result.as_ref().map(|v| v.to_string()),
                    step.attempt_count,
                    step.started_at,
                    step.completed_at,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// All steps of an execution, ordered by step number.
    pub fn execution_steps(&self, execution_id: i64) -> Result<Vec<TaskExecutionStep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_execution_steps
                 WHERE execution_id = ?1 ORDER BY step_number ASC",
            )?;
            let rows = stmt.query_map(params![execution_id], TaskExecutionStep::from_row)?;
            let mut steps = Vec::new();
            for row in rows {
                steps.push(row?);
            }
            Ok(steps)
        })
    }

    /// One step of an execution by number, if recorded.
    pub fn execution_step(
        &self,
        execution_id: i64,
        step_number: i64,
    ) -> Result<Option<TaskExecutionStep>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM task_execution_steps
                     WHERE execution_id = ?1 AND step_number = ?2",
                    params![execution_id, step_number],
                    TaskExecutionStep::from_row,
                )
                .optional()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_execution(entity: Option<i64>) -> NewExecution {
        NewExecution {
            task_type: "story_generation".into(),
            entity_id: entity,
            step_prompt: "1. Outline\n2. Write".into(),
            initial_context: None,
            max_step: 2,
            executor_agent_id: None,
            checker_agent_id: None,
            config: None,
        }
    }

    #[test]
    fn test_create_and_fetch_execution() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create_execution(&new_execution(Some(7))).unwrap();
        let exec = store.execution_by_id(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.entity_id, Some(7));
        assert_eq!(exec.current_step, 0);
        assert_eq!(exec.max_step, 2);
    }

    #[test]
    fn test_second_active_execution_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.create_execution(&new_execution(Some(7))).unwrap();
        let err = store.create_execution(&new_execution(Some(7))).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UniquenessViolation { entity_id: Some(7), .. }
        ));
    }

    #[test]
    fn test_completed_execution_frees_the_slot() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create_execution(&new_execution(Some(7))).unwrap();
        store
            .set_execution_status(id, ExecutionStatus::Completed)
            .unwrap();
        store.create_execution(&new_execution(Some(7))).unwrap();
    }

    #[test]
    fn test_different_entities_do_not_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.create_execution(&new_execution(Some(7))).unwrap();
        store.create_execution(&new_execution(Some(8))).unwrap();
        store.create_execution(&new_execution(None)).unwrap();
        store.create_execution(&new_execution(None)).unwrap();
    }

    #[test]
    fn test_step_record_and_replace() {
        let store = Store::open_in_memory().unwrap();
        let exec_id = store.create_execution(&new_execution(Some(1))).unwrap();

        let mut step = TaskExecutionStep {
            id: 0,
            execution_id: exec_id,
            step_number: 1,
            step_instruction: "Write outline".into(),
            step_output: "first try".into(),
            validation_result: Some(serde_json::json!({"valid": false})),
            attempt_count: 1,
            started_at: Some(Store::now()),
            completed_at: None,
        };
        store.record_execution_step(&step).unwrap();

        step.step_output = "second try".into();
        step.attempt_count = 2;
        step.validation_result = Some(serde_json::json!({"valid": true}));
        store.record_execution_step(&step).unwrap();

        let steps = store.execution_steps(exec_id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_output, "second try");
        assert_eq!(steps[0].attempt_count, 2);
        assert_eq!(steps[0].validation_result.as_ref().unwrap()["valid"], true);
    }

    #[test]
    fn test_steps_cascade_delete_with_execution() {
        let store = Store::open_in_memory().unwrap();
        let exec_id = store.create_execution(&new_execution(Some(1))).unwrap();
        store
            .record_execution_step(&TaskExecutionStep {
                id: 0,
                execution_id: exec_id,
                step_number: 1,
                step_instruction: "x".into(),
                step_output: "y".into(),
                validation_result: None,
                attempt_count: 1,
                started_at: None,
                completed_at: None,
            })
            .unwrap();

        store
            .with_conn(|conn| {
                conn.execute("DELETE FROM task_executions WHERE id = ?1", params![exec_id])?;
                Ok(())
            })
            .unwrap();

        let steps = store.execution_steps(exec_id).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn test_advance_execution_accumulates_retries() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create_execution(&new_execution(Some(1))).unwrap();
        store.advance_execution(id, 1, 2).unwrap();
        store.advance_execution(id, 2, 1).unwrap();
        let exec = store.execution_by_id(id).unwrap();
        assert_eq!(exec.current_step, 2);
        assert_eq!(exec.retry_count, 3);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::InProgress,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Paused,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), status);
        }
    }
}
