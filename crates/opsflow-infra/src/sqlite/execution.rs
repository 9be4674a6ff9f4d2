//! SQLite execution repository implementation.
//!
//! Executions are wide rows (status, result, deadline, pause and wait
//! state) plus append-mostly step trace rows. Status transitions that must
//! be race-safe (resume, sweep, cancel) are single guarded UPDATEs keyed
//! on the current status, so already-terminal rows are never modified.

use chrono::{DateTime, Utc};
use opsflow_core::repository::execution::ExecutionRepository;
use opsflow_types::ContextMap;
use opsflow_types::error::RepositoryError;
use opsflow_types::execution::{
    Execution, ExecutionResult, ExecutionStatus, StepExecution, StepExecutionStatus, WaitState,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{enum_str, format_datetime, parse_datetime, parse_enum, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    organization_id: String,
    execution_id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    result: Option<String>,
    trigger_event: String,
    trigger_payload: String,
    context: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    timeout_at: Option<String>,
    timeout_duration: Option<i64>,
    paused_at: Option<String>,
    paused_reason: Option<String>,
    paused_step_id: Option<String>,
    next_step_id: Option<String>,
    resume_data: String,
    resume_count: i64,
    last_resumed_at: Option<String>,
    current_step_id: Option<String>,
    wait_state: Option<String>,
    error_message: Option<String>,
    metadata: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            trigger_event: row.try_get("trigger_event")?,
            trigger_payload: row.try_get("trigger_payload")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            timeout_at: row.try_get("timeout_at")?,
            timeout_duration: row.try_get("timeout_duration")?,
            paused_at: row.try_get("paused_at")?,
            paused_reason: row.try_get("paused_reason")?,
            paused_step_id: row.try_get("paused_step_id")?,
            next_step_id: row.try_get("next_step_id")?,
            resume_data: row.try_get("resume_data")?,
            resume_count: row.try_get("resume_count")?,
            last_resumed_at: row.try_get("last_resumed_at")?,
            current_step_id: row.try_get("current_step_id")?,
            wait_state: row.try_get("wait_state")?,
            error_message: row.try_get("error_message")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = parse_enum(&self.status, "execution status")?;
        let result: Option<ExecutionResult> = self
            .result
            .as_deref()
            .map(|r| parse_enum(r, "execution result"))
            .transpose()?;
        let wait_state: Option<WaitState> = self
            .wait_state
            .as_deref()
            .map(|w| parse_json(w, "wait state"))
            .transpose()?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            execution_id: self.execution_id,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            status,
            result,
            trigger_event: self.trigger_event,
            trigger_payload: parse_json(&self.trigger_payload, "trigger payload")?,
            context: parse_json(&self.context, "context")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: self.duration_ms,
            timeout_at: self.timeout_at.as_deref().map(parse_datetime).transpose()?,
            timeout_duration: self.timeout_duration,
            paused_at: self.paused_at.as_deref().map(parse_datetime).transpose()?,
            paused_reason: self.paused_reason,
            paused_step_id: self.paused_step_id,
            next_step_id: self.next_step_id,
            resume_data: parse_json(&self.resume_data, "resume data")?,
            resume_count: self.resume_count,
            last_resumed_at: self
                .last_resumed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            current_step_id: self.current_step_id,
            wait_state,
            error_message: self.error_message,
            metadata: parse_json(&self.metadata, "metadata")?,
        })
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, RepositoryError> {
    ExecutionRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_execution()
}

struct StepRow {
    id: String,
    organization_id: String,
    execution_id: String,
    step_id: String,
    step_type: String,
    status: String,
    input: String,
    output: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            step_type: row.try_get("step_type")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        let status: StepExecutionStatus = parse_enum(&self.status, "step status")?;
        let input: ContextMap = parse_json(&self.input, "step input")?;
        let output: Option<serde_json::Value> = self
            .output
            .as_deref()
            .map(|o| parse_json(o, "step output"))
            .transpose()?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            step_type: self.step_type,
            status,
            input,
            output,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "id, organization_id, execution_id, workflow_id, workflow_name, status, result, trigger_event, trigger_payload, context, started_at, completed_at, duration_ms, timeout_at, timeout_duration, paused_at, paused_reason, paused_step_id, next_step_id, resume_data, resume_count, last_resumed_at, current_step_id, wait_state, error_message, metadata";

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
                   (id, organization_id, execution_id, workflow_id, workflow_name, status, result,
                    trigger_event, trigger_payload, context, started_at, completed_at, duration_ms,
                    timeout_at, timeout_duration, paused_at, paused_reason, paused_step_id,
                    next_step_id, resume_data, resume_count, last_resumed_at, current_step_id,
                    wait_state, error_message, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.organization_id.to_string())
        .bind(&execution.execution_id)
        .bind(execution.workflow_id.to_string())
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(execution.result.as_ref().map(enum_str))
        .bind(&execution.trigger_event)
        .bind(to_json(&execution.trigger_payload, "trigger payload")?)
        .bind(to_json(&execution.context, "context")?)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_ms)
        .bind(execution.timeout_at.as_ref().map(format_datetime))
        .bind(execution.timeout_duration)
        .bind(execution.paused_at.as_ref().map(format_datetime))
        .bind(&execution.paused_reason)
        .bind(&execution.paused_step_id)
        .bind(&execution.next_step_id)
        .bind(to_json(&execution.resume_data, "resume data")?)
        .bind(execution.resume_count)
        .bind(execution.last_resumed_at.as_ref().map(format_datetime))
        .bind(&execution.current_step_id)
        .bind(
            execution
                .wait_state
                .as_ref()
                .map(|w| to_json(w, "wait state"))
                .transpose()?,
        )
        .bind(&execution.error_message)
        .bind(to_json(&execution.metadata, "metadata")?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET
                   status = ?, result = ?, context = ?, completed_at = ?, duration_ms = ?,
                   timeout_at = ?, timeout_duration = ?, paused_at = ?, paused_reason = ?,
                   paused_step_id = ?, next_step_id = ?, resume_data = ?, resume_count = ?,
                   last_resumed_at = ?, current_step_id = ?, wait_state = ?, error_message = ?,
                   metadata = ?
               WHERE organization_id = ? AND id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(execution.result.as_ref().map(enum_str))
        .bind(to_json(&execution.context, "context")?)
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_ms)
        .bind(execution.timeout_at.as_ref().map(format_datetime))
        .bind(execution.timeout_duration)
        .bind(execution.paused_at.as_ref().map(format_datetime))
        .bind(&execution.paused_reason)
        .bind(&execution.paused_step_id)
        .bind(&execution.next_step_id)
        .bind(to_json(&execution.resume_data, "resume data")?)
        .bind(execution.resume_count)
        .bind(execution.last_resumed_at.as_ref().map(format_datetime))
        .bind(&execution.current_step_id)
        .bind(
            execution
                .wait_state
                .as_ref()
                .map(|w| to_json(w, "wait state"))
                .transpose()?,
        )
        .bind(&execution.error_message)
        .bind(to_json(&execution.metadata, "metadata")?)
        .bind(execution.organization_id.to_string())
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM executions WHERE organization_id = ? AND id = ?"
        ))
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(map_row).transpose()
    }

    async fn try_transition(
        &self,
        organization_id: Uuid,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE executions SET status = ?
             WHERE organization_id = ? AND id = ? AND status IN ({placeholders})
               AND status NOT IN ('completed', 'failed', 'cancelled')"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(organization_id.to_string())
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_timed_out(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM executions
             WHERE organization_id = ?
               AND timeout_at IS NOT NULL AND timeout_at < ?
               AND status IN ('running', 'waiting')
             ORDER BY timeout_at ASC LIMIT ?"
        ))
        .bind(organization_id.to_string())
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(map_row).collect()
    }

    async fn get_paused(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM executions
             WHERE organization_id = ? AND status = 'paused'
             ORDER BY paused_at ASC LIMIT ?"
        ))
        .bind(organization_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(map_row).collect()
    }

    async fn cancel(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<bool, RepositoryError> {
        // Guarded flip first; terminal rows are left untouched.
        let result = sqlx::query(
            "UPDATE executions SET status = 'cancelled'
             WHERE organization_id = ? AND id = ?
               AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        // Stamp the terminal fields for the row this call transitioned.
        if let Some(mut execution) = self.get(organization_id, id).await? {
            let now = Utc::now();
            execution.completed_at = Some(now);
            execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
            self.update(&execution).await?;
        }
        Ok(true)
    }

    async fn list_active_orgs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT DISTINCT organization_id FROM executions
             WHERE status IN ('running', 'waiting', 'paused')
             ORDER BY organization_id",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("organization_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&raw)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Step trace rows
    // -----------------------------------------------------------------------

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_executions
                   (id, organization_id, execution_id, step_id, step_type, status, input, output,
                    started_at, completed_at, duration_ms, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.organization_id.to_string())
        .bind(step.execution_id.to_string())
        .bind(&step.step_id)
        .bind(&step.step_type)
        .bind(step.status.as_str())
        .bind(to_json(&step.input, "step input")?)
        .bind(
            step.output
                .as_ref()
                .map(|o| to_json(o, "step output"))
                .transpose()?,
        )
        .bind(format_datetime(&step.started_at))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms)
        .bind(&step.error_message)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE step_executions SET
                   status = ?, output = ?, completed_at = ?, duration_ms = ?, error_message = ?
               WHERE organization_id = ? AND id = ?"#,
        )
        .bind(step.status.as_str())
        .bind(
            step.output
                .as_ref()
                .map(|o| to_json(o, "step output"))
                .transpose()?,
        )
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms)
        .bind(&step.error_message)
        .bind(step.organization_id.to_string())
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_steps(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, organization_id, execution_id, step_id, step_type, status, input, output,
                    started_at, completed_at, duration_ms, error_message
             FROM step_executions
             WHERE organization_id = ? AND execution_id = ?
             ORDER BY started_at ASC",
        )
        .bind(organization_id.to_string())
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                StepRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_step()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
