//! SQLite workflow repository implementation.
//!
//! Workflow definitions are stored as JSON blobs keyed by the opaque id,
//! with the tenant-scoped human key `(organization_id, workflow_id,
//! version)` upserted in place. Lookups by human key return the most
//! recently created version.

use chrono::Utc;
use opsflow_core::repository::workflow::WorkflowRepository;
use opsflow_types::error::RepositoryError;
use opsflow_types::workflow::{Workflow, WorkflowDefinition};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    organization_id: String,
    workflow_id: String,
    version: String,
    name: String,
    definition: String,
    enabled: bool,
    tags: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            definition: row.try_get("definition")?,
            enabled: row.try_get("enabled")?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let definition: WorkflowDefinition = parse_json(&self.definition, "workflow definition")?;
        Ok(Workflow {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            workflow_id: self.workflow_id,
            version: self.version,
            name: self.name,
            definition,
            enabled: self.enabled,
            tags: parse_json(&self.tags, "workflow tags")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
    WorkflowRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_workflow()
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "id, organization_id, workflow_id, version, name, definition, enabled, tags, created_at, updated_at";

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let definition = to_json(&workflow.definition, "workflow definition")?;
        let tags = to_json(&workflow.tags, "workflow tags")?;

        sqlx::query(
            r#"INSERT INTO workflows
                   (id, organization_id, workflow_id, version, name, definition, enabled, tags, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(organization_id, workflow_id, version) DO UPDATE SET
                   name = excluded.name,
                   definition = excluded.definition,
                   enabled = excluded.enabled,
                   tags = excluded.tags,
                   updated_at = excluded.updated_at"#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.organization_id.to_string())
        .bind(&workflow.workflow_id)
        .bind(&workflow.version)
        .bind(&workflow.name)
        .bind(&definition)
        .bind(workflow.enabled)
        .bind(&tags)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_by_org(
        &self,
        organization_id: Uuid,
        enabled_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Workflow>, RepositoryError> {
        let sql = if enabled_only {
            format!(
                "SELECT {SELECT_COLUMNS} FROM workflows
                 WHERE organization_id = ? AND enabled = 1
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            )
        } else {
            format!(
                "SELECT {SELECT_COLUMNS} FROM workflows
                 WHERE organization_id = ?
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            )
        };

        let rows = sqlx::query(&sql)
            .bind(organization_id.to_string())
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(map_row).collect()
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM workflows WHERE organization_id = ? AND id = ?"
        ))
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(map_row).transpose()
    }

    async fn get_by_workflow_id(
        &self,
        organization_id: Uuid,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM workflows
             WHERE organization_id = ? AND workflow_id = ?
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(organization_id.to_string())
        .bind(workflow_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(map_row).transpose()
    }

    async fn set_enabled(
        &self,
        organization_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflows SET enabled = ?, updated_at = ? WHERE organization_id = ? AND id = ?",
        )
        .bind(enabled)
        .bind(format_datetime(&Utc::now()))
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
