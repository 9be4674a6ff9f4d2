//! SQLite event repository implementation.

use opsflow_core::repository::event::EventRepository;
use opsflow_types::error::RepositoryError;
use opsflow_types::event::Event;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `EventRepository`.
pub struct SqliteEventRepository {
    pool: DatabasePool,
}

impl SqliteEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Fetch one event row (used by tests and diagnostics).
    pub async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Event>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, organization_id, event_id, event_type, source, payload, received_at,
                    processed_at, triggered_workflows
             FROM events WHERE organization_id = ? AND id = ?",
        )
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| into_event(&row)).transpose()
    }
}

fn into_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, RepositoryError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let organization_id: String = row
        .try_get("organization_id")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let payload: String = row
        .try_get("payload")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let received_at: String = row
        .try_get("received_at")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let processed_at: Option<String> = row
        .try_get("processed_at")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let triggered: String = row
        .try_get("triggered_workflows")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let triggered_raw: Vec<String> = parse_json(&triggered, "triggered workflows")?;

    Ok(Event {
        id: parse_uuid(&id)?,
        organization_id: parse_uuid(&organization_id)?,
        event_id: row
            .try_get("event_id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        event_type: row
            .try_get("event_type")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        source: row
            .try_get("source")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        payload: parse_json(&payload, "event payload")?,
        received_at: parse_datetime(&received_at)?,
        processed_at: processed_at.as_deref().map(parse_datetime).transpose()?,
        triggered_workflows: triggered_raw
            .iter()
            .map(|s| parse_uuid(s))
            .collect::<Result<_, _>>()?,
    })
}

impl EventRepository for SqliteEventRepository {
    async fn create(&self, event: &Event) -> Result<(), RepositoryError> {
        let triggered: Vec<String> = event
            .triggered_workflows
            .iter()
            .map(Uuid::to_string)
            .collect();

        sqlx::query(
            r#"INSERT INTO events
                   (id, organization_id, event_id, event_type, source, payload, received_at,
                    processed_at, triggered_workflows)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.organization_id.to_string())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(to_json(&event.payload, "event payload")?)
        .bind(format_datetime(&event.received_at))
        .bind(event.processed_at.as_ref().map(format_datetime))
        .bind(to_json(&triggered, "triggered workflows")?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, event: &Event) -> Result<(), RepositoryError> {
        let triggered: Vec<String> = event
            .triggered_workflows
            .iter()
            .map(Uuid::to_string)
            .collect();

        let result = sqlx::query(
            "UPDATE events SET processed_at = ?, triggered_workflows = ?
             WHERE organization_id = ? AND id = ?",
        )
        .bind(event.processed_at.as_ref().map(format_datetime))
        .bind(to_json(&triggered, "triggered workflows")?)
        .bind(event.organization_id.to_string())
        .bind(event.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
