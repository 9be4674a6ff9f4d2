//! SQLite approval request repository implementation.

use chrono::{DateTime, Utc};
use opsflow_core::repository::approval::ApprovalRepository;
use opsflow_types::approval::{ApprovalRequest, ApprovalStatus};
use opsflow_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_enum, parse_uuid};

/// SQLite-backed implementation of `ApprovalRepository`.
pub struct SqliteApprovalRepository {
    pool: DatabasePool,
}

impl SqliteApprovalRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ApprovalRow {
    id: String,
    organization_id: String,
    request_id: String,
    execution_id: String,
    entity_type: String,
    entity_id: String,
    requester_id: String,
    approver_role: String,
    approver_id: Option<String>,
    status: String,
    reason: String,
    decision_reason: Option<String>,
    requested_at: String,
    decided_at: Option<String>,
    expires_at: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            request_id: row.try_get("request_id")?,
            execution_id: row.try_get("execution_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            requester_id: row.try_get("requester_id")?,
            approver_role: row.try_get("approver_role")?,
            approver_id: row.try_get("approver_id")?,
            status: row.try_get("status")?,
            reason: row.try_get("reason")?,
            decision_reason: row.try_get("decision_reason")?,
            requested_at: row.try_get("requested_at")?,
            decided_at: row.try_get("decided_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn into_request(self) -> Result<ApprovalRequest, RepositoryError> {
        let status: ApprovalStatus = parse_enum(&self.status, "approval status")?;
        Ok(ApprovalRequest {
            id: parse_uuid(&self.id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            request_id: self.request_id,
            execution_id: parse_uuid(&self.execution_id)?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            requester_id: self.requester_id,
            approver_role: self.approver_role,
            approver_id: self.approver_id,
            status,
            reason: self.reason,
            decision_reason: self.decision_reason,
            requested_at: parse_datetime(&self.requested_at)?,
            decided_at: self.decided_at.as_deref().map(parse_datetime).transpose()?,
            expires_at: self.expires_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    ApprovalRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_request()
}

// ---------------------------------------------------------------------------
// ApprovalRepository impl
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "id, organization_id, request_id, execution_id, entity_type, entity_id, requester_id, approver_role, approver_id, status, reason, decision_reason, requested_at, decided_at, expires_at";

impl ApprovalRepository for SqliteApprovalRepository {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO approval_requests
                   (id, organization_id, request_id, execution_id, entity_type, entity_id,
                    requester_id, approver_role, approver_id, status, reason, decision_reason,
                    requested_at, decided_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(request.id.to_string())
        .bind(request.organization_id.to_string())
        .bind(&request.request_id)
        .bind(request.execution_id.to_string())
        .bind(&request.entity_type)
        .bind(&request.entity_id)
        .bind(&request.requester_id)
        .bind(&request.approver_role)
        .bind(&request.approver_id)
        .bind(request.status.as_str())
        .bind(&request.reason)
        .bind(&request.decision_reason)
        .bind(format_datetime(&request.requested_at))
        .bind(request.decided_at.as_ref().map(format_datetime))
        .bind(request.expires_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE approval_requests SET
                   approver_id = ?, status = ?, decision_reason = ?, decided_at = ?, expires_at = ?
               WHERE organization_id = ? AND id = ?"#,
        )
        .bind(&request.approver_id)
        .bind(request.status.as_str())
        .bind(&request.decision_reason)
        .bind(request.decided_at.as_ref().map(format_datetime))
        .bind(request.expires_at.as_ref().map(format_datetime))
        .bind(request.organization_id.to_string())
        .bind(request.id.to_string())
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
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM approval_requests WHERE organization_id = ? AND id = ?"
        ))
        .bind(organization_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(map_row).transpose()
    }

    async fn get_by_request_id(
        &self,
        organization_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM approval_requests
             WHERE organization_id = ? AND request_id = ?"
        ))
        .bind(organization_id.to_string())
        .bind(request_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(map_row).transpose()
    }

    async fn get_expired(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM approval_requests
             WHERE organization_id = ? AND status = 'pending'
               AND expires_at IS NOT NULL AND expires_at < ?
             ORDER BY expires_at ASC LIMIT ?"
        ))
        .bind(organization_id.to_string())
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(map_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use chrono::TimeDelta;

    fn make_request(org: Uuid, expires_in_hours: i64) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: Uuid::now_v7(),
            organization_id: org,
            request_id: ApprovalRequest::display_id(),
            execution_id: Uuid::now_v7(),
            entity_type: "order".to_string(),
            entity_id: "o-1".to_string(),
            requester_id: "system".to_string(),
            approver_role: "finance".to_string(),
            approver_id: None,
            status: ApprovalStatus::Pending,
            reason: "high value".to_string(),
            decision_reason: None,
            requested_at: now,
            decided_at: None,
            expires_at: Some(now + TimeDelta::hours(expires_in_hours)),
        }
    }

    #[tokio::test]
    async fn test_create_get_and_decide() {
        let (_dir, pool) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);
        let org = Uuid::now_v7();
        let mut request = make_request(org, 24);
        repo.create(&request).await.unwrap();

        let by_display = repo
            .get_by_request_id(org, &request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_display.id, request.id);
        assert_eq!(by_display.status, ApprovalStatus::Pending);

        request.status = ApprovalStatus::Approved;
        request.approver_id = Some("amy".to_string());
        request.decision_reason = Some("fine".to_string());
        request.decided_at = Some(Utc::now());
        repo.update(&request).await.unwrap();

        let decided = repo.get(org, request.id).await.unwrap().unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.approver_id.as_deref(), Some("amy"));
    }

    #[tokio::test]
    async fn test_get_expired_filters_pending_only() {
        let (_dir, pool) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);
        let org = Uuid::now_v7();

        let overdue = make_request(org, -1);
        let fresh = make_request(org, 24);
        let mut decided = make_request(org, -2);
        decided.status = ApprovalStatus::Rejected;

        repo.create(&overdue).await.unwrap();
        repo.create(&fresh).await.unwrap();
        repo.create(&decided).await.unwrap();
        // Flip the decided row's status in place.
        repo.update(&decided).await.unwrap();

        let expired = repo.get_expired(org, Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let (_dir, pool) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);
        let request = make_request(Uuid::now_v7(), 24);
        repo.create(&request).await.unwrap();

        let other_org = Uuid::now_v7();
        assert!(repo.get(other_org, request.id).await.unwrap().is_none());
        assert!(
            repo.get_by_request_id(other_org, &request.request_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
