//! Approval request repository trait definition.

use chrono::{DateTime, Utc};
use opsflow_types::approval::ApprovalRequest;
use opsflow_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for approval gate records.
pub trait ApprovalRepository: Send + Sync {
    fn create(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full-row update keyed by `(organization_id, id)`.
    fn update(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Look up by the opaque display id.
    fn get_by_request_id(
        &self,
        organization_id: Uuid,
        request_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Pending requests whose `expires_at` is in the past, oldest first.
    fn get_expired(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;
}

impl<T: ApprovalRepository> ApprovalRepository for std::sync::Arc<T> {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        self.as_ref().create(request).await
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        self.as_ref().update(request).await
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        self.as_ref().get(organization_id, id).await
    }

    async fn get_by_request_id(
        &self,
        organization_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        self.as_ref()
            .get_by_request_id(organization_id, request_id)
            .await
    }

    async fn get_expired(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        self.as_ref().get_expired(organization_id, now, limit).await
    }
}
