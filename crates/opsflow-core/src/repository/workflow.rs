//! Workflow repository trait definition.

use opsflow_types::error::RepositoryError;
use opsflow_types::workflow::Workflow;
use uuid::Uuid;

/// Repository trait for workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Persist a workflow. An existing `(organization_id, workflow_id,
    /// version)` row is replaced in place.
    fn create(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List workflows for a tenant, optionally restricted to enabled ones,
    /// newest first.
    fn list_by_org(
        &self,
        organization_id: Uuid,
        enabled_only: bool,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Get a workflow by its opaque handle.
    fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Get a workflow by its tenant-scoped human key; the most recent
    /// version wins.
    fn get_by_workflow_id(
        &self,
        organization_id: Uuid,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Flip the enabled flag. Returns false if the workflow does not exist.
    fn set_enabled(
        &self,
        organization_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

impl<T: WorkflowRepository> WorkflowRepository for std::sync::Arc<T> {
    async fn create(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.as_ref().create(workflow).await
    }

    async fn list_by_org(
        &self,
        organization_id: Uuid,
        enabled_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Workflow>, RepositoryError> {
        self.as_ref()
            .list_by_org(organization_id, enabled_only, limit, offset)
            .await
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Workflow>, RepositoryError> {
        self.as_ref().get(organization_id, id).await
    }

    async fn get_by_workflow_id(
        &self,
        organization_id: Uuid,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError> {
        self.as_ref()
            .get_by_workflow_id(organization_id, workflow_id)
            .await
    }

    async fn set_enabled(
        &self,
        organization_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<bool, RepositoryError> {
        self.as_ref().set_enabled(organization_id, id, enabled).await
    }
}
