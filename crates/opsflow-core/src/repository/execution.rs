//! Execution repository trait definition.
//!
//! Covers the execution rows themselves plus their per-step trace rows.
//! The guarded `try_transition` is the concurrency primitive the kernel
//! relies on: resume and sweep both go through it so that double-resume
//! and already-terminal rows are rejected at the store, not by callers.

use chrono::{DateTime, Utc};
use opsflow_types::error::RepositoryError;
use opsflow_types::execution::{Execution, ExecutionStatus, StepExecution};
use uuid::Uuid;

/// Repository trait for executions and their step trace rows.
pub trait ExecutionRepository: Send + Sync {
    fn create(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full-row update keyed by `(organization_id, id)`.
    fn update(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Compare-and-set the status. Returns true iff the row existed and its
    /// status was one of `from`; terminal rows are never modified.
    fn try_transition(
        &self,
        organization_id: Uuid,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Executions whose deadline elapsed: `timeout_at < now` and status in
    /// {running, waiting}, ascending by `timeout_at`, at most `limit` rows.
    fn get_timed_out(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Paused executions for a tenant, oldest pause first.
    fn get_paused(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Guarded manual cancellation: non-terminal -> cancelled. Returns true
    /// iff the row was transitioned by this call.
    fn cancel(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Distinct organization ids with at least one non-terminal execution.
    /// Drives the sweeper's per-tenant passes.
    fn list_active_orgs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step trace rows
    // -----------------------------------------------------------------------

    fn create_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step rows for an execution, ordered by `started_at` ascending.
    fn list_steps(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;
}

impl<T: ExecutionRepository> ExecutionRepository for std::sync::Arc<T> {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.as_ref().create(execution).await
    }

    async fn update(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.as_ref().update(execution).await
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        self.as_ref().get(organization_id, id).await
    }

    async fn try_transition(
        &self,
        organization_id: Uuid,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        self.as_ref()
            .try_transition(organization_id, id, from, to)
            .await
    }

    async fn get_timed_out(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        self.as_ref().get_timed_out(organization_id, now, limit).await
    }

    async fn get_paused(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        self.as_ref().get_paused(organization_id, limit).await
    }

    async fn cancel(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<bool, RepositoryError> {
        self.as_ref().cancel(organization_id, id).await
    }

    async fn list_active_orgs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        self.as_ref().list_active_orgs().await
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        self.as_ref().create_step(step).await
    }

    async fn update_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        self.as_ref().update_step(step).await
    }

    async fn list_steps(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        self.as_ref().list_steps(organization_id, execution_id).await
    }
}
