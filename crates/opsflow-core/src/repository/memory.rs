//! In-memory repository implementations.
//!
//! Mutex-guarded maps implementing every persistence port. Used by the
//! kernel's own tests and suitable for embedding the engine without a
//! database. Semantics match the SQLite implementations, including the
//! guarded status transitions and tenant scoping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opsflow_types::approval::ApprovalRequest;
use opsflow_types::error::RepositoryError;
use opsflow_types::event::Event;
use opsflow_types::execution::{Execution, ExecutionStatus, StepExecution};
use opsflow_types::workflow::Workflow;
use uuid::Uuid;

use super::approval::ApprovalRepository;
use super::event::EventRepository;
use super::execution::ExecutionRepository;
use super::workflow::WorkflowRepository;
use crate::storage::kv_store::KvStore;

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// In-memory `WorkflowRepository`.
#[derive(Default)]
pub struct MemoryWorkflowRepository {
    rows: Mutex<HashMap<(Uuid, Uuid), Workflow>>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for MemoryWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("workflow lock");
        rows.insert((workflow.organization_id, workflow.id), workflow.clone());
        Ok(())
    }

    async fn list_by_org(
        &self,
        organization_id: Uuid,
        enabled_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = self.rows.lock().expect("workflow lock");
        let mut matches: Vec<Workflow> = rows
            .values()
            .filter(|w| w.organization_id == organization_id)
            .filter(|w| !enabled_only || w.enabled)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let rows = self.rows.lock().expect("workflow lock");
        Ok(rows.get(&(organization_id, id)).cloned())
    }

    async fn get_by_workflow_id(
        &self,
        organization_id: Uuid,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let rows = self.rows.lock().expect("workflow lock");
        Ok(rows
            .values()
            .filter(|w| w.organization_id == organization_id && w.workflow_id == workflow_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn set_enabled(
        &self,
        organization_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().expect("workflow lock");
        match rows.get_mut(&(organization_id, id)) {
            Some(w) => {
                w.enabled = enabled;
                w.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Executions & step rows
// ---------------------------------------------------------------------------

/// In-memory `ExecutionRepository`.
#[derive(Default)]
pub struct MemoryExecutionRepository {
    executions: Mutex<HashMap<(Uuid, Uuid), Execution>>,
    steps: Mutex<Vec<StepExecution>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: all executions for a tenant, oldest first.
    pub fn all_for_org(&self, organization_id: Uuid) -> Vec<Execution> {
        let rows = self.executions.lock().expect("execution lock");
        let mut matches: Vec<Execution> = rows
            .values()
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        matches
    }
}

impl ExecutionRepository for MemoryExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut rows = self.executions.lock().expect("execution lock");
        rows.insert(
            (execution.organization_id, execution.id),
            execution.clone(),
        );
        Ok(())
    }

    async fn update(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut rows = self.executions.lock().expect("execution lock");
        match rows.get_mut(&(execution.organization_id, execution.id)) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        let rows = self.executions.lock().expect("execution lock");
        Ok(rows.get(&(organization_id, id)).cloned())
    }

    async fn try_transition(
        &self,
        organization_id: Uuid,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.executions.lock().expect("execution lock");
        match rows.get_mut(&(organization_id, id)) {
            Some(e) if !e.status.is_terminal() && from.contains(&e.status) => {
                e.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn get_timed_out(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = self.executions.lock().expect("execution lock");
        let mut matches: Vec<Execution> = rows
            .values()
            .filter(|e| e.organization_id == organization_id)
            .filter(|e| {
                matches!(
                    e.status,
                    ExecutionStatus::Running | ExecutionStatus::Waiting
                )
            })
            .filter(|e| e.timeout_at.is_some_and(|t| t < now))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.timeout_at.cmp(&b.timeout_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn get_paused(
        &self,
        organization_id: Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = self.executions.lock().expect("execution lock");
        let mut matches: Vec<Execution> = rows
            .values()
            .filter(|e| {
                e.organization_id == organization_id && e.status == ExecutionStatus::Paused
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.paused_at.cmp(&b.paused_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn cancel(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.executions.lock().expect("execution lock");
        match rows.get_mut(&(organization_id, id)) {
            Some(e) if !e.status.is_terminal() => {
                let now = Utc::now();
                e.status = ExecutionStatus::Cancelled;
                e.completed_at = Some(now);
                e.duration_ms = Some((now - e.started_at).num_milliseconds());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_orgs(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = self.executions.lock().expect("execution lock");
        let mut orgs: Vec<Uuid> = rows
            .values()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.organization_id)
            .collect();
        orgs.sort();
        orgs.dedup();
        Ok(orgs)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().expect("step lock");
        steps.push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().expect("step lock");
        match steps.iter_mut().find(|s| {
            s.id == step.id && s.organization_id == step.organization_id
        }) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_steps(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let steps = self.steps.lock().expect("step lock");
        let mut matches: Vec<StepExecution> = steps
            .iter()
            .filter(|s| {
                s.organization_id == organization_id && s.execution_id == execution_id
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// In-memory `EventRepository`.
#[derive(Default)]
pub struct MemoryEventRepository {
    rows: Mutex<HashMap<(Uuid, Uuid), Event>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper.
    pub fn get(&self, organization_id: Uuid, id: Uuid) -> Option<Event> {
        let rows = self.rows.lock().expect("event lock");
        rows.get(&(organization_id, id)).cloned()
    }
}

impl EventRepository for MemoryEventRepository {
    async fn create(&self, event: &Event) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("event lock");
        rows.insert((event.organization_id, event.id), event.clone());
        Ok(())
    }

    async fn update(&self, event: &Event) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("event lock");
        match rows.get_mut(&(event.organization_id, event.id)) {
            Some(existing) => {
                *existing = event.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// In-memory `ApprovalRepository`.
#[derive(Default)]
pub struct MemoryApprovalRepository {
    rows: Mutex<HashMap<(Uuid, Uuid), ApprovalRequest>>,
}

impl MemoryApprovalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalRepository for MemoryApprovalRepository {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("approval lock");
        rows.insert((request.organization_id, request.id), request.clone());
        Ok(())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("approval lock");
        match rows.get_mut(&(request.organization_id, request.id)) {
            Some(existing) => {
                *existing = request.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let rows = self.rows.lock().expect("approval lock");
        Ok(rows.get(&(organization_id, id)).cloned())
    }

    async fn get_by_request_id(
        &self,
        organization_id: Uuid,
        request_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let rows = self.rows.lock().expect("approval lock");
        Ok(rows
            .values()
            .find(|r| r.organization_id == organization_id && r.request_id == request_id)
            .cloned())
    }

    async fn get_expired(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = self.rows.lock().expect("approval lock");
        let mut matches: Vec<ApprovalRequest> = rows
            .values()
            .filter(|r| r.organization_id == organization_id)
            .filter(|r| r.status == opsflow_types::approval::ApprovalStatus::Pending)
            .filter(|r| r.expires_at.is_some_and(|t| t < now))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// KV store
// ---------------------------------------------------------------------------

/// In-memory `KvStore` with TTL support.
#[derive(Default)]
pub struct MemoryKvStore {
    rows: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let mut rows = self.rows.lock().expect("kv lock");
        match rows.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                rows.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("kv lock");
        let deadline = ttl.map(|d| Instant::now() + d);
        rows.insert(key.to_string(), (value.clone(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("kv lock");
        rows.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
