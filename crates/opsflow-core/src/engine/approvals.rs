//! Approval-gated pause/resume lifecycle.
//!
//! An approval request pauses its execution with an explicit resume plan
//! and creates a pending `ApprovalRequest`. Deciding the request either
//! merges the decision into the execution's resume data and resumes it
//! through the pause path, or finalizes the execution as failed on
//! rejection. Requests expire (via `expires_at` and the sweeper) and
//! expired or already-decided requests cannot be decided again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opsflow_types::approval::{ApprovalRequest, ApprovalStatus};
use opsflow_types::execution::{Execution, ExecutionResult, ExecutionStatus};
use serde_json::json;
use uuid::Uuid;

use super::EngineError;
use super::actions::ActionSink;
use super::context::ResourceLoader;
use super::interpreter::Interpreter;
use crate::repository::approval::ApprovalRepository;
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;
use crate::storage::kv_store::KvStore;

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// What to record when pausing an execution for approval.
#[derive(Debug, Clone)]
pub struct ApprovalParams {
    pub entity_type: String,
    pub entity_id: String,
    pub requester_id: String,
    pub approver_role: String,
    pub reason: String,
    /// Pending requests expire after this window (sweeper enforced).
    pub expires_in: Option<Duration>,
    /// Step to continue from on approval; falls back to re-executing the
    /// step the execution was on when paused.
    pub resume_step: Option<String>,
}

// ---------------------------------------------------------------------------
// ApprovalService
// ---------------------------------------------------------------------------

/// Pauses executions behind approval requests and resumes them on decision.
pub struct ApprovalService<P, W, R, K, L, A> {
    approvals: P,
    workflows: W,
    interpreter: Arc<Interpreter<R, K, L, A>>,
}

impl<P, W, R, K, L, A> ApprovalService<P, W, R, K, L, A>
where
    P: ApprovalRepository,
    W: WorkflowRepository,
    R: ExecutionRepository,
    K: KvStore,
    L: ResourceLoader,
    A: ActionSink,
{
    pub fn new(approvals: P, workflows: W, interpreter: Arc<Interpreter<R, K, L, A>>) -> Self {
        Self {
            approvals,
            workflows,
            interpreter,
        }
    }

    /// Pause an execution and open a pending approval request for it.
    pub async fn request_approval(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        params: ApprovalParams,
    ) -> Result<ApprovalRequest, EngineError> {
        let executions = self.interpreter.executions();
        let mut execution = executions
            .get(organization_id, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution not found: {execution_id}")))?;

        if execution.status.is_terminal() {
            return Err(EngineError::State(format!(
                "execution {} already finished",
                execution.execution_id
            )));
        }
        if params.resume_step.is_none() && execution.current_step_id.is_none() {
            return Err(EngineError::Validation(
                "approval pause requires a resume step".to_string(),
            ));
        }

        if !executions
            .try_transition(
                organization_id,
                execution_id,
                &[ExecutionStatus::Running, ExecutionStatus::Waiting],
                ExecutionStatus::Paused,
            )
            .await?
        {
            return Err(EngineError::State(format!(
                "execution {} cannot be paused (status: {})",
                execution.execution_id,
                execution.status.as_str()
            )));
        }

        let now = Utc::now();
        execution.status = ExecutionStatus::Paused;
        execution.paused_at = Some(now);
        execution.paused_reason = Some(params.reason.clone());
        execution.paused_step_id = execution.current_step_id.take();
        execution.next_step_id = params.resume_step.clone();
        execution.wait_state = None;
        executions.update(&execution).await?;

        let request = ApprovalRequest {
            id: Uuid::now_v7(),
            organization_id,
            request_id: ApprovalRequest::display_id(),
            execution_id,
            entity_type: params.entity_type,
            entity_id: params.entity_id,
            requester_id: params.requester_id,
            approver_role: params.approver_role,
            approver_id: None,
            status: ApprovalStatus::Pending,
            reason: params.reason,
            decision_reason: None,
            requested_at: now,
            decided_at: None,
            expires_at: params
                .expires_in
                .and_then(|d| chrono::TimeDelta::from_std(d).ok())
                .map(|d| now + d),
        };
        self.approvals.create(&request).await?;

        tracing::info!(
            organization_id = %organization_id,
            execution_id = execution.execution_id.as_str(),
            request_id = request.request_id.as_str(),
            approver_role = request.approver_role.as_str(),
            "execution paused pending approval"
        );

        Ok(request)
    }

    /// Decide a pending request. Approval resumes the execution; rejection
    /// finalizes it as failed. Returns the decided request and the
    /// execution in its post-decision state.
    pub async fn decide(
        &self,
        organization_id: Uuid,
        request_id: &str,
        approver_id: &str,
        approve: bool,
        reason: Option<String>,
    ) -> Result<(ApprovalRequest, Execution), EngineError> {
        let mut request = self
            .approvals
            .get_by_request_id(organization_id, request_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("approval request not found: {request_id}"))
            })?;

        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::State(format!(
                "approval request {request_id} is already {}",
                request.status.as_str()
            )));
        }
        let now = Utc::now();
        if request.expires_at.is_some_and(|t| t < now) {
            request.status = ApprovalStatus::Expired;
            request.decided_at = Some(now);
            self.approvals.update(&request).await?;
            return Err(EngineError::State(format!(
                "approval request {request_id} has expired"
            )));
        }

        request.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.approver_id = Some(approver_id.to_string());
        request.decision_reason = reason.clone();
        request.decided_at = Some(now);
        self.approvals.update(&request).await?;

        tracing::info!(
            organization_id = %organization_id,
            request_id,
            approver_id,
            approved = approve,
            "approval request decided"
        );

        let executions = self.interpreter.executions();
        let mut execution = executions
            .get(organization_id, request.execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("execution not found: {}", request.execution_id))
            })?;

        if approve {
            execution
                .resume_data
                .insert("approved".to_string(), json!(true));
            execution.resume_data.insert(
                "approval".to_string(),
                json!({
                    "request_id": request.request_id,
                    "approver_id": approver_id,
                    "reason": reason,
                    "decided_at": now.to_rfc3339(),
                }),
            );
            executions.update(&execution).await?;

            let workflow = self
                .workflows
                .get(organization_id, execution.workflow_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("workflow not found: {}", execution.workflow_id))
                })?;
            let resumed = self
                .interpreter
                .resume_from_pause(&workflow, execution.id)
                .await?;
            Ok((request, resumed))
        } else {
            if executions
                .try_transition(
                    organization_id,
                    execution.id,
                    &[ExecutionStatus::Paused],
                    ExecutionStatus::Failed,
                )
                .await?
            {
                let completed_at = Utc::now();
                execution.status = ExecutionStatus::Failed;
                execution.result = Some(ExecutionResult::Failed);
                execution.error_message = Some(format!(
                    "approval rejected: {}",
                    request.decision_reason.as_deref().unwrap_or("no reason given")
                ));
                execution.completed_at = Some(completed_at);
                execution.duration_ms =
                    Some((completed_at - execution.started_at).num_milliseconds());
                executions.update(&execution).await?;
            }
            let stored = executions
                .get(organization_id, execution.id)
                .await?
                .unwrap_or(execution);
            Ok((request, stored))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
