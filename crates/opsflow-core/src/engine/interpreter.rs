//! The step interpreter: walks a workflow's step graph against a durable
//! Execution record.
//!
//! # Driver loop
//!
//! Steps are looked up in an id map and executed one at a time. Every step
//! gets a trace row (`running` with an input snapshot, then `completed` or
//! `failed` with a duration). Dispatch returns a [`StepOutcome`] sum type
//! -- `Continue(next)` or `Pause` -- so suspension is explicit control
//! flow, not a sentinel error. An empty next id ends the walk successfully.
//!
//! # Deadlines
//!
//! The workflow deadline (definition timeout, else the trigger's
//! `timeout_seconds`, else the engine default) bounds the whole drive via
//! `tokio::time::timeout` and is re-checked against `timeout_at` at every
//! iteration. A step's own timeout bounds a single dispatch attempt; a
//! step deadline firing short-circuits the retry loop.
//!
//! # Pause and resume
//!
//! `wait` steps persist a `WaitState` and suspend; `resume_from_wait`
//! validates the awaited event, merges the resume payload, reloads the
//! context, and continues at `metadata.on_resume` or the declaration-order
//! successor. Approval-style pauses resume through `resume_from_pause`
//! with their stored resume plan. Both resumes go through a guarded
//! status transition so an execution cannot be driven twice.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use opsflow_types::ContextMap;
use opsflow_types::execution::{
    Execution, ExecutionResult, ExecutionStatus, StepExecution, StepExecutionStatus, WaitState,
};
use opsflow_types::workflow::{
    ActionType, ForeachSpec, ParallelSpec, ParallelStrategy, Step, StepKind, Workflow,
    WorkflowDefinition,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::EngineError;
use super::actions::{ActionDispatcher, ActionSink};
use super::context::{ContextBuilder, ResourceLoader};
use super::duration::{format_duration, parse_duration};
use super::evaluator::{ConditionEvaluator, resolve_path};
use super::retry::{backoff_delay, is_retryable};
use crate::repository::execution::ExecutionRepository;
use crate::storage::kv_store::KvStore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Engine default workflow deadline when neither the definition nor the
/// trigger supplies one.
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-execution step budget. Step graphs may legitimately contain
/// cycles; exceeding this fails the execution instead of spinning.
pub const MAX_STEPS_PER_EXECUTION: u32 = 1000;

// ---------------------------------------------------------------------------
// Step outcomes
// ---------------------------------------------------------------------------

/// What a dispatched step tells the driver to do next.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Move to the given step; `None` ends the walk successfully.
    Continue(Option<String>),
    /// Persist the wait state and suspend the execution.
    Pause(WaitState),
}

/// Full result of one step dispatch.
struct DispatchResult {
    outcome: StepOutcome,
    output: Option<Value>,
    action: Option<ActionType>,
}

/// How a drive pass ended.
enum DriveEnd {
    Completed(ExecutionResult),
    Suspended,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Timeout resolution
// ---------------------------------------------------------------------------

/// Resolve the workflow deadline.
///
/// Precedence: a valid `definition.timeout`, else a positive
/// `trigger.data.timeout_seconds`, else the supplied default. Invalid
/// duration strings log a warning and fall through.
pub fn workflow_timeout(definition: &WorkflowDefinition, default: Duration) -> Duration {
    if let Some(raw) = &definition.timeout {
        match parse_duration(raw) {
            Ok(d) if d > Duration::ZERO => return d,
            Ok(_) => {
                tracing::warn!(timeout = raw.as_str(), "non-positive workflow timeout ignored");
            }
            Err(err) => {
                tracing::warn!(
                    timeout = raw.as_str(),
                    error = %err,
                    "invalid workflow timeout, falling back"
                );
            }
        }
    }
    if let Some(secs) = definition.trigger.timeout_seconds() {
        return Duration::from_secs_f64(secs);
    }
    default
}

/// The exact user-visible message for an elapsed workflow deadline.
pub fn timeout_message(execution: &Execution) -> String {
    let window = execution
        .timeout_at
        .map(|t| t - execution.started_at)
        .and_then(|d| d.to_std().ok())
        .or_else(|| {
            execution
                .timeout_duration
                .map(|secs| Duration::from_secs(secs.max(0) as u64))
        })
        .unwrap_or(Duration::ZERO);
    format!("Workflow execution timed out after {}", format_duration(window))
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// The step interpreter. Generic over the execution store, context cache,
/// enrichment loader, and action sink; shared across executions behind an
/// `Arc`.
pub struct Interpreter<R, K, L, A> {
    executions: R,
    context: ContextBuilder<K, L>,
    dispatcher: ActionDispatcher<A>,
    default_timeout: Duration,
    /// Cooperative cancellation tokens keyed by execution id.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<R, K, L, A> Interpreter<R, K, L, A>
where
    R: ExecutionRepository,
    K: KvStore,
    L: ResourceLoader,
    A: ActionSink,
{
    pub fn new(executions: R, context: ContextBuilder<K, L>, dispatcher: ActionDispatcher<A>) -> Self {
        Self {
            executions,
            context,
            dispatcher,
            default_timeout: DEFAULT_WORKFLOW_TIMEOUT,
            cancellations: DashMap::new(),
        }
    }

    /// Override the engine default workflow deadline.
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    /// The backing execution store.
    pub fn executions(&self) -> &R {
        &self.executions
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Run a workflow from the beginning against a trigger payload.
    ///
    /// Always returns the durable Execution: terminal on completion or
    /// failure, `waiting` if the walk suspended on a wait step. An `Err`
    /// means the engine could not record the run at all.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger_event: &str,
        trigger_payload: ContextMap,
    ) -> Result<Execution, EngineError> {
        let org = workflow.organization_id;
        let timeout = workflow_timeout(&workflow.definition, self.default_timeout);

        let context = self
            .context
            .build(org, &trigger_payload, workflow.definition.context.as_ref())
            .await;

        let now = Utc::now();
        let execution = Execution {
            id: Uuid::now_v7(),
            organization_id: org,
            execution_id: Execution::display_id(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            status: ExecutionStatus::Running,
            result: None,
            trigger_event: trigger_event.to_string(),
            trigger_payload,
            context,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            timeout_at: chrono::TimeDelta::from_std(timeout)
                .ok()
                .map(|d| now + d),
            timeout_duration: Some(timeout.as_secs() as i64),
            paused_at: None,
            paused_reason: None,
            paused_step_id: None,
            next_step_id: None,
            resume_data: ContextMap::new(),
            resume_count: 0,
            last_resumed_at: None,
            current_step_id: None,
            wait_state: None,
            error_message: None,
            metadata: ContextMap::new(),
        };
        self.executions.create(&execution).await?;

        tracing::info!(
            organization_id = %org,
            execution_id = execution.execution_id.as_str(),
            workflow = workflow.name.as_str(),
            trigger = trigger_event,
            timeout = %format_duration(timeout),
            "starting workflow execution"
        );

        let start = workflow.definition.steps.first().map(|s| s.id.clone());
        self.drive_tracked(execution, workflow, start, timeout).await
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Resume an execution parked on a wait step.
    ///
    /// Rejects (without touching the row) unless the execution is waiting
    /// and the awaited event matches. The resume payload is merged into the
    /// context under the event name, loaded resources are refreshed, and
    /// the walk continues at `metadata.on_resume` or the step after the
    /// wait step. Pausing again is a legal outcome.
    pub async fn resume_from_wait(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        resume_event: &str,
        resume_data: ContextMap,
    ) -> Result<Execution, EngineError> {
        let org = workflow.organization_id;
        let mut execution = self
            .executions
            .get(org, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution not found: {execution_id}")))?;

        if execution.status != ExecutionStatus::Waiting {
            return Err(EngineError::State(format!(
                "execution {} is not waiting (status: {})",
                execution.execution_id,
                execution.status.as_str()
            )));
        }
        let wait_state = execution.wait_state.clone().ok_or_else(|| {
            EngineError::State(format!(
                "execution {} is waiting but has no wait state",
                execution.execution_id
            ))
        })?;
        if wait_state.event != resume_event {
            return Err(EngineError::State(format!(
                "resume event '{resume_event}' does not match awaited event '{}'",
                wait_state.event
            )));
        }

        let wait_step_id = execution.current_step_id.clone().ok_or_else(|| {
            EngineError::State(format!(
                "execution {} is waiting but has no current step",
                execution.execution_id
            ))
        })?;
        let start = resume_target_after_wait(&workflow.definition, &wait_step_id)?;

        // Guarded transition: exactly one resume wins.
        if !self
            .executions
            .try_transition(org, execution_id, &[ExecutionStatus::Waiting], ExecutionStatus::Running)
            .await?
        {
            return Err(EngineError::State(format!(
                "execution {} was concurrently resumed",
                execution.execution_id
            )));
        }
        execution.status = ExecutionStatus::Running;

        execution
            .context
            .insert(resume_event.to_string(), Value::Object(resume_data.clone()));
        self.context
            .reload(org, &mut execution.context, workflow.definition.context.as_ref())
            .await;

        let now = Utc::now();
        execution.wait_state = None;
        execution.current_step_id = None;
        execution.resume_data = resume_data;
        execution.resume_count += 1;
        execution.last_resumed_at = Some(now);
        self.executions.update(&execution).await?;

        tracing::info!(
            organization_id = %org,
            execution_id = execution.execution_id.as_str(),
            resume_event,
            next_step = start.as_deref().unwrap_or(""),
            "resuming execution after wait"
        );

        let remaining = remaining_deadline(&execution);
        self.drive_tracked(execution, workflow, start, remaining).await
    }

    /// Resume an execution paused out-of-band (approval-style).
    ///
    /// The stored `resume_data` is merged into the context; the walk starts
    /// at `next_step_id`, else re-executes `paused_step_id`, else the first
    /// declared step.
    pub async fn resume_from_pause(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
    ) -> Result<Execution, EngineError> {
        let org = workflow.organization_id;
        let mut execution = self
            .executions
            .get(org, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution not found: {execution_id}")))?;

        if execution.status != ExecutionStatus::Paused {
            return Err(EngineError::State(format!(
                "execution {} is not paused (status: {})",
                execution.execution_id,
                execution.status.as_str()
            )));
        }

        if !self
            .executions
            .try_transition(org, execution_id, &[ExecutionStatus::Paused], ExecutionStatus::Running)
            .await?
        {
            return Err(EngineError::State(format!(
                "execution {} was concurrently resumed",
                execution.execution_id
            )));
        }
        execution.status = ExecutionStatus::Running;

        for (key, value) in execution.resume_data.clone() {
            execution.context.insert(key, value);
        }

        let start = execution
            .next_step_id
            .clone()
            .or_else(|| execution.paused_step_id.clone())
            .or_else(|| workflow.definition.steps.first().map(|s| s.id.clone()));

        let now = Utc::now();
        execution.paused_at = None;
        execution.paused_reason = None;
        execution.paused_step_id = None;
        execution.next_step_id = None;
        execution.resume_count += 1;
        execution.last_resumed_at = Some(now);
        self.executions.update(&execution).await?;

        tracing::info!(
            organization_id = %org,
            execution_id = execution.execution_id.as_str(),
            next_step = start.as_deref().unwrap_or(""),
            "resuming paused execution"
        );

        let remaining = remaining_deadline(&execution);
        self.drive_tracked(execution, workflow, start, remaining).await
    }

    /// Drive a waiting execution whose wait-state timeout has elapsed.
    ///
    /// Continues at the wait step's `on_timeout` target when one is set;
    /// otherwise the execution fails with a step timeout message.
    pub async fn resume_wait_timeout(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
    ) -> Result<Execution, EngineError> {
        let org = workflow.organization_id;
        let mut execution = self
            .executions
            .get(org, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution not found: {execution_id}")))?;

        if execution.status != ExecutionStatus::Waiting {
            return Err(EngineError::State(format!(
                "execution {} is not waiting (status: {})",
                execution.execution_id,
                execution.status.as_str()
            )));
        }
        let wait_state = execution.wait_state.clone().ok_or_else(|| {
            EngineError::State(format!(
                "execution {} is waiting but has no wait state",
                execution.execution_id
            ))
        })?;
        if !wait_state.timeout_at.is_some_and(|t| t <= Utc::now()) {
            return Err(EngineError::State(format!(
                "execution {} wait has not timed out",
                execution.execution_id
            )));
        }
        let step_id = execution.current_step_id.clone().unwrap_or_default();

        if !self
            .executions
            .try_transition(org, execution_id, &[ExecutionStatus::Waiting], ExecutionStatus::Running)
            .await?
        {
            return Err(EngineError::State(format!(
                "execution {} was concurrently resumed",
                execution.execution_id
            )));
        }
        execution.status = ExecutionStatus::Running;
        execution.wait_state = None;
        execution.current_step_id = None;
        self.executions.update(&execution).await?;

        match wait_state.on_timeout {
            Some(target) => {
                let remaining = remaining_deadline(&execution);
                self.drive_tracked(execution, workflow, Some(target), remaining)
                    .await
            }
            None => {
                let err = EngineError::Timeout(format!(
                    "step {step_id} timed out: event '{}' did not arrive",
                    wait_state.event
                ));
                self.finish(execution, Err(err)).await
            }
        }
    }

    /// Cooperatively cancel an execution: the store row flips to
    /// `cancelled` immediately, a running driver observes the token at its
    /// next iteration.
    pub async fn cancel(&self, organization_id: Uuid, execution_id: Uuid) -> Result<bool, EngineError> {
        let cancelled = self.executions.cancel(organization_id, execution_id).await?;
        if cancelled {
            if let Some((_, token)) = self.cancellations.remove(&execution_id) {
                token.cancel();
            }
            tracing::info!(
                organization_id = %organization_id,
                execution_id = %execution_id,
                "execution cancelled"
            );
        }
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Register a cancellation token, drive under the deadline, finalize.
    async fn drive_tracked(
        &self,
        mut execution: Execution,
        workflow: &Workflow,
        start: Option<String>,
        deadline: Duration,
    ) -> Result<Execution, EngineError> {
        let token = CancellationToken::new();
        self.cancellations.insert(execution.id, token.clone());

        let drive_result = tokio::time::timeout(
            deadline,
            self.drive(&mut execution, workflow, start, &token),
        )
        .await;
        let outcome = match drive_result {
            Ok(result) => result,
            Err(_elapsed) => Err(EngineError::Timeout(timeout_message(&execution))),
        };

        self.cancellations.remove(&execution.id);
        self.finish(execution, outcome).await
    }

    /// The driver loop.
    async fn drive(
        &self,
        execution: &mut Execution,
        workflow: &Workflow,
        start: Option<String>,
        token: &CancellationToken,
    ) -> Result<DriveEnd, EngineError> {
        let step_map: HashMap<&str, &Step> = workflow
            .definition
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();

        let mut final_result = ExecutionResult::Executed;
        let mut current = start;
        let mut steps_taken = 0u32;

        while let Some(step_id) = current {
            if token.is_cancelled() {
                tracing::info!(
                    execution_id = execution.execution_id.as_str(),
                    step = step_id.as_str(),
                    "driver observed cancellation"
                );
                return Ok(DriveEnd::Cancelled);
            }
            if execution.timeout_at.is_some_and(|t| Utc::now() >= t) {
                return Err(EngineError::Timeout(timeout_message(execution)));
            }
            steps_taken += 1;
            if steps_taken > MAX_STEPS_PER_EXECUTION {
                return Err(EngineError::State(format!(
                    "step budget of {MAX_STEPS_PER_EXECUTION} steps exceeded"
                )));
            }

            let Some(step) = step_map.get(step_id.as_str()).copied() else {
                return Err(EngineError::NotFound(format!("step not found: {step_id}")));
            };

            let dispatch = self.run_step(execution, step, token).await?;

            if let Some(action) = dispatch.action {
                match action {
                    ActionType::Block => final_result = ExecutionResult::Blocked,
                    ActionType::Allow if final_result != ExecutionResult::Blocked => {
                        final_result = ExecutionResult::Allowed;
                    }
                    _ => {}
                }
            }

            match dispatch.outcome {
                StepOutcome::Continue(next) => {
                    self.executions.update(execution).await?;
                    current = next;
                }
                StepOutcome::Pause(wait_state) => {
                    execution.status = ExecutionStatus::Waiting;
                    execution.current_step_id = Some(step.id.clone());
                    execution.wait_state = Some(wait_state);
                    self.executions.update(execution).await?;
                    tracing::info!(
                        execution_id = execution.execution_id.as_str(),
                        step = step.id.as_str(),
                        "execution suspended on wait step"
                    );
                    return Ok(DriveEnd::Suspended);
                }
            }
        }

        Ok(DriveEnd::Completed(final_result))
    }

    /// Finalize the execution row for a drive outcome. An execution-level
    /// failure is a normal result for the caller: the failed row is
    /// returned as `Ok`.
    async fn finish(
        &self,
        mut execution: Execution,
        outcome: Result<DriveEnd, EngineError>,
    ) -> Result<Execution, EngineError> {
        match outcome {
            Ok(DriveEnd::Completed(result)) => {
                let now = Utc::now();
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(result);
                execution.completed_at = Some(now);
                execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
                self.executions.update(&execution).await?;
                tracing::info!(
                    execution_id = execution.execution_id.as_str(),
                    result = result.as_str(),
                    duration_ms = execution.duration_ms.unwrap_or(0),
                    "execution completed"
                );
                Ok(execution)
            }
            Ok(DriveEnd::Suspended) => Ok(execution),
            Ok(DriveEnd::Cancelled) => {
                // The cancel path already finalized the row; hand back the
                // stored state.
                let stored = self
                    .executions
                    .get(execution.organization_id, execution.id)
                    .await?;
                Ok(stored.unwrap_or(execution))
            }
            Err(err) => {
                let now = Utc::now();
                execution.status = ExecutionStatus::Failed;
                execution.result = Some(ExecutionResult::Failed);
                execution.error_message = Some(err.to_string());
                execution.completed_at = Some(now);
                execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
                self.executions.update(&execution).await?;
                tracing::warn!(
                    execution_id = execution.execution_id.as_str(),
                    error = execution.error_message.as_deref().unwrap_or(""),
                    "execution failed"
                );
                Ok(execution)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    /// Run one top-level step: trace row, retries, deadline, dispatch.
    async fn run_step(
        &self,
        execution: &Execution,
        step: &Step,
        token: &CancellationToken,
    ) -> Result<DispatchResult, EngineError> {
        let row = self
            .begin_step(execution.organization_id, execution.id, step, &execution.context)
            .await?;

        let result = self
            .run_with_retry(
                execution.organization_id,
                execution.id,
                step,
                &execution.context,
                token,
                false,
            )
            .await;

        match result {
            Ok(dispatch) => {
                self.finish_step(row, dispatch.output.clone(), None).await;
                Ok(dispatch)
            }
            Err(err) => {
                self.finish_step(row, None, Some(err.to_string())).await;
                Err(err)
            }
        }
    }

    /// Retry loop around a single step's dispatch. A step deadline firing
    /// is terminal; other errors retry per the step's policy with backoff.
    async fn run_with_retry(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step: &Step,
        ctx: &ContextMap,
        token: &CancellationToken,
        inline: bool,
    ) -> Result<DispatchResult, EngineError> {
        let step_timeout = step_deadline(step);
        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let dispatch = self.dispatch_step(organization_id, execution_id, step, ctx, token, inline);
            let result = match step_timeout {
                Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(EngineError::Timeout(format!(
                        "step {} timed out: exceeded {} deadline",
                        step.id,
                        format_duration(limit)
                    ))),
                },
                None => dispatch.await,
            };

            match result {
                Ok(dispatch) => return Ok(dispatch),
                // A deadline firing short-circuits the retry loop.
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    let Some(retry) = &step.retry else {
                        return Err(err);
                    };
                    if attempt >= max_attempts || !is_retryable(&err.to_string(), &retry.retry_on) {
                        return Err(err);
                    }
                    let delay = backoff_delay(retry.backoff, attempt);
                    tracing::warn!(
                        step = step.id.as_str(),
                        attempt,
                        max_attempts,
                        delay = %format_duration(delay),
                        error = %err,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Dispatch by step type. `inline` marks steps running inside parallel
    /// branches or foreach bodies: no graph routing, and wait steps are
    /// rejected.
    async fn dispatch_step(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step: &Step,
        ctx: &ContextMap,
        token: &CancellationToken,
        inline: bool,
    ) -> Result<DispatchResult, EngineError> {
        match &step.kind {
            StepKind::Condition {
                condition,
                rule_id,
                on_true,
                on_false,
            } => {
                let Some(condition) = condition else {
                    return Err(match rule_id {
                        Some(rule) => EngineError::Validation(format!(
                            "condition step '{}' references rule '{rule}' but no rule catalog is configured",
                            step.id
                        )),
                        None => EngineError::Validation(format!(
                            "condition step '{}' has no condition",
                            step.id
                        )),
                    });
                };
                let met = ConditionEvaluator::evaluate(condition, ctx)?;
                let next = if inline {
                    None
                } else if met {
                    on_true.clone()
                } else {
                    on_false.clone()
                };
                tracing::debug!(step = step.id.as_str(), met, "condition evaluated");
                Ok(DispatchResult {
                    output: Some(json!({ "condition_met": met, "next": next })),
                    outcome: StepOutcome::Continue(next),
                    action: None,
                })
            }
            StepKind::Action { action, execute } => {
                let result = self
                    .dispatcher
                    .dispatch(organization_id, execution_id, action, execute, ctx)
                    .await?;
                fail_if_all_sub_actions_failed(&step.id, &result.results)?;
                Ok(DispatchResult {
                    output: Some(result.to_value()),
                    action: Some(result.action),
                    // Action steps end the graph.
                    outcome: StepOutcome::Continue(None),
                })
            }
            StepKind::Execute { execute } => {
                let results = self
                    .dispatcher
                    .run_sub_actions(organization_id, execution_id, execute, ctx)
                    .await;
                fail_if_all_sub_actions_failed(&step.id, &results)?;
                Ok(DispatchResult {
                    output: Some(json!({
                        "results": results.iter().map(|r| r.to_value()).collect::<Vec<_>>(),
                    })),
                    outcome: StepOutcome::Continue(None),
                    action: None,
                })
            }
            StepKind::Parallel { parallel } => {
                let output = self
                    .run_parallel(organization_id, execution_id, parallel, ctx, token)
                    .await?;
                Ok(DispatchResult {
                    output: Some(output),
                    outcome: StepOutcome::Continue(if inline { None } else { step.next.clone() }),
                    action: None,
                })
            }
            StepKind::Foreach { foreach } => {
                let output = self
                    .run_foreach(organization_id, execution_id, foreach, ctx, token)
                    .await?;
                Ok(DispatchResult {
                    output: Some(output),
                    outcome: StepOutcome::Continue(if inline { None } else { step.next.clone() }),
                    action: None,
                })
            }
            StepKind::Wait { wait } => {
                if inline {
                    return Err(EngineError::Validation(format!(
                        "wait step '{}' is not allowed inside parallel or foreach",
                        step.id
                    )));
                }
                let now = Utc::now();
                let timeout_at = wait.timeout.as_deref().and_then(|raw| {
                    match parse_duration(raw) {
                        Ok(d) => chrono::TimeDelta::from_std(d).ok().map(|d| now + d),
                        Err(err) => {
                            tracing::warn!(
                                step = step.id.as_str(),
                                timeout = raw,
                                error = %err,
                                "invalid wait timeout ignored"
                            );
                            None
                        }
                    }
                });
                Ok(DispatchResult {
                    output: Some(json!({ "waiting_for": wait.event })),
                    outcome: StepOutcome::Pause(WaitState {
                        event: wait.event.clone(),
                        timeout_at,
                        on_timeout: wait.on_timeout.clone(),
                        waiting_since: now,
                    }),
                    action: None,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Run parallel branches concurrently. Branch trace rows share the
    /// parent execution id; each branch sees its own snapshot of the
    /// context, so sibling writes are never visible to each other.
    async fn run_parallel(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        spec: &ParallelSpec,
        ctx: &ContextMap,
        token: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let branches = spec.steps.len();
        let strategy = spec.strategy;
        if branches == 0 {
            return Ok(parallel_output(strategy, 0, 0));
        }

        let results = join_all(spec.steps.iter().map(|branch| {
            self.run_inline_step(organization_id, execution_id, branch, ctx.clone(), token.clone())
        }))
        .await;

        let mut successes = 0usize;
        let mut failures: Vec<EngineError> = Vec::new();
        for result in results {
            match result {
                Ok(_) => successes += 1,
                Err(err) => failures.push(err),
            }
        }

        let failed = failures.len();
        match strategy {
            ParallelStrategy::AllMustPass => {
                if let Some(first) = failures.into_iter().next() {
                    return Err(first);
                }
            }
            ParallelStrategy::AnyCanPass => {
                if successes == 0 {
                    return Err(EngineError::Resource(
                        "all parallel steps failed".to_string(),
                    ));
                }
            }
            ParallelStrategy::BestEffort => {
                if failed > 0 {
                    tracing::warn!(failed, branches, "best-effort parallel branches failed");
                }
            }
        }

        Ok(parallel_output(strategy, branches, failed))
    }

    /// Iterate a resolved collection, running the body sequentially per
    /// element against a per-iteration context copy.
    async fn run_foreach(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        spec: &ForeachSpec,
        ctx: &ContextMap,
        token: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let path = spec
            .items
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .map(str::trim)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "foreach items must be a {{{{path}}}} reference, got '{}'",
                    spec.items
                ))
            })?;

        let resolved = resolve_path(ctx, path)?;
        let Value::Array(items) = resolved else {
            return Err(EngineError::Validation(format!(
                "foreach items '{path}' did not resolve to a sequence"
            )));
        };
        let items = items.clone();

        for (index, element) in items.iter().enumerate() {
            let mut iteration_ctx = ctx.clone();
            iteration_ctx.insert(spec.item_var.clone(), element.clone());
            iteration_ctx.insert("_index".to_string(), json!(index));

            for inner in &spec.steps {
                self.run_inline_step(
                    organization_id,
                    execution_id,
                    inner,
                    iteration_ctx.clone(),
                    token.clone(),
                )
                .await?;
            }
        }

        Ok(json!({ "iterations": items.len() }))
    }

    /// Run one step inside a parallel branch or foreach body: its own trace
    /// row and retry loop, recursion for nested fan-out. Boxed because the
    /// recursion goes through parallel/foreach dispatch.
    fn run_inline_step<'a>(
        &'a self,
        organization_id: Uuid,
        execution_id: Uuid,
        step: &'a Step,
        ctx: ContextMap,
        token: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let row = self
                .begin_step(organization_id, execution_id, step, &ctx)
                .await?;

            let result = self
                .run_with_retry(organization_id, execution_id, step, &ctx, &token, true)
                .await;

            match result {
                Ok(dispatch) => {
                    let output = dispatch.output.unwrap_or(Value::Null);
                    self.finish_step(row, Some(output.clone()), None).await;
                    Ok(output)
                }
                Err(err) => {
                    self.finish_step(row, None, Some(err.to_string())).await;
                    Err(err)
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Step trace rows
    // -----------------------------------------------------------------------

    async fn begin_step(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step: &Step,
        ctx: &ContextMap,
    ) -> Result<StepExecution, EngineError> {
        let row = StepExecution {
            id: Uuid::now_v7(),
            organization_id,
            execution_id,
            step_id: step.id.clone(),
            step_type: step.kind.type_name().to_string(),
            status: StepExecutionStatus::Running,
            input: ctx.clone(),
            output: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
        };
        self.executions.create_step(&row).await?;
        tracing::debug!(
            execution_id = %execution_id,
            step = step.id.as_str(),
            step_type = row.step_type.as_str(),
            "step started"
        );
        Ok(row)
    }

    /// Finalize a trace row. Persistence failures here are logged, not
    /// raised: the dispatch result already happened.
    async fn finish_step(
        &self,
        mut row: StepExecution,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        row.completed_at = Some(now);
        row.duration_ms = Some((now - row.started_at).num_milliseconds());
        match error {
            Some(message) => {
                row.status = StepExecutionStatus::Failed;
                row.error_message = Some(message);
            }
            None => {
                row.status = StepExecutionStatus::Completed;
                row.output = output;
            }
        }
        if let Err(err) = self.executions.update_step(&row).await {
            tracing::warn!(
                step = row.step_id.as_str(),
                error = %err,
                "failed to persist step row"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A step's own deadline; absent or invalid inherits the workflow deadline.
fn step_deadline(step: &Step) -> Option<Duration> {
    let raw = step.timeout.as_deref()?;
    match parse_duration(raw) {
        Ok(d) if d > Duration::ZERO => Some(d),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(
                step = step.id.as_str(),
                timeout = raw,
                error = %err,
                "invalid step timeout, inheriting workflow deadline"
            );
            None
        }
    }
}

/// Time left until the execution's workflow deadline.
fn remaining_deadline(execution: &Execution) -> Duration {
    execution
        .timeout_at
        .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(DEFAULT_WORKFLOW_TIMEOUT)
}

/// Resume target after a wait step: `metadata.on_resume`, else the step
/// following the wait step in declaration order.
fn resume_target_after_wait(
    definition: &WorkflowDefinition,
    wait_step_id: &str,
) -> Result<Option<String>, EngineError> {
    let index = definition
        .steps
        .iter()
        .position(|s| s.id == wait_step_id)
        .ok_or_else(|| EngineError::NotFound(format!("step not found: {wait_step_id}")))?;

    if let Some(target) = definition.steps[index]
        .metadata
        .get("on_resume")
        .and_then(Value::as_str)
    {
        return Ok(Some(target.to_string()));
    }
    Ok(definition.steps.get(index + 1).map(|s| s.id.clone()))
}

/// An action/execute step fails only when a non-empty sub-action list
/// produced no successful entry; partial failures keep the step successful
/// with per-entry detail.
fn fail_if_all_sub_actions_failed(
    step_id: &str,
    results: &[super::actions::SubActionResult],
) -> Result<(), EngineError> {
    if !results.is_empty() && results.iter().all(|r| !r.success) {
        let first = results
            .iter()
            .find_map(|r| r.error.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(EngineError::Resource(format!(
            "step {step_id}: all sub-actions failed: {first}"
        )));
    }
    Ok(())
}

fn parallel_output(strategy: ParallelStrategy, branches: usize, failed: usize) -> Value {
    let strategy = match strategy {
        ParallelStrategy::AllMustPass => "all_must_pass",
        ParallelStrategy::AnyCanPass => "any_can_pass",
        ParallelStrategy::BestEffort => "best_effort",
    };
    json!({ "strategy": strategy, "branches": branches, "failures": failed })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
