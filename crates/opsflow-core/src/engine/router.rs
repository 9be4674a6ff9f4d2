//! Event-to-workflow routing.
//!
//! An inbound event is persisted, matched against enabled event-triggered
//! workflows (exact name or trailing-`*` prefix), and each match is driven
//! in its own spawned task behind a panic supervisor: a panicking
//! execution never takes down the process, its siblings, or the router --
//! it leaves a synthetic failed Execution with the captured panic in its
//! metadata. The router's own caller cancelling does not cancel spawned
//! executions.

use std::sync::Arc;

use chrono::Utc;
use opsflow_types::ContextMap;
use opsflow_types::event::Event;
use opsflow_types::execution::{Execution, ExecutionResult, ExecutionStatus};
use opsflow_types::workflow::{TriggerSpec, Workflow};
use serde_json::json;
use uuid::Uuid;

use super::EngineError;
use super::actions::ActionSink;
use super::context::ResourceLoader;
use super::interpreter::Interpreter;
use crate::repository::event::EventRepository;
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;
use crate::storage::kv_store::KvStore;

/// Upper bound on trigger candidates considered per event.
const MAX_TRIGGER_CANDIDATES: u32 = 500;

/// Exact match, or prefix match when the subscription ends in `*`
/// (`"order.*"` matches any event type starting with `"order."`).
pub fn event_matches(subscription: &str, event_type: &str) -> bool {
    match subscription.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => subscription == event_type,
    }
}

// ---------------------------------------------------------------------------
// EventRouter
// ---------------------------------------------------------------------------

/// Routes inbound events to subscribed workflows and spawns executions.
pub struct EventRouter<W, E, R, K, L, A> {
    workflows: W,
    events: E,
    executions: R,
    interpreter: Arc<Interpreter<R, K, L, A>>,
}

impl<W, E, R, K, L, A> EventRouter<W, E, R, K, L, A>
where
    W: WorkflowRepository + 'static,
    E: EventRepository + 'static,
    R: ExecutionRepository + Clone + 'static,
    K: KvStore + 'static,
    L: ResourceLoader + 'static,
    A: ActionSink + 'static,
{
    pub fn new(
        workflows: W,
        events: E,
        executions: R,
        interpreter: Arc<Interpreter<R, K, L, A>>,
    ) -> Self {
        Self {
            workflows,
            events,
            executions,
            interpreter,
        }
    }

    /// Persist the event, spawn one isolated execution per matching
    /// workflow, stamp the event as processed.
    pub async fn route_event(
        &self,
        organization_id: Uuid,
        event_type: &str,
        source: &str,
        payload: ContextMap,
    ) -> Result<Event, EngineError> {
        let mut event = Event {
            id: Uuid::now_v7(),
            organization_id,
            event_id: Event::display_id(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
            processed_at: None,
            triggered_workflows: vec![],
        };
        self.events.create(&event).await?;

        let candidates = self
            .workflows
            .list_by_org(organization_id, true, MAX_TRIGGER_CANDIDATES, 0)
            .await?;
        let matched: Vec<Workflow> = candidates
            .into_iter()
            .filter(|w| match &w.definition.trigger {
                TriggerSpec::Event { event, .. } => event_matches(event, event_type),
                _ => false,
            })
            .collect();

        for workflow in &matched {
            self.spawn_execution(workflow.clone(), event_type.to_string(), payload.clone());
        }

        event.processed_at = Some(Utc::now());
        event.triggered_workflows = matched.iter().map(|w| w.id).collect();
        self.events.update(&event).await?;

        tracing::info!(
            organization_id = %organization_id,
            event_id = event.event_id.as_str(),
            event_type,
            source,
            matched = matched.len(),
            "event routed"
        );

        Ok(event)
    }

    /// Run a workflow synchronously with trigger event `"manual"`.
    /// Disabled workflows are rejected.
    pub async fn trigger_manual(
        &self,
        organization_id: Uuid,
        workflow_id: &str,
        payload: ContextMap,
    ) -> Result<Execution, EngineError> {
        let workflow = self
            .workflows
            .get_by_workflow_id(organization_id, workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow not found: {workflow_id}")))?;

        if !workflow.enabled {
            return Err(EngineError::State(format!(
                "workflow {workflow_id} is disabled"
            )));
        }

        self.interpreter.execute(&workflow, "manual", payload).await
    }

    /// Spawn one execution in its own task, supervised for panics. The
    /// execution runs on a fresh background scope: dropping the router's
    /// caller does not cancel it.
    fn spawn_execution(&self, workflow: Workflow, trigger_event: String, payload: ContextMap) {
        let interpreter = Arc::clone(&self.interpreter);
        let executions = self.executions.clone();

        tokio::spawn(async move {
            let organization_id = workflow.organization_id;
            let workflow_id = workflow.id;
            let workflow_name = workflow.name.clone();
            let trigger = trigger_event.clone();
            let trigger_payload = payload.clone();

            let task = tokio::spawn(async move {
                interpreter.execute(&workflow, &trigger_event, payload).await
            });

            match task.await {
                // Success and execution-level failure are both already
                // persisted by the interpreter.
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        organization_id = %organization_id,
                        workflow = workflow_name.as_str(),
                        error = %err,
                        "spawned execution could not be recorded"
                    );
                }
                Err(join_err) if join_err.is_panic() => {
                    let panic_text = panic_message(join_err);
                    tracing::error!(
                        organization_id = %organization_id,
                        workflow = workflow_name.as_str(),
                        panic = panic_text.as_str(),
                        "execution task panicked"
                    );
                    record_panic(
                        &executions,
                        organization_id,
                        workflow_id,
                        &workflow_name,
                        &trigger,
                        trigger_payload,
                        panic_text,
                    )
                    .await;
                }
                Err(_) => {}
            }
        });
    }
}

/// Extract the payload message from a panicked task.
fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Write the synthetic failed Execution row for a recovered panic.
async fn record_panic<R: ExecutionRepository>(
    executions: &R,
    organization_id: Uuid,
    workflow_id: Uuid,
    workflow_name: &str,
    trigger_event: &str,
    trigger_payload: ContextMap,
    panic_text: String,
) {
    let now = Utc::now();
    let mut metadata = ContextMap::new();
    metadata.insert("panic_recovered".to_string(), json!(true));
    metadata.insert("stack_trace".to_string(), json!(panic_text));

    let execution = Execution {
        id: Uuid::now_v7(),
        organization_id,
        execution_id: Execution::display_id(),
        workflow_id,
        workflow_name: workflow_name.to_string(),
        status: ExecutionStatus::Failed,
        result: Some(ExecutionResult::Failed),
        trigger_event: trigger_event.to_string(),
        trigger_payload,
        context: ContextMap::new(),
        started_at: now,
        completed_at: Some(now),
        duration_ms: Some(0),
        timeout_at: None,
        timeout_duration: None,
        paused_at: None,
        paused_reason: None,
        paused_step_id: None,
        next_step_id: None,
        resume_data: ContextMap::new(),
        resume_count: 0,
        last_resumed_at: None,
        current_step_id: None,
        wait_state: None,
        error_message: Some(format!("panic recovered: {panic_text}")),
        metadata,
    };

    if let Err(err) = executions.create(&execution).await {
        tracing::error!(
            organization_id = %organization_id,
            error = %err,
            "failed to record panic execution"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
