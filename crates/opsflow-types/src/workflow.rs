//! Workflow domain types for Opsflow.
//!
//! Defines the canonical intermediate representation for workflows: the
//! versioned `Workflow` record, its `WorkflowDefinition` body, and the tagged
//! step union the interpreter walks. JSON and YAML documents both convert
//! to and from these types, so malformed workflows are rejected at load
//! rather than at step entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ContextMap;

// ---------------------------------------------------------------------------
// Workflow record
// ---------------------------------------------------------------------------

/// A versioned, tenant-scoped workflow.
///
/// Identity is `(organization_id, id)`; the human key is
/// `(organization_id, workflow_id, version)`, with the most recent version
/// winning on lookup by `workflow_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Opaque unique handle (UUIDv7).
    pub id: Uuid,
    /// Owning tenant.
    pub organization_id: Uuid,
    /// Tenant-scoped human identifier (e.g. "high-value-review").
    pub workflow_id: String,
    /// Version string for the human key.
    pub version: String,
    /// Display name.
    pub name: String,
    /// The executable definition body.
    pub definition: WorkflowDefinition,
    /// Disabled workflows are skipped by the router and rejected on manual trigger.
    pub enabled: bool,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Definition body
// ---------------------------------------------------------------------------

/// The executable body of a workflow: trigger, context loads, and step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow-level deadline as a duration string ("30s", "1h30m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// How this workflow is started.
    pub trigger: TriggerSpec,
    /// Resources merged into the working context before the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSpec>,
    /// The step graph in declaration order; execution starts at the first step.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Trigger configuration, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fired by the event router when a matching event arrives.
    Event {
        /// Event name to match: exact, or a `prefix.*` wildcard.
        event: String,
        #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
        data: ContextMap,
    },
    /// Fired by the external schedule worker (which emits trigger events).
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
        data: ContextMap,
    },
    /// Fired only by explicit invocation.
    Manual {
        #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
        data: ContextMap,
    },
}

impl TriggerSpec {
    /// The trigger's free-form data block.
    pub fn data(&self) -> &ContextMap {
        match self {
            TriggerSpec::Event { data, .. }
            | TriggerSpec::Schedule { data, .. }
            | TriggerSpec::Manual { data } => data,
        }
    }

    /// `data.timeout_seconds` as a positive number of seconds, if present.
    ///
    /// Accepts integer or float values; zero and negative values are ignored.
    pub fn timeout_seconds(&self) -> Option<f64> {
        let secs = self.data().get("timeout_seconds")?.as_f64()?;
        (secs > 0.0).then_some(secs)
    }
}

/// Declares which external resources the context builder loads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSpec {
    /// Resource names, e.g. `"order.details"`.
    #[serde(default)]
    pub load: Vec<String>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
///
/// Common fields live here; the per-type payload is the flattened
/// [`StepKind`] union, discriminated by `type` in the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the workflow (including nested parallel/foreach steps).
    pub id: String,
    /// Step-level deadline as a duration string; absent inherits the workflow deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Explicit successor step id. Empty means the graph ends after this step
    /// (condition steps route via `on_true`/`on_false` instead).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Free-form metadata. `on_resume` here overrides the resume target of a
    /// wait step.
    #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
    pub metadata: ContextMap,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Per-type step payload, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Conditional branch: routes to `on_true` or `on_false`.
    Condition {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<ConditionExpr>,
        /// Reference to a rule catalog entry (requires a catalog; see DESIGN.md).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_true: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<String>,
    },
    /// Terminal decision step: allow, block, or execute a sub-action list.
    Action {
        action: ActionSpec,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        execute: Vec<SubAction>,
    },
    /// Terminal step that runs a sub-action list unconditionally.
    Execute {
        #[serde(default)]
        execute: Vec<SubAction>,
    },
    /// Concurrent fan-out over an inner step list.
    Parallel { parallel: ParallelSpec },
    /// Sequential iteration over a collection resolved from the context.
    Foreach { foreach: ForeachSpec },
    /// Durable pause until a named event arrives.
    Wait { wait: WaitSpec },
}

impl StepKind {
    /// Wire-format type name, used for step trace rows.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Condition { .. } => "condition",
            StepKind::Action { .. } => "action",
            StepKind::Execute { .. } => "execute",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Foreach { .. } => "foreach",
            StepKind::Wait { .. } => "wait",
        }
    }
}

/// The decision carried by an action step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Allow,
    Block,
    Execute,
}

/// Fan-out configuration for a parallel step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub strategy: ParallelStrategy,
}

/// How branch failures roll up into the parallel step's result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    /// First branch failure fails the step.
    #[default]
    AllMustPass,
    /// The step succeeds if any branch succeeds.
    AnyCanPass,
    /// The step always succeeds; failures are counted.
    BestEffort,
}

/// Iteration configuration for a foreach step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachSpec {
    /// Collection reference of the form `{{var.path}}`; must resolve to a sequence.
    pub items: String,
    /// Context key the current element is bound to inside the body.
    pub item_var: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Durable wait configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSpec {
    /// Event name that resumes the execution.
    pub event: String,
    /// How long to wait before the timeout path applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Step to continue from when the wait times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sleep schedule between attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Error substrings that are retryable. Empty or `["*"]` retries any error.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

/// Sleep schedule between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `attempt` seconds before attempt N+1.
    Linear,
    /// `2^(attempt-1)` seconds before attempt N+1 (1s, 2s, 4s, ...).
    #[default]
    Exponential,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A node in a condition tree.
///
/// Non-empty `and` makes the node a conjunction, else non-empty `or` a
/// disjunction, else a leaf comparing `field` against `value` with
/// `operator`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<ConditionOp>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<ConditionExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<ConditionExpr>,
}

/// Leaf comparison operators. Symbol spellings are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    Contains,
    Regex,
}

// ---------------------------------------------------------------------------
// Sub-actions
// ---------------------------------------------------------------------------

/// One entry of an `execute` list, discriminated by `type`.
///
/// Sub-action bodies are executed by an external sink; only the contract
/// (shape in, `{success, error?}` out) belongs to the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubAction {
    /// Fire-and-forget notification.
    Notify {
        #[serde(default)]
        recipients: Vec<String>,
        message: String,
    },
    /// Outbound HTTP call; succeeds iff the status is 2xx.
    #[serde(alias = "http_request")]
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
        body: ContextMap,
    },
    CreateRecord {
        entity: String,
        #[serde(default)]
        data: ContextMap,
    },
    UpdateRecord {
        entity: String,
        entity_id: String,
        #[serde(default)]
        data: ContextMap,
    },
    /// Writes a structured log line.
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
        data: ContextMap,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_from_json(value: serde_json::Value) -> Step {
        serde_json::from_value(value).expect("valid step JSON")
    }

    // -----------------------------------------------------------------------
    // Step union
    // -----------------------------------------------------------------------

    #[test]
    fn test_condition_step_roundtrip() {
        let step = step_from_json(json!({
            "id": "check-total",
            "type": "condition",
            "condition": { "field": "order.total", "operator": "gt", "value": 1000 },
            "on_true": "block-order",
            "on_false": "allow-order"
        }));

        assert_eq!(step.id, "check-total");
        assert_eq!(step.kind.type_name(), "condition");
        match &step.kind {
            StepKind::Condition {
                condition,
                on_true,
                on_false,
                ..
            } => {
                let cond = condition.as_ref().unwrap();
                assert_eq!(cond.field.as_deref(), Some("order.total"));
                assert_eq!(cond.operator, Some(ConditionOp::Gt));
                assert_eq!(on_true.as_deref(), Some("block-order"));
                assert_eq!(on_false.as_deref(), Some("allow-order"));
            }
            other => panic!("expected condition step, got {other:?}"),
        }

        let serialized = serde_json::to_value(&step).unwrap();
        assert_eq!(serialized["type"], "condition");
        assert_eq!(serialized["on_true"], "block-order");
    }

    #[test]
    fn test_action_step_roundtrip() {
        let step = step_from_json(json!({
            "id": "block-order",
            "type": "action",
            "action": { "type": "block", "reason": "High value" }
        }));
        match &step.kind {
            StepKind::Action { action, execute } => {
                assert_eq!(action.action_type, ActionType::Block);
                assert_eq!(action.reason.as_deref(), Some("High value"));
                assert!(execute.is_empty());
            }
            other => panic!("expected action step, got {other:?}"),
        }
    }

    #[test]
    fn test_wait_step_with_metadata() {
        let step = step_from_json(json!({
            "id": "await-approval",
            "type": "wait",
            "wait": { "event": "approval.granted", "timeout": "24h", "on_timeout": "escalate" },
            "metadata": { "on_resume": "post-approval" }
        }));
        match &step.kind {
            StepKind::Wait { wait } => {
                assert_eq!(wait.event, "approval.granted");
                assert_eq!(wait.timeout.as_deref(), Some("24h"));
                assert_eq!(wait.on_timeout.as_deref(), Some("escalate"));
            }
            other => panic!("expected wait step, got {other:?}"),
        }
        assert_eq!(step.metadata["on_resume"], json!("post-approval"));
    }

    #[test]
    fn test_parallel_step_default_strategy() {
        let step = step_from_json(json!({
            "id": "fan-out",
            "type": "parallel",
            "parallel": {
                "steps": [
                    { "id": "notify-ops", "type": "execute", "execute": [] }
                ]
            },
            "next": "after"
        }));
        match &step.kind {
            StepKind::Parallel { parallel } => {
                assert_eq!(parallel.strategy, ParallelStrategy::AllMustPass);
                assert_eq!(parallel.steps.len(), 1);
            }
            other => panic!("expected parallel step, got {other:?}"),
        }
        assert_eq!(step.next.as_deref(), Some("after"));
    }

    #[test]
    fn test_foreach_step_roundtrip() {
        let step = step_from_json(json!({
            "id": "per-item",
            "type": "foreach",
            "foreach": {
                "items": "{{order.items}}",
                "item_var": "item",
                "steps": [
                    { "id": "log-item", "type": "execute",
                      "execute": [ { "type": "log", "message": "item seen" } ] }
                ]
            }
        }));
        match &step.kind {
            StepKind::Foreach { foreach } => {
                assert_eq!(foreach.items, "{{order.items}}");
                assert_eq!(foreach.item_var, "item");
                assert_eq!(foreach.steps.len(), 1);
            }
            other => panic!("expected foreach step, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Sub-actions
    // -----------------------------------------------------------------------

    #[test]
    fn test_webhook_accepts_http_request_alias() {
        let sub: SubAction = serde_json::from_value(json!({
            "type": "http_request",
            "url": "https://hooks.example.com/x",
            "body": { "order_id": "${order.id}" }
        }))
        .unwrap();
        match sub {
            SubAction::Webhook { url, method, body, .. } => {
                assert_eq!(url, "https://hooks.example.com/x");
                assert!(method.is_none());
                assert_eq!(body["order_id"], json!("${order.id}"));
            }
            other => panic!("expected webhook, got {other:?}"),
        }
    }

    #[test]
    fn test_sub_action_variants_roundtrip() {
        for value in [
            json!({ "type": "notify", "recipients": ["ops"], "message": "hi" }),
            json!({ "type": "create_record", "entity": "ticket", "data": { "a": 1 } }),
            json!({ "type": "update_record", "entity": "ticket", "entity_id": "t-1", "data": {} }),
            json!({ "type": "log", "data": { "k": "v" } }),
        ] {
            let sub: SubAction = serde_json::from_value(value.clone()).unwrap();
            let back = serde_json::to_value(&sub).unwrap();
            assert_eq!(back["type"], value["type"]);
        }
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[test]
    fn test_condition_op_symbol_aliases() {
        for (symbol, op) in [
            ("==", ConditionOp::Eq),
            ("!=", ConditionOp::Neq),
            (">", ConditionOp::Gt),
            (">=", ConditionOp::Gte),
            ("<", ConditionOp::Lt),
            ("<=", ConditionOp::Lte),
        ] {
            let parsed: ConditionOp =
                serde_json::from_value(json!(symbol)).unwrap_or_else(|e| {
                    panic!("operator alias '{symbol}' failed to parse: {e}")
                });
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn test_unknown_operator_rejected_at_parse() {
        let result: Result<ConditionOp, _> = serde_json::from_value(json!("almost"));
        assert!(result.is_err());
    }

    #[test]
    fn test_condition_tree_nesting() {
        let cond: ConditionExpr = serde_json::from_value(json!({
            "and": [
                { "field": "order.total", "operator": "gte", "value": 1000 },
                { "or": [
                    { "field": "customer.tier", "operator": "eq", "value": "gold" },
                    { "field": "customer.tier", "operator": "eq", "value": "platinum" }
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(cond.and.len(), 2);
        assert_eq!(cond.and[1].or.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Trigger & retry defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_trigger_timeout_seconds() {
        let trigger: TriggerSpec = serde_json::from_value(json!({
            "type": "event",
            "event": "order.created",
            "data": { "timeout_seconds": 45 }
        }))
        .unwrap();
        assert_eq!(trigger.timeout_seconds(), Some(45.0));

        let trigger: TriggerSpec = serde_json::from_value(json!({
            "type": "event",
            "event": "order.created",
            "data": { "timeout_seconds": -3 }
        }))
        .unwrap();
        assert_eq!(trigger.timeout_seconds(), None);

        let trigger: TriggerSpec =
            serde_json::from_value(json!({ "type": "manual" })).unwrap();
        assert_eq!(trigger.timeout_seconds(), None);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert!(policy.retry_on.is_empty());
    }

    // -----------------------------------------------------------------------
    // Whole definition (JSON and YAML)
    // -----------------------------------------------------------------------

    #[test]
    fn test_definition_json_roundtrip() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "timeout": "5m",
            "trigger": { "type": "event", "event": "order.*" },
            "context": { "load": ["order.details", "customer.profile"] },
            "steps": [
                { "id": "s1", "type": "condition",
                  "condition": { "field": "order.total", "operator": "gt", "value": 1000 },
                  "on_true": "s2", "on_false": "s3" },
                { "id": "s2", "type": "action", "action": { "type": "block" } },
                { "id": "s3", "type": "action", "action": { "type": "allow" } }
            ]
        }))
        .unwrap();

        assert_eq!(def.timeout.as_deref(), Some("5m"));
        assert_eq!(def.context.as_ref().unwrap().load.len(), 2);
        assert_eq!(def.steps.len(), 3);

        let back = serde_json::to_value(&def).unwrap();
        let reparsed: WorkflowDefinition = serde_json::from_value(back).unwrap();
        assert_eq!(reparsed.steps.len(), 3);
    }

    #[test]
    fn test_definition_yaml_parse() {
        let yaml = r#"
timeout: 30s
trigger:
  type: event
  event: payment.failed
steps:
  - id: retry-charge
    type: execute
    retry:
      max_attempts: 3
      backoff: exponential
      retry_on: ["*"]
    execute:
      - type: webhook
        url: https://billing.example.com/retry
        body:
          payment_id: "${payment.id}"
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.timeout.as_deref(), Some("30s"));
        assert_eq!(def.steps[0].retry.as_ref().unwrap().retry_on, vec!["*"]);
        assert_eq!(def.steps[0].kind.type_name(), "execute");
    }
}
