//! Action dispatcher: the `allow`/`block`/`execute` table and the
//! sub-action list runner.
//!
//! Side-effect transports (notifications, webhooks, record CRUD) live
//! behind the `ActionSink` port; the dispatcher owns the contract: default
//! reasons, `${a.b}` body interpolation, the standard webhook headers, and
//! per-entry result collection. Individual sub-action failures never abort
//! the list -- each contributes a `{success, error?}` entry.
//!
//! The execution id is a call argument, never dispatcher state, so one
//! dispatcher instance serves concurrent executions safely.

use std::collections::HashMap;

use opsflow_types::ContextMap;
use opsflow_types::workflow::{ActionSpec, ActionType, SubAction};
use serde_json::{Value, json};
use uuid::Uuid;

use super::EngineError;

/// User-Agent sent on outbound webhook calls.
pub const USER_AGENT: &str = concat!("opsflow/", env!("CARGO_PKG_VERSION"));

const DEFAULT_ALLOW_REASON: &str = "Action allowed by workflow";
const DEFAULT_BLOCK_REASON: &str = "Action blocked by workflow";

// ---------------------------------------------------------------------------
// ActionSink port
// ---------------------------------------------------------------------------

/// A fully prepared outbound HTTP request for a webhook sub-action.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    /// Includes the standard headers (X-Request-ID, User-Agent, Content-Type).
    pub headers: HashMap<String, String>,
    /// Interpolated JSON body.
    pub body: Value,
}

/// Pluggable transport for sub-action side effects.
///
/// Implementations return a detail value on success; a webhook send must
/// succeed only for 2xx responses. Implementations live in opsflow-infra
/// (reqwest) and in tests (recording sinks).
pub trait ActionSink: Send + Sync {
    fn notify(
        &self,
        organization_id: Uuid,
        recipients: &[String],
        message: &str,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;

    fn send_webhook(
        &self,
        organization_id: Uuid,
        request: WebhookRequest,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;

    fn create_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        data: &ContextMap,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;

    fn update_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        entity_id: &str,
        data: &ContextMap,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;
}

impl<T: ActionSink> ActionSink for std::sync::Arc<T> {
    async fn notify(
        &self,
        organization_id: Uuid,
        recipients: &[String],
        message: &str,
    ) -> Result<Value, EngineError> {
        self.as_ref().notify(organization_id, recipients, message).await
    }

    async fn send_webhook(
        &self,
        organization_id: Uuid,
        request: WebhookRequest,
    ) -> Result<Value, EngineError> {
        self.as_ref().send_webhook(organization_id, request).await
    }

    async fn create_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        data: &ContextMap,
    ) -> Result<Value, EngineError> {
        self.as_ref().create_record(organization_id, entity, data).await
    }

    async fn update_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        entity_id: &str,
        data: &ContextMap,
    ) -> Result<Value, EngineError> {
        self.as_ref()
            .update_record(organization_id, entity, entity_id, data)
            .await
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of one sub-action in an `execute` list.
#[derive(Debug, Clone)]
pub struct SubActionResult {
    /// Wire-format sub-action type ("notify", "webhook", ...).
    pub action_type: String,
    pub success: bool,
    pub error: Option<String>,
    /// Transport-specific detail (e.g. HTTP status).
    pub detail: Value,
}

impl SubActionResult {
    /// JSON form stored inside step outputs.
    pub fn to_value(&self) -> Value {
        json!({
            "type": self.action_type,
            "success": self.success,
            "error": self.error,
            "detail": self.detail,
        })
    }
}

/// Structured result of an action step.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action: ActionType,
    pub success: bool,
    pub reason: Option<String>,
    pub results: Vec<SubActionResult>,
}

impl ActionResult {
    /// JSON form stored on the step trace row.
    pub fn to_value(&self) -> Value {
        json!({
            "action": match self.action {
                ActionType::Allow => "allow",
                ActionType::Block => "block",
                ActionType::Execute => "execute",
            },
            "success": self.success,
            "reason": self.reason,
            "results": self.results.iter().map(|r| r.to_value()).collect::<Vec<_>>(),
        })
    }
}

// ---------------------------------------------------------------------------
// ActionDispatcher
// ---------------------------------------------------------------------------

/// Dispatches action steps and sub-action lists through an `ActionSink`.
pub struct ActionDispatcher<A> {
    sink: A,
}

impl<A: ActionSink> ActionDispatcher<A> {
    pub fn new(sink: A) -> Self {
        Self { sink }
    }

    /// Dispatch an action step.
    pub async fn dispatch(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        action: &ActionSpec,
        execute: &[SubAction],
        ctx: &ContextMap,
    ) -> Result<ActionResult, EngineError> {
        match action.action_type {
            ActionType::Allow => Ok(ActionResult {
                action: ActionType::Allow,
                success: true,
                reason: Some(
                    action
                        .reason
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ALLOW_REASON.to_string()),
                ),
                results: vec![],
            }),
            ActionType::Block => Ok(ActionResult {
                action: ActionType::Block,
                success: true,
                reason: Some(
                    action
                        .reason
                        .clone()
                        .unwrap_or_else(|| DEFAULT_BLOCK_REASON.to_string()),
                ),
                results: vec![],
            }),
            ActionType::Execute => {
                let results = self
                    .run_sub_actions(organization_id, execution_id, execute, ctx)
                    .await;
                Ok(ActionResult {
                    action: ActionType::Execute,
                    success: true,
                    reason: action.reason.clone(),
                    results,
                })
            }
        }
    }

    /// Run a sub-action list, collecting one result entry per sub-action.
    pub async fn run_sub_actions(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        actions: &[SubAction],
        ctx: &ContextMap,
    ) -> Vec<SubActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for sub in actions {
            let result = self
                .run_one(organization_id, execution_id, sub, ctx)
                .await;
            if let Some(error) = &result.error {
                tracing::warn!(
                    organization_id = %organization_id,
                    execution_id = %execution_id,
                    action_type = result.action_type.as_str(),
                    error,
                    "sub-action failed"
                );
            }
            results.push(result);
        }
        results
    }

    async fn run_one(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        sub: &SubAction,
        ctx: &ContextMap,
    ) -> SubActionResult {
        match sub {
            SubAction::Notify {
                recipients,
                message,
            } => wrap(
                "notify",
                self.sink
                    .notify(organization_id, recipients, message)
                    .await,
            ),
            SubAction::Webhook {
                url,
                method,
                headers,
                body,
            } => {
                let request = build_webhook_request(url, method.as_deref(), headers, body, ctx);
                wrap(
                    "webhook",
                    self.sink.send_webhook(organization_id, request).await,
                )
            }
            SubAction::CreateRecord { entity, data } => wrap(
                "create_record",
                self.sink.create_record(organization_id, entity, data).await,
            ),
            SubAction::UpdateRecord {
                entity,
                entity_id,
                data,
            } => wrap(
                "update_record",
                self.sink
                    .update_record(organization_id, entity, entity_id, data)
                    .await,
            ),
            SubAction::Log { message, data } => {
                let log_data = Value::Object(data.clone());
                tracing::info!(
                    organization_id = %organization_id,
                    execution_id = %execution_id,
                    message = message.as_deref().unwrap_or(""),
                    data = %log_data,
                    "workflow log action"
                );
                SubActionResult {
                    action_type: "log".to_string(),
                    success: true,
                    error: None,
                    detail: Value::Null,
                }
            }
        }
    }
}

fn wrap(action_type: &str, outcome: Result<Value, EngineError>) -> SubActionResult {
    match outcome {
        Ok(detail) => SubActionResult {
            action_type: action_type.to_string(),
            success: true,
            error: None,
            detail,
        },
        Err(err) => SubActionResult {
            action_type: action_type.to_string(),
            success: false,
            error: Some(err.to_string()),
            detail: Value::Null,
        },
    }
}

// ---------------------------------------------------------------------------
// Webhook preparation
// ---------------------------------------------------------------------------

/// Build the outbound request: interpolate `${a.b}` body values from the
/// context and add the standard headers.
fn build_webhook_request(
    url: &str,
    method: Option<&str>,
    headers: &HashMap<String, String>,
    body: &ContextMap,
    ctx: &ContextMap,
) -> WebhookRequest {
    let mut merged_headers = headers.clone();
    merged_headers.insert(
        "X-Request-ID".to_string(),
        Uuid::now_v7().simple().to_string(),
    );
    merged_headers.insert("User-Agent".to_string(), USER_AGENT.to_string());
    merged_headers.insert("Content-Type".to_string(), "application/json".to_string());

    let interpolated: ContextMap = body
        .iter()
        .map(|(k, v)| (k.clone(), interpolate(v, ctx)))
        .collect();

    WebhookRequest {
        url: url.to_string(),
        method: method.unwrap_or("POST").to_string(),
        headers: merged_headers,
        body: Value::Object(interpolated),
    }
}

/// Replace a `"${a.b}"` string value with the referenced context value.
/// Unresolvable references and non-reference values pass through untouched.
fn interpolate(value: &Value, ctx: &ContextMap) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let Some(path) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
        return value.clone();
    };

    let mut current: Option<&Value> = None;
    for (i, segment) in path.split('.').enumerate() {
        current = match (i, current) {
            (0, _) => ctx.get(segment),
            (_, Some(Value::Object(map))) => map.get(segment),
            _ => None,
        };
        if current.is_none() {
            break;
        }
    }

    current.cloned().unwrap_or_else(|| value.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        webhooks: Mutex<Vec<WebhookRequest>>,
        notifications: Mutex<Vec<(Vec<String>, String)>>,
        fail_notify: bool,
    }

    impl ActionSink for &RecordingSink {
        async fn notify(
            &self,
            _organization_id: Uuid,
            recipients: &[String],
            message: &str,
        ) -> Result<Value, EngineError> {
            if self.fail_notify {
                return Err(EngineError::Resource("notifier unavailable".to_string()));
            }
            self.notifications
                .lock()
                .unwrap()
                .push((recipients.to_vec(), message.to_string()));
            Ok(json!({ "delivered": recipients.len() }))
        }

        async fn send_webhook(
            &self,
            _organization_id: Uuid,
            request: WebhookRequest,
        ) -> Result<Value, EngineError> {
            self.webhooks.lock().unwrap().push(request);
            Ok(json!({ "status": 200 }))
        }

        async fn create_record(
            &self,
            _organization_id: Uuid,
            entity: &str,
            _data: &ContextMap,
        ) -> Result<Value, EngineError> {
            Ok(json!({ "entity": entity, "created": true }))
        }

        async fn update_record(
            &self,
            _organization_id: Uuid,
            entity: &str,
            entity_id: &str,
            _data: &ContextMap,
        ) -> Result<Value, EngineError> {
            Ok(json!({ "entity": entity, "entity_id": entity_id, "updated": true }))
        }
    }

    fn ctx(value: serde_json::Value) -> ContextMap {
        serde_json::from_value(value).unwrap()
    }

    fn action(action_type: ActionType, reason: Option<&str>) -> ActionSpec {
        ActionSpec {
            action_type,
            reason: reason.map(str::to_string),
        }
    }

    // -------------------------------------------------------------------
    // allow / block defaults
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_allow_default_reason() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);
        let result = dispatcher
            .dispatch(
                Uuid::now_v7(),
                Uuid::now_v7(),
                &action(ActionType::Allow, None),
                &[],
                &ctx(json!({})),
            )
            .await
            .unwrap();
        assert_eq!(result.action, ActionType::Allow);
        assert!(result.success);
        assert_eq!(result.reason.as_deref(), Some("Action allowed by workflow"));
    }

    #[tokio::test]
    async fn test_block_explicit_reason() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);
        let result = dispatcher
            .dispatch(
                Uuid::now_v7(),
                Uuid::now_v7(),
                &action(ActionType::Block, Some("High value")),
                &[],
                &ctx(json!({})),
            )
            .await
            .unwrap();
        assert_eq!(result.action, ActionType::Block);
        assert_eq!(result.reason.as_deref(), Some("High value"));
    }

    // -------------------------------------------------------------------
    // execute list
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_execute_collects_per_entry_results() {
        let sink = RecordingSink {
            fail_notify: true,
            ..Default::default()
        };
        let dispatcher = ActionDispatcher::new(&sink);

        let subs: Vec<SubAction> = serde_json::from_value(json!([
            { "type": "notify", "recipients": ["ops"], "message": "hi" },
            { "type": "webhook", "url": "https://example.com/hook" },
            { "type": "create_record", "entity": "ticket" }
        ]))
        .unwrap();

        let result = dispatcher
            .dispatch(
                Uuid::now_v7(),
                Uuid::now_v7(),
                &action(ActionType::Execute, None),
                &subs,
                &ctx(json!({})),
            )
            .await
            .unwrap();

        // The failing notify does not abort the list.
        assert_eq!(result.results.len(), 3);
        assert!(!result.results[0].success);
        assert!(result.results[0].error.as_deref().unwrap().contains("notifier"));
        assert!(result.results[1].success);
        assert!(result.results[2].success);
    }

    // -------------------------------------------------------------------
    // webhook preparation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_webhook_interpolation_and_headers() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);

        let subs: Vec<SubAction> = serde_json::from_value(json!([
            { "type": "webhook",
              "url": "https://example.com/hook",
              "headers": { "X-Team": "risk" },
              "body": {
                  "order_id": "${order.id}",
                  "total": "${order.total}",
                  "missing": "${order.absent}",
                  "static": "plain"
              } }
        ]))
        .unwrap();

        dispatcher
            .run_sub_actions(
                Uuid::now_v7(),
                Uuid::now_v7(),
                &subs,
                &ctx(json!({ "order": { "id": "o-9", "total": 1500 } })),
            )
            .await;

        let sent = sink.webhooks.lock().unwrap();
        let request = &sent[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.body["order_id"], json!("o-9"));
        assert_eq!(request.body["total"], json!(1500));
        // Unresolvable references pass through untouched.
        assert_eq!(request.body["missing"], json!("${order.absent}"));
        assert_eq!(request.body["static"], json!("plain"));
        assert_eq!(request.headers["X-Team"], "risk");
        assert_eq!(request.headers["Content-Type"], "application/json");
        assert_eq!(request.headers["User-Agent"], USER_AGENT);
        assert!(!request.headers["X-Request-ID"].is_empty());
    }

    #[tokio::test]
    async fn test_webhook_request_ids_are_unique() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);
        let subs: Vec<SubAction> = serde_json::from_value(json!([
            { "type": "webhook", "url": "https://example.com/a" },
            { "type": "webhook", "url": "https://example.com/b" }
        ]))
        .unwrap();

        dispatcher
            .run_sub_actions(Uuid::now_v7(), Uuid::now_v7(), &subs, &ctx(json!({})))
            .await;

        let sent = sink.webhooks.lock().unwrap();
        assert_ne!(
            sent[0].headers["X-Request-ID"],
            sent[1].headers["X-Request-ID"]
        );
    }

    #[tokio::test]
    async fn test_explicit_method_preserved() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);
        let subs: Vec<SubAction> = serde_json::from_value(json!([
            { "type": "http_request", "url": "https://example.com", "method": "PUT" }
        ]))
        .unwrap();

        dispatcher
            .run_sub_actions(Uuid::now_v7(), Uuid::now_v7(), &subs, &ctx(json!({})))
            .await;

        assert_eq!(sink.webhooks.lock().unwrap()[0].method, "PUT");
    }

    // -------------------------------------------------------------------
    // log sub-action
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_log_sub_action_always_succeeds() {
        let sink = RecordingSink::default();
        let dispatcher = ActionDispatcher::new(&sink);
        let subs: Vec<SubAction> = serde_json::from_value(json!([
            { "type": "log", "message": "checkpoint", "data": { "k": 1 } }
        ]))
        .unwrap();

        let results = dispatcher
            .run_sub_actions(Uuid::now_v7(), Uuid::now_v7(), &subs, &ctx(json!({})))
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].action_type, "log");
    }
}
