//! reqwest-backed `ActionSink`.
//!
//! Webhook sends succeed only for 2xx responses. Record operations go to a
//! configured record service; without one they fail as resource errors
//! (the dispatcher collects these per entry, so an unconfigured service
//! degrades gracefully). Notifications post to a notification service when
//! configured, else they are logged and considered delivered --
//! fire-and-forget is the contract.

use std::time::Duration;

use opsflow_core::engine::EngineError;
use opsflow_core::engine::actions::{ActionSink, WebhookRequest};
use opsflow_types::ContextMap;
use reqwest::Method;
use serde_json::{Value, json};
use uuid::Uuid;

/// Outbound HTTP sink for sub-action side effects.
pub struct HttpActionSink {
    client: reqwest::Client,
    record_base_url: Option<String>,
    notification_base_url: Option<String>,
}

impl HttpActionSink {
    /// Build a sink with the given client timeout (applies to webhooks and
    /// service calls alike).
    pub fn new(
        timeout: Duration,
        record_base_url: Option<String>,
        notification_base_url: Option<String>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Resource(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            record_base_url: record_base_url.map(|u| trim_base(&u)),
            notification_base_url: notification_base_url.map(|u| trim_base(&u)),
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Resource(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Resource(format!(
                "{url} returned status {status}"
            )));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn parse_method(raw: &str) -> Method {
    raw.parse::<Method>().unwrap_or(Method::POST)
}

impl ActionSink for HttpActionSink {
    async fn notify(
        &self,
        organization_id: Uuid,
        recipients: &[String],
        message: &str,
    ) -> Result<Value, EngineError> {
        match &self.notification_base_url {
            Some(base) => {
                self.post_json(
                    &format!("{base}/notifications"),
                    &json!({
                        "organization_id": organization_id,
                        "recipients": recipients,
                        "message": message,
                    }),
                )
                .await
            }
            None => {
                tracing::info!(
                    organization_id = %organization_id,
                    recipients = recipients.len(),
                    message,
                    "notification (log-only delivery)"
                );
                Ok(json!({ "delivered": recipients.len(), "transport": "log" }))
            }
        }
    }

    async fn send_webhook(
        &self,
        organization_id: Uuid,
        request: WebhookRequest,
    ) -> Result<Value, EngineError> {
        let mut builder = self
            .client
            .request(parse_method(&request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&request.body)
            .send()
            .await
            .map_err(|e| {
                EngineError::Resource(format!("webhook to {} failed: {e}", request.url))
            })?;

        let status = response.status();
        tracing::debug!(
            organization_id = %organization_id,
            url = request.url.as_str(),
            status = status.as_u16(),
            "webhook sent"
        );
        if !status.is_success() {
            return Err(EngineError::Resource(format!(
                "webhook to {} returned status {status}",
                request.url
            )));
        }
        Ok(json!({ "status": status.as_u16() }))
    }

    async fn create_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        data: &ContextMap,
    ) -> Result<Value, EngineError> {
        let base = self.record_base_url.as_deref().ok_or_else(|| {
            EngineError::Resource("record service not configured".to_string())
        })?;
        self.post_json(
            &format!("{base}/organizations/{organization_id}/records/{entity}"),
            &Value::Object(data.clone()),
        )
        .await
    }

    async fn update_record(
        &self,
        organization_id: Uuid,
        entity: &str,
        entity_id: &str,
        data: &ContextMap,
    ) -> Result<Value, EngineError> {
        let base = self.record_base_url.as_deref().ok_or_else(|| {
            EngineError::Resource("record service not configured".to_string())
        })?;
        let url =
            format!("{base}/organizations/{organization_id}/records/{entity}/{entity_id}");

        let response = self
            .client
            .patch(&url)
            .json(&Value::Object(data.clone()))
            .send()
            .await
            .map_err(|e| EngineError::Resource(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Resource(format!(
                "{url} returned status {status}"
            )));
        }
        Ok(json!({ "status": status.as_u16() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimming() {
        assert_eq!(trim_base("https://records.internal/"), "https://records.internal");
        assert_eq!(trim_base("https://records.internal"), "https://records.internal");
    }

    #[test]
    fn test_method_parsing_defaults_to_post() {
        assert_eq!(parse_method("GET"), Method::GET);
        assert_eq!(parse_method("put"), Method::PUT);
        assert_eq!(parse_method("not-a-method "), Method::POST);
    }

    #[tokio::test]
    async fn test_notify_without_service_is_log_only() {
        let sink = HttpActionSink::new(Duration::from_secs(5), None, None).unwrap();
        let detail = sink
            .notify(Uuid::now_v7(), &["ops".to_string()], "deploy done")
            .await
            .unwrap();
        assert_eq!(detail["transport"], json!("log"));
        assert_eq!(detail["delivered"], json!(1));
    }

    #[tokio::test]
    async fn test_record_ops_require_service() {
        let sink = HttpActionSink::new(Duration::from_secs(5), None, None).unwrap();
        let err = sink
            .create_record(Uuid::now_v7(), "ticket", &ContextMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("record service not configured"));
    }
}
