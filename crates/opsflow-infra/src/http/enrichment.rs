//! reqwest-backed `ResourceLoader` for context loads.
//!
//! Fetches `context.load` resources from the enrichment service. The
//! context builder treats loader errors as soft failures (logged,
//! skipped), so an unreachable service never fails an execution.

use std::time::Duration;

use opsflow_core::engine::EngineError;
use opsflow_core::engine::context::ResourceLoader;
use serde_json::Value;
use uuid::Uuid;

/// HTTP loader for external context resources.
pub struct HttpResourceLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResourceLoader {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Resource(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn resource_url(&self, organization_id: Uuid, resource: &str, identifier: &str) -> String {
        format!(
            "{}/organizations/{organization_id}/resources/{resource}?id={identifier}",
            self.base_url
        )
    }
}

impl ResourceLoader for HttpResourceLoader {
    async fn load(
        &self,
        organization_id: Uuid,
        resource: &str,
        identifier: &str,
    ) -> Result<Value, EngineError> {
        let url = self.resource_url(organization_id, resource, identifier);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Resource(format!("enrichment fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Resource(format!(
                "enrichment service returned status {status} for {resource}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Resource(format!("enrichment response invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_url_shape() {
        let loader =
            HttpResourceLoader::new("https://enrich.internal/".to_string(), Duration::from_secs(5))
                .unwrap();
        let org = Uuid::nil();
        let url = loader.resource_url(org, "order.details", "o-42");
        assert_eq!(
            url,
            format!("https://enrich.internal/organizations/{org}/resources/order.details?id=o-42")
        );
    }
}
