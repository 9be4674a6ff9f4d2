//! Context builder: trigger payload merge, resource loads, and enrichment.
//!
//! The working context starts as a copy of the trigger payload. Each
//! resource named in the definition's `context.load` list is fetched --
//! first from the shared KV cache, then from the pluggable enrichment
//! loader on a miss -- and merged under the resource name. Load failures
//! are logged and skipped; enrichment never fails an execution.
//!
//! Cache keys follow `context:{organization_id}:{resource}:{identifier}`,
//! where the identifier is pulled out of the context via a resource->path
//! table (`order.details` reads `order.id`). When no identifier can be
//! derived a fresh UUID is used, which makes the entry uncacheable but
//! still runs the fetch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opsflow_types::ContextMap;
use opsflow_types::workflow::ContextSpec;
use serde_json::{Value, json};
use uuid::Uuid;

use super::EngineError;
use crate::storage::kv_store::KvStore;

/// Version stamp written into `_meta` by the enrichment pass.
const ENRICHMENT_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// ResourceLoader port
// ---------------------------------------------------------------------------

/// Pluggable enrichment source for `context.load` resources.
///
/// Implementations live in opsflow-infra (HTTP) and in tests (static maps).
pub trait ResourceLoader: Send + Sync {
    /// Fetch a resource for a tenant by derived identifier.
    fn load(
        &self,
        organization_id: Uuid,
        resource: &str,
        identifier: &str,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;
}

impl<T: ResourceLoader> ResourceLoader for std::sync::Arc<T> {
    async fn load(
        &self,
        organization_id: Uuid,
        resource: &str,
        identifier: &str,
    ) -> Result<Value, EngineError> {
        self.as_ref().load(organization_id, resource, identifier).await
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Builds and refreshes the working data map for executions.
pub struct ContextBuilder<K, L> {
    cache: K,
    loader: L,
    cache_ttl: Option<Duration>,
}

impl<K: KvStore, L: ResourceLoader> ContextBuilder<K, L> {
    pub fn new(cache: K, loader: L, cache_ttl: Option<Duration>) -> Self {
        Self {
            cache,
            loader,
            cache_ttl,
        }
    }

    /// Build the initial working context from the trigger payload and the
    /// definition's load list, then run the enrichment pass.
    pub async fn build(
        &self,
        organization_id: Uuid,
        trigger_payload: &ContextMap,
        spec: Option<&ContextSpec>,
    ) -> ContextMap {
        let mut ctx: ContextMap = trigger_payload.clone();
        self.run_loads(organization_id, &mut ctx, spec).await;
        enrich(&mut ctx);
        ctx
    }

    /// Re-run the load pass against an existing context (used on resume).
    ///
    /// Keys added by callers between runs are preserved; loaded resources
    /// are refreshed in place. Ends with a fresh enrichment pass.
    pub async fn reload(
        &self,
        organization_id: Uuid,
        ctx: &mut ContextMap,
        spec: Option<&ContextSpec>,
    ) {
        self.run_loads(organization_id, ctx, spec).await;
        enrich(ctx);
    }

    async fn run_loads(
        &self,
        organization_id: Uuid,
        ctx: &mut ContextMap,
        spec: Option<&ContextSpec>,
    ) {
        let Some(spec) = spec else { return };

        for resource in &spec.load {
            let identifier = derive_identifier(ctx, resource);
            let key = cache_key(organization_id, resource, &identifier);

            match self.cache.get(&key).await {
                Ok(Some(cached)) => {
                    tracing::debug!(resource, key = key.as_str(), "context cache hit");
                    ctx.insert(resource.clone(), cached);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(resource, error = %err, "context cache read failed");
                }
            }

            match self.loader.load(organization_id, resource, &identifier).await {
                Ok(value) => {
                    if let Err(err) = self.cache.set(&key, &value, self.cache_ttl).await {
                        tracing::warn!(resource, error = %err, "context cache write failed");
                    }
                    ctx.insert(resource.clone(), value);
                }
                Err(err) => {
                    // Enrichment failures never fail the execution.
                    tracing::warn!(
                        resource,
                        organization_id = %organization_id,
                        error = %err,
                        "context load failed, continuing without resource"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Resource -> identifier-path table. Unlisted resources fall back to
/// `<first-segment>.id`.
fn identifier_path(resource: &str) -> String {
    match resource {
        "order.details" => "order.id".to_string(),
        "customer.profile" => "customer.id".to_string(),
        "product.inventory" => "product.id".to_string(),
        "account.details" => "account.id".to_string(),
        other => {
            let head = other.split('.').next().unwrap_or(other);
            format!("{head}.id")
        }
    }
}

/// Pull the identifier for a resource out of the context; fall back to a
/// generated unique id when the path does not resolve to a scalar.
fn derive_identifier(ctx: &ContextMap, resource: &str) -> String {
    let path = identifier_path(resource);
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

    match current {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => Uuid::now_v7().simple().to_string(),
    }
}

fn cache_key(organization_id: Uuid, resource: &str, identifier: &str) -> String {
    format!("context:{organization_id}:{resource}:{identifier}")
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Add `_meta`, `_computed`, and derived convenience flags to a context.
pub fn enrich(ctx: &mut ContextMap) {
    let now = Utc::now();

    ctx.insert(
        "_meta".to_string(),
        json!({
            "enriched_at": now.to_rfc3339(),
            "version": ENRICHMENT_VERSION,
        }),
    );
    ctx.insert(
        "_computed".to_string(),
        json!({
            "current_time": now.to_rfc3339(),
            "current_hour": now.format("%H").to_string().parse::<u32>().unwrap_or(0),
            "current_day_of_week": now.format("%A").to_string(),
            "current_date": now.format("%Y-%m-%d").to_string(),
        }),
    );

    if let Some(total) = ctx
        .get("order")
        .and_then(|o| o.get("total"))
        .and_then(Value::as_f64)
    {
        ctx.insert("order_is_high_value".to_string(), json!(total >= 10_000.0));
        ctx.insert(
            "order_is_medium_value".to_string(),
            json!((1_000.0..10_000.0).contains(&total)),
        );
        ctx.insert("order_is_low_value".to_string(), json!(total < 1_000.0));
    }

    if let Some(created_at) = ctx
        .get("customer")
        .and_then(|c| c.get("created_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        let age_days = (now - created_at.with_timezone(&Utc)).num_days();
        ctx.insert("customer_account_age_days".to_string(), json!(age_days));
        ctx.insert("customer_is_new".to_string(), json!(age_days < 30));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
