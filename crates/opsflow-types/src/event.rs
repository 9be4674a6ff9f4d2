//! Inbound trigger event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ContextMap;

/// An inbound event as recorded by the router before workflow matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Opaque short string for external display (`evt_` + 8 hex).
    pub event_id: String,
    /// Dotted event name, e.g. "order.created".
    pub event_type: String,
    /// Producer identifier, e.g. "storefront" or "scheduler".
    pub source: String,
    #[serde(default)]
    pub payload: ContextMap,
    pub received_at: DateTime<Utc>,
    /// Set once routing has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Workflows spawned for this event.
    #[serde(default)]
    pub triggered_workflows: Vec<Uuid>,
}

impl Event {
    pub fn display_id() -> String {
        let raw = Uuid::now_v7().simple().to_string();
        format!("evt_{}", &raw[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let event = Event {
            id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            event_id: Event::display_id(),
            event_type: "order.created".to_string(),
            source: "storefront".to_string(),
            payload: serde_json::from_value(json!({ "order": { "id": "o-1" } })).unwrap(),
            received_at: Utc::now(),
            processed_at: None,
            triggered_workflows: vec![],
        };
        let value = serde_json::to_value(&event).unwrap();
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back.event_type, "order.created");
        assert!(back.event_id.starts_with("evt_"));
    }
}
