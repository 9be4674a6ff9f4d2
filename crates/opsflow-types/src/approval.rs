//! Approval gate records: out-of-band requests that can resume a paused
//! execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// A pending human decision tied to a paused execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Opaque short string for external display (`apr_` + 8 hex).
    pub request_id: String,
    /// The paused execution this decision resumes.
    pub execution_id: Uuid,
    /// What is being approved, e.g. "order".
    pub entity_type: String,
    pub entity_id: String,
    pub requester_id: String,
    /// Role whose members may decide, e.g. "finance-manager".
    pub approver_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    pub status: ApprovalStatus,
    /// Why the approval was requested.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn display_id() -> String {
        let raw = Uuid::now_v7().simple().to_string();
        format!("apr_{}", &raw[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_status_serde() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
        ] {
            let value = serde_json::to_value(status).unwrap();
            assert_eq!(value, serde_json::json!(status.as_str()));
            let back: ApprovalStatus = serde_json::from_value(value).unwrap();
            assert_eq!(back, status);
        }
    }
}
