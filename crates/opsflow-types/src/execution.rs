//! Execution tracking types: the durable `Execution` record, its per-step
//! trace rows, and the status/result enums the kernel transitions through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ContextMap;

// ---------------------------------------------------------------------------
// Status & result enums
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are write-once: no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Executed,
    Allowed,
    Blocked,
    Failed,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionResult::Executed => "executed",
            ExecutionResult::Allowed => "allowed",
            ExecutionResult::Blocked => "blocked",
            ExecutionResult::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Wait state
// ---------------------------------------------------------------------------

/// Durable record that an execution is parked on a `wait` step until a
/// named event (or its timeout) arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitState {
    /// Event name that resumes the execution.
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Step to continue from if the wait times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
    pub waiting_since: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One concrete run of a workflow definition against a trigger payload.
///
/// Invariants maintained by the kernel and enforced by tests:
/// - `status = waiting` implies `wait_state` and `current_step_id` are set.
/// - `status = paused` implies `paused_step_id` or `next_step_id` is set.
/// - Terminal rows set `completed_at` and `duration_ms` together, once.
/// - `timeout_at = started_at + timeout_duration` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Primary key (UUIDv7).
    pub id: Uuid,
    /// Owning tenant.
    pub organization_id: Uuid,
    /// Opaque short string for external display (`exec_` + 8 hex).
    pub execution_id: String,
    /// The workflow record driving this run.
    pub workflow_id: Uuid,
    /// Denormalized workflow name for display.
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Set only when the run reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    /// Trigger event name ("manual" for manual invocations).
    pub trigger_event: String,
    #[serde(default)]
    pub trigger_payload: ContextMap,
    /// Working data map at last persistence.
    #[serde(default)]
    pub context: ContextMap,

    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Workflow deadline in whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<i64>,

    // Pause fields (approval-style interruptions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub resume_data: ContextMap,
    #[serde(default)]
    pub resume_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resumed_at: Option<DateTime<Utc>>,

    // Wait fields (wait steps; distinct from pause).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_state: Option<WaitState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: ContextMap,
}

impl Execution {
    /// Generate an opaque display id: `exec_` + the first 8 hex digits of a
    /// fresh UUID.
    pub fn display_id() -> String {
        let raw = Uuid::now_v7().simple().to_string();
        format!("exec_{}", &raw[..8])
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// Lifecycle state of a single step attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl StepExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepExecutionStatus::Running => "running",
            StepExecutionStatus::Completed => "completed",
            StepExecutionStatus::Failed => "failed",
        }
    }
}

/// Per-step trace row. Ordered by `started_at` within an execution to
/// reconstruct the control-flow sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    /// Always equals the parent execution's organization.
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Wire-format step type ("condition", "action", ...).
    pub step_type: String,
    pub status: StepExecutionStatus,
    /// Context snapshot at step entry.
    #[serde(default)]
    pub input: ContextMap,
    /// Action/dispatch result, when the step produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serde_spelling() {
        for (status, s) in [
            (ExecutionStatus::Running, "running"),
            (ExecutionStatus::Waiting, "waiting"),
            (ExecutionStatus::Paused, "paused"),
            (ExecutionStatus::Completed, "completed"),
            (ExecutionStatus::Failed, "failed"),
            (ExecutionStatus::Cancelled, "cancelled"),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(s));
            assert_eq!(status.as_str(), s);
            let parsed: ExecutionStatus = serde_json::from_value(json!(s)).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_display_id_shape() {
        let id = Execution::display_id();
        assert!(id.starts_with("exec_"));
        assert_eq!(id.len(), "exec_".len() + 8);
        assert!(id["exec_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_wait_state_roundtrip() {
        let state = WaitState {
            event: "approval.granted".to_string(),
            timeout_at: Some(Utc::now()),
            on_timeout: Some("escalate".to_string()),
            waiting_since: Utc::now(),
        };
        let value = serde_json::to_value(&state).unwrap();
        let back: WaitState = serde_json::from_value(value).unwrap();
        assert_eq!(back.event, "approval.granted");
        assert_eq!(back.on_timeout.as_deref(), Some("escalate"));
    }
}
