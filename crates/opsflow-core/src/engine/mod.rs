//! Workflow execution kernel.
//!
//! This module contains the "brain" of the engine:
//! - `definition` -- JSON/YAML parsing and load-time validation
//! - `duration` -- duration-string parsing and rendering for timeouts
//! - `evaluator` -- condition tree evaluation over the working context
//! - `context` -- context builder: trigger merge, resource loads, enrichment
//! - `actions` -- action dispatcher and the sub-action table
//! - `retry` -- backoff schedule and retryability checks
//! - `interpreter` -- the step interpreter / driver loop with pause/resume
//! - `router` -- event-to-workflow routing with panic-isolated spawns
//! - `sweeper` -- out-of-band deadline enforcement
//! - `approvals` -- approval-gated pause/resume lifecycle

pub mod actions;
pub mod approvals;
pub mod context;
pub mod definition;
pub mod duration;
pub mod evaluator;
pub mod interpreter;
pub mod retry;
pub mod router;
pub mod sweeper;

use opsflow_types::error::RepositoryError;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Error taxonomy surfaced by the kernel.
///
/// Variant messages are complete human-readable sentences; the variant
/// itself carries the classification (a `Timeout` comes from a deadline
/// signal, never from string matching).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed step or definition. Fails the step immediately; not retryable
    /// in the sense of transient faults, though `retry_on` still governs.
    #[error("{0}")]
    Validation(String),

    /// Workflow/step/execution id absent. Fatal for the calling operation.
    #[error("{0}")]
    NotFound(String),

    /// Operation invalid for the current execution status. Returned to the
    /// caller; the execution row is left untouched.
    #[error("{0}")]
    State(String),

    /// A workflow or step deadline fired.
    #[error("{0}")]
    Timeout(String),

    /// A store or external call failed.
    #[error("{0}")]
    Resource(String),

    /// A recovered panic from an execution task.
    #[error("panic recovered: {0}")]
    Panic(String),
}

impl EngineError {
    /// True when this error originated from a deadline signal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => EngineError::NotFound("entity not found".to_string()),
            other => EngineError::Resource(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_messages_are_verbatim() {
        let err = EngineError::NotFound("step not found: s9".to_string());
        assert_eq!(err.to_string(), "step not found: s9");

        let err = EngineError::Timeout("Workflow execution timed out after 30s".to_string());
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Workflow execution timed out after 30s");
    }

    #[test]
    fn repository_errors_map_to_taxonomy() {
        let err: EngineError = RepositoryError::NotFound.into();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err: EngineError = RepositoryError::Query("disk full".to_string()).into();
        assert!(matches!(err, EngineError::Resource(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
