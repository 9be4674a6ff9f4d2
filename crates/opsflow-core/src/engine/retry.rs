//! Retry policy helpers: backoff schedule and retryability checks.
//!
//! Stateless functions consumed by the interpreter's per-step retry loop.
//! A deadline firing is never retried; the interpreter short-circuits on
//! `EngineError::Timeout` before consulting these.

use std::time::Duration;

use opsflow_types::workflow::Backoff;

/// Sleep before attempt `attempt + 1` (attempts are 1-based).
///
/// Exponential yields 1s, 2s, 4s, ...; linear yields 1s, 2s, 3s, ...
pub fn backoff_delay(backoff: Backoff, attempt: u32) -> Duration {
    match backoff {
        Backoff::Exponential => Duration::from_secs(1u64 << (attempt.saturating_sub(1)).min(16)),
        Backoff::Linear => Duration::from_secs(attempt as u64),
    }
}

/// An error is retryable iff `retry_on` is empty, contains `"*"`, or any
/// entry occurs as a substring of the rendered error.
pub fn is_retryable(error_text: &str, retry_on: &[String]) -> bool {
    if retry_on.is_empty() {
        return true;
    }
    retry_on
        .iter()
        .any(|pattern| pattern == "*" || error_text.contains(pattern.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        assert_eq!(backoff_delay(Backoff::Exponential, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(Backoff::Exponential, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(Backoff::Exponential, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(Backoff::Exponential, 4), Duration::from_secs(8));
    }

    #[test]
    fn test_linear_schedule() {
        assert_eq!(backoff_delay(Backoff::Linear, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(Backoff::Linear, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(Backoff::Linear, 3), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_is_capped() {
        // A runaway attempt count must not overflow the shift.
        let delay = backoff_delay(Backoff::Exponential, 100);
        assert_eq!(delay, Duration::from_secs(1 << 16));
    }

    #[test]
    fn test_empty_retry_on_matches_everything() {
        assert!(is_retryable("connection reset", &[]));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(is_retryable("anything at all", &["*".to_string()]));
    }

    #[test]
    fn test_substring_match() {
        let patterns = vec!["timeout".to_string(), "connection".to_string()];
        assert!(is_retryable("connection refused by peer", &patterns));
        assert!(is_retryable("upstream timeout", &patterns));
        assert!(!is_retryable("permission denied", &patterns));
    }
}
