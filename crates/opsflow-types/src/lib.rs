//! Shared domain types for Opsflow.
//!
//! This crate contains the core domain types used across the Opsflow engine:
//! workflow definitions (the canonical IR), execution and step records,
//! inbound events, approval requests, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;

/// The JSON-shaped working data map visible to conditions, templates, and
/// action interpolation. Keys are merged from the trigger payload, loaded
/// resources, and computed enrichment fields.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;
