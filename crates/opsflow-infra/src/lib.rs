//! Infrastructure layer for Opsflow.
//!
//! Contains implementations of the repository traits defined in
//! `opsflow-core`: SQLite storage (split reader/writer WAL pools), the
//! SQLite context cache, reqwest-based webhook/record/enrichment clients,
//! the TOML configuration loader, and tracing setup.

pub mod config;
pub mod http;
pub mod sqlite;
pub mod telemetry;
