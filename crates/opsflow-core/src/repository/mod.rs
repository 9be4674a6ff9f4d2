//! Repository trait definitions (the persistence ports).
//!
//! Every operation is tenant-scoped: it takes an `organization_id` and must
//! reject rows belonging to other tenants. The infrastructure layer
//! (opsflow-infra) implements these traits with SQLite; `memory` provides
//! in-process implementations for tests and embedding.

pub mod approval;
pub mod event;
pub mod execution;
pub mod memory;
pub mod workflow;
