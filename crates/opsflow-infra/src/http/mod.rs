//! Outbound HTTP adapters: the action sink (webhooks, record service,
//! notifications) and the context enrichment loader.

pub mod actions;
pub mod enrichment;
