//! # Calendar Sync
//!
//! This crate keeps each rental property's availability calendar in step with
//! the external channels it is listed on. It provides the respectful adaptive
//! sync scheduler together with the collaborators it talks to: the property
//! store and the calendar extraction service.

/// Types shared by the scheduler and its collaborators
mod sync_types;
pub use sync_types::*;

/// Scheduler configuration and environment loading
mod config;
pub use config::*;

/// Wall-clock abstraction
mod clock;
pub use clock::*;

/// Per-domain request metrics
mod domain_metrics;
pub use domain_metrics::*;

/// Adaptive delay, backoff and circuit breaker policy
mod adaptive;
pub use adaptive::*;

/// Property persistence
mod property_store;
pub use property_store::*;

/// Calendar extraction service client
mod extraction_client;
pub use extraction_client::*;

/// The sync scheduler: triggers, batches and metered syncs
mod scheduler;
pub use scheduler::*;

/// Manual, on-demand sync of a single property
mod manual_sync;

/// Status snapshot and scraping health diagnostics
mod health;
pub use health::*;

#[cfg(test)]
mod test_support;
