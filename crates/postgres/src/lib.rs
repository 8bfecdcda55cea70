//! # Postgres
//!
//! Connection helpers for the vacation rental database that stores the
//! properties the calendar sync worker keeps up to date.

/// Connection pool setup and health check.
pub mod database;
