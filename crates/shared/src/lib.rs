#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the lead billing services
//!
//! Database pool construction, embedded migrations and the best-effort
//! webhook dedup cache used in front of the lead ledger.

pub mod db;
pub mod dedup;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use dedup::{payload_fingerprint, DedupCache, DedupCacheError};
