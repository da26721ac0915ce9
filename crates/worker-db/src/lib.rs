//! Pooled SQLite adapter for the relational store (§6 "Relational store").
//!
//! This crate provides:
//! - [`DatabasePool`]: a pooled, WAL-mode SQLite connection manager
//! - schema migrations for `dealer_accounts`, `proxies`, `operations`,
//!   `transactions`, and `settings`
//! - row types for every table
//! - query helpers, including the optimistic-guarded operation-status
//!   update the job processor relies on to avoid reviving a terminal
//!   operation on duplicate job delivery

mod error;
mod migrations;
mod models;
mod pool;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use migrations::run_migrations;
pub use models::*;
pub use pool::{DatabasePool, PoolConfig, PoolState};
