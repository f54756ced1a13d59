//! Control-plane HTTP gateway for database-cluster fleets.
//!
//! Serves fleet-wide aggregated views, forwards database lifecycle
//! operations to per-cluster control planes, and proxies deep links to
//! individual cluster hosts.

pub mod cache;
pub mod client;
pub mod config;
pub mod core;
pub mod handlers;
pub mod logging;
pub mod merge;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod tokens;
pub(crate) mod utils;
