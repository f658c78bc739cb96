/// REST API module for the circuit daemon
///
/// Provides HTTP endpoints for dashboards and scripts to query:
/// - Path-bias counters per entry guard
/// - Open origin circuits and build-time state
/// - The resolved path-bias thresholds

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::ApiServer;
pub use responses::*;
