//! wsgate agent.
//!
//! Runs on every backend host: manages workspace containers over the
//! docker/podman CLI, serves host CPU/RAM telemetry, proxies
//! `/code-server/*` traffic into containers on the same host and keeps its
//! discovery lease alive with periodic heartbeats.

pub mod auth;
pub mod config;
pub mod containers;
pub mod handlers;
pub mod heartbeat;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod serve;
pub mod state;

pub use state::AppState;
