//! Shared core for the wsgate workspace gateway.
//!
//! Both tiers of the gateway link against this crate:
//!
//! - the **proxy backend** authenticates browser sessions and reverse-proxies
//!   into per-user workspace containers,
//! - the **agent** manages those containers on a backend host and publishes
//!   its liveness to the discovery registry.
//!
//! The crate owns everything that must behave identically on both sides:
//! the Redis-backed session store with encrypted token records, the signed
//! token service, the in-process registry of long-lived upgraded
//! connections, the revocation latch, and service discovery.

pub mod discovery;
pub mod groups;
pub mod kv;
pub mod mime;
pub mod netutil;
pub mod ownership;
pub mod session;
pub mod token;

pub use kv::{KvError, KvStore};
pub use session::registry::{ConnRegistry, IdleClose};
pub use session::revoker::Revoker;
pub use session::store::SessionStore;
pub use session::StoreError;
pub use token::{TokenError, TokenService};
