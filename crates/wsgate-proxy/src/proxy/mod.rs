//! Reverse proxy into workspace agents.
//!
//! Split into a pure director (request shape → target + header mutations),
//! a per-request transport, a response mutator and the handler that ties
//! them together. Each incoming request carries exactly one outgoing
//! transport instance; it is never shared and is closed with the
//! connection.

pub mod director;
pub mod handler;
pub mod response;
pub mod transport;

pub use handler::code_server_proxy;
pub use transport::ProxyTransport;
