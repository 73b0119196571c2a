//! Per-request upstream transport.
//!
//! Mirrors the deployed transport profile: generous dial and keep-alive
//! windows, a large idle pool with a long idle timeout, TLS 1.2 exactly
//! with certificate verification disabled (agents sit on a private
//! segment with self-signed certs). The non-base variant additionally
//! tolerates very slow upstream response starts for long-lived streams.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::tls::Version;

use wsgate::IdleClose;

const DIAL_TIMEOUT: Duration = Duration::from_secs(120);
const KEEP_ALIVE: Duration = Duration::from_secs(120);
const MAX_IDLE: usize = 100;
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(900);

/// One request's outgoing HTTP client. Dropping or closing it releases the
/// idle pool; clones held by in-flight calls keep their connections until
/// they finish.
pub struct ProxyTransport {
    inner: Mutex<Option<reqwest::Client>>,
}

impl ProxyTransport {
    fn build(base: bool) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(Version::TLS_1_2)
            .max_tls_version(Version::TLS_1_2)
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .pool_max_idle_per_host(MAX_IDLE)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none());
        if !base {
            builder = builder.read_timeout(RESPONSE_HEADER_TIMEOUT);
        }
        builder.build()
    }

    /// The base profile used for interactive proxying.
    pub fn base() -> Result<Self, reqwest::Error> {
        Ok(Self {
            inner: Mutex::new(Some(Self::build(true)?)),
        })
    }

    /// The streaming profile with a long response-start allowance.
    pub fn streaming() -> Result<Self, reqwest::Error> {
        Ok(Self {
            inner: Mutex::new(Some(Self::build(false)?)),
        })
    }

    /// A clone of the client, unless idle connections were already closed.
    pub fn client(&self) -> Option<reqwest::Client> {
        self.inner.lock().expect("transport mutex poisoned").clone()
    }
}

impl IdleClose for ProxyTransport {
    fn close_idle(&self) {
        // Dropping the pooled client closes its idle connections; in-flight
        // clones finish their requests first.
        self.inner.lock().expect("transport mutex poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_idle_drops_the_pool() {
        let tr = ProxyTransport::base().unwrap();
        assert!(tr.client().is_some());
        tr.close_idle();
        assert!(tr.client().is_none());
        // Closing twice is harmless.
        tr.close_idle();
        assert!(tr.client().is_none());
    }

    #[test]
    fn clones_survive_close() {
        let tr = ProxyTransport::streaming().unwrap();
        let held = tr.client().unwrap();
        tr.close_idle();
        // The in-flight clone is still usable.
        drop(held);
    }
}
