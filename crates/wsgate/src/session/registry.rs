//! In-process registry of live upgraded connections.
//!
//! Every long-lived proxied request (code-server WebSocket reconnection
//! channels) is tracked here under a logical session id (`"u:" + username`)
//! so logout, admin action or revocation can cancel it out-of-band. The
//! inner mutex is held only for map updates, never across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use super::revoker::Revoker;

/// Something that can drop its idle pooled connections. Implemented by the
/// per-request proxy transports; releasing a handle lets the pool drain
/// once in-flight requests finish.
pub trait IdleClose: Send + Sync {
    fn close_idle(&self);
}

#[derive(Default)]
struct Inner {
    conns: HashMap<String, HashMap<String, CancellationToken>>,
    transports: HashMap<String, Vec<Arc<dyn IdleClose>>>,
}

/// Registry of upgraded connections per logical session.
pub struct ConnRegistry {
    inner: Mutex<Inner>,
    revoker: Arc<Revoker>,
}

impl ConnRegistry {
    pub fn new(revoker: Arc<Revoker>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            revoker,
        }
    }

    /// Track an upgraded connection. The token is the caller's cancellation
    /// rope; the transport (if any) is closed when the session empties.
    pub fn add_conn(
        &self,
        session_id: &str,
        conn_id: &str,
        cancel: CancellationToken,
        transport: Option<Arc<dyn IdleClose>>,
    ) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .conns
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), cancel);
        if let Some(tr) = transport {
            inner
                .transports
                .entry(session_id.to_string())
                .or_default()
                .push(tr);
        }
    }

    /// Remove a connection record without cancelling it.
    pub fn remove_conn(&self, session_id: &str, conn_id: &str) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(m) = inner.conns.get_mut(session_id) {
            m.remove(conn_id);
            if m.is_empty() {
                inner.conns.remove(session_id);
                inner.transports.remove(session_id);
            }
        }
    }

    /// Connection ids currently tracked for a session.
    pub fn list_conns(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .conns
            .get(session_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All sessions with their connection counts.
    pub fn list_sessions(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .conns
            .iter()
            .map(|(sid, m)| (sid.clone(), m.len()))
            .collect()
    }

    /// Cancel a single connection. If it was the last one of the session,
    /// idle connections on every stored transport are closed and the
    /// session record is dropped.
    pub fn cancel_conn(&self, session_id: &str, conn_id: &str) -> bool {
        let (cancel, transports) = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            let Some(m) = inner.conns.get_mut(session_id) else {
                return false;
            };
            let Some(cancel) = m.remove(conn_id) else {
                return false;
            };
            let transports = if m.is_empty() {
                inner.conns.remove(session_id);
                inner.transports.remove(session_id).unwrap_or_default()
            } else {
                Vec::new()
            };
            (cancel, transports)
        };

        cancel.cancel();
        for tr in &transports {
            tr.close_idle();
        }
        true
    }

    /// Cancel every connection of a session and drop it. When
    /// `add_to_revoke_list` is set, the user derived from the session id is
    /// latched in the revoker together with the cancel-handle snapshot so
    /// the next request the user makes completes the revocation.
    pub fn cancel_all(&self, session_id: &str, add_to_revoke_list: bool) -> usize {
        let (cancels, transports) = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            let cancels = inner.conns.remove(session_id).unwrap_or_default();
            let transports = inner.transports.remove(session_id).unwrap_or_default();

            if add_to_revoke_list {
                if let Some(user) = session_id.split(':').nth(1) {
                    self.revoker
                        .add_revoked(user, cancels.values().cloned().collect());
                    info!("user revoked: {user}");
                }
            }
            (cancels, transports)
        };

        let count = cancels.len();
        for cancel in cancels.values() {
            cancel.cancel();
        }
        for tr in &transports {
            tr.close_idle();
        }
        count
    }

    /// Close idle pooled connections without cancelling in-flight requests.
    pub fn close_idle(&self, session_id: &str) -> bool {
        let transports = {
            let inner = self.inner.lock().expect("registry mutex poisoned");
            match inner.transports.get(session_id) {
                Some(t) => t.clone(),
                None => return false,
            }
        };
        for tr in &transports {
            tr.close_idle();
        }
        true
    }

    /// Remove records whose connection has already ended. Cancellation and
    /// natural request completion both mark the token cancelled.
    pub fn sweep_closed(&self) -> usize {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let mut removed = 0;
        inner.conns.retain(|_, m| {
            m.retain(|_, cancel| {
                if cancel.is_cancelled() {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            !m.is_empty()
        });
        let live: Vec<String> = inner.conns.keys().cloned().collect();
        inner.transports.retain(|sid, _| live.contains(sid));
        removed
    }

    /// Run the sweep on a periodic tick until the parent token is
    /// cancelled.
    pub fn start_janitor(self: Arc<Self>, parent: CancellationToken, interval: Duration) {
        let registry = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = registry.sweep_closed();
                        if removed > 0 {
                            debug!("janitor removed {removed} closed connections");
                        }
                    }
                    _ = parent.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        closed: std::sync::atomic::AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: std::sync::atomic::AtomicUsize::new(0),
            })
        }
        fn closed(&self) -> usize {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl IdleClose for FakeTransport {
        fn close_idle(&self) {
            self.closed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn registry() -> ConnRegistry {
        ConnRegistry::new(Arc::new(Revoker::new()))
    }

    #[test]
    fn add_list_remove() {
        let reg = registry();
        reg.add_conn("u:alice", "c1", CancellationToken::new(), None);
        reg.add_conn("u:alice", "c2", CancellationToken::new(), None);
        assert_eq!(reg.list_conns("u:alice").len(), 2);
        assert_eq!(reg.list_sessions().get("u:alice"), Some(&2));

        reg.remove_conn("u:alice", "c1");
        assert_eq!(reg.list_conns("u:alice").len(), 1);
        reg.remove_conn("u:alice", "c2");
        assert!(reg.list_sessions().is_empty());
    }

    #[test]
    fn cancel_conn_closes_idle_on_last() {
        let reg = registry();
        let tr = FakeTransport::new();
        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        reg.add_conn("u:alice", "c1", t1.clone(), Some(tr.clone()));
        reg.add_conn("u:alice", "c2", t2.clone(), None);

        assert!(reg.cancel_conn("u:alice", "c1"));
        assert!(t1.is_cancelled());
        // Not the last connection yet, pool stays open.
        assert_eq!(tr.closed(), 0);

        assert!(reg.cancel_conn("u:alice", "c2"));
        assert!(t2.is_cancelled());
        assert_eq!(tr.closed(), 1);
        assert!(!reg.cancel_conn("u:alice", "c2"));
    }

    #[test]
    fn cancel_all_latches_revoker() {
        let revoker = Arc::new(Revoker::new());
        let reg = ConnRegistry::new(revoker.clone());
        let tr = FakeTransport::new();
        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        reg.add_conn("u:alice", "c1", t1.clone(), Some(tr.clone()));
        reg.add_conn("u:alice", "c2", t2.clone(), None);

        let n = reg.cancel_all("u:alice", true);
        assert_eq!(n, 2);
        assert!(t1.is_cancelled() && t2.is_cancelled());
        assert_eq!(tr.closed(), 1);
        assert!(revoker.should_logout("alice"));
        assert!(reg.list_sessions().is_empty());
    }

    #[test]
    fn cancel_all_without_revoke_list() {
        let revoker = Arc::new(Revoker::new());
        let reg = ConnRegistry::new(revoker.clone());
        reg.add_conn("u:bob", "c1", CancellationToken::new(), None);
        assert_eq!(reg.cancel_all("u:bob", false), 1);
        assert!(!revoker.should_logout("bob"));
    }

    #[test]
    fn close_idle_does_not_cancel() {
        let reg = registry();
        let tr = FakeTransport::new();
        let token = CancellationToken::new();
        reg.add_conn("u:alice", "c1", token.clone(), Some(tr.clone()));

        assert!(reg.close_idle("u:alice"));
        assert_eq!(tr.closed(), 1);
        assert!(!token.is_cancelled());
        assert_eq!(reg.list_conns("u:alice").len(), 1);
        assert!(!reg.close_idle("u:nobody"));
    }

    #[test]
    fn sweep_removes_finished_connections() {
        let reg = registry();
        let done = CancellationToken::new();
        let live = CancellationToken::new();
        reg.add_conn("u:alice", "done", done.clone(), None);
        reg.add_conn("u:alice", "live", live.clone(), None);
        done.cancel();

        assert_eq!(reg.sweep_closed(), 1);
        assert_eq!(reg.list_conns("u:alice"), vec!["live".to_string()]);

        live.cancel();
        assert_eq!(reg.sweep_closed(), 1);
        assert!(reg.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn janitor_sweeps_on_tick() {
        let reg = Arc::new(registry());
        let token = CancellationToken::new();
        reg.add_conn("u:alice", "c1", token.clone(), None);
        token.cancel();

        let parent = CancellationToken::new();
        reg.clone().start_janitor(parent.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.list_sessions().is_empty());
        parent.cancel();
    }
}
