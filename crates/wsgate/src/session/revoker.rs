//! Per-user revocation latch.
//!
//! When an administrator cancels a user's sessions, the user id and a
//! snapshot of the cancel handles that were live at that moment are parked
//! here. The next request the user makes consumes the latch: the session is
//! deleted from the store, the cookie expired and every parked handle
//! cancelled.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

/// Guarded map from user id to the cancel-handle snapshot captured at
/// revocation time.
#[derive(Default)]
pub struct Revoker {
    pending: RwLock<HashMap<String, Vec<CancellationToken>>>,
}

impl Revoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch a user for revocation with the given cancel-handle snapshot.
    pub fn add_revoked(&self, user: &str, handles: Vec<CancellationToken>) {
        self.pending
            .write()
            .expect("revoker lock poisoned")
            .insert(user.to_string(), handles);
    }

    /// Whether the user is latched for forced logout.
    pub fn should_logout(&self, user: &str) -> bool {
        self.pending
            .read()
            .expect("revoker lock poisoned")
            .contains_key(user)
    }

    /// Consume the latch entry, returning the parked cancel handles.
    pub fn take(&self, user: &str) -> Option<Vec<CancellationToken>> {
        self.pending
            .write()
            .expect("revoker lock poisoned")
            .remove(user)
    }
}
