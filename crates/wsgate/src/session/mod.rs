//! Server-side session management.
//!
//! A session binds a user to an encrypted access/refresh token pair stored
//! in the shared KV store, plus the set of live upgraded connections the
//! proxy is tracking for that user.

pub mod registry;
pub mod revoker;
pub mod store;

use thiserror::Error;

use crate::kv::KvError;

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The KV store is unreachable or timed out.
    #[error("session store unavailable: {0}")]
    Unavailable(#[from] KvError),

    /// The requested record or index does not exist (or has expired).
    #[error("not found")]
    NotFound,

    /// The presented refresh token did not match the stored one. The whole
    /// session has been revoked as a theft response.
    #[error("invalid refresh; session revoked")]
    RefreshMismatchRevoked,

    /// Encryption or decryption of a stored token failed.
    #[error("token cipher error: {0}")]
    Cipher(String),

    /// A stored index value could not be parsed back into (user, sid).
    #[error("corrupt index value")]
    CorruptIndex,

    /// Caller passed empty identifiers or tokens.
    #[error("userID, sessionID and tokens required")]
    MissingArguments,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(KvError::Unavailable(err))
    }
}
