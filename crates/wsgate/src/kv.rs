//! Thin wrapper around the shared Redis key-value store.
//!
//! Every store operation in the gateway goes through a multiplexed
//! connection obtained here and is bounded by [`KV_OP_TIMEOUT`]. Key
//! schemas are owned by the callers; this module only provides the
//! connection plumbing, pattern scans and pub/sub publishing.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;

/// Upper bound for any single KV operation.
pub const KV_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by the KV layer.
#[derive(Debug, Error)]
pub enum KvError {
    /// The store did not answer within [`KV_OP_TIMEOUT`].
    #[error("kv store timed out after {0:?}")]
    Timeout(Duration),

    /// The store is unreachable or returned a protocol error.
    #[error("kv store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

/// Handle to the shared key-value store.
#[derive(Clone)]
pub struct KvStore {
    client: redis::Client,
}

impl KvStore {
    /// Build a client for the given Redis endpoint. No connection is
    /// established until the first operation.
    pub fn open(host: &str, port: u16, password: &str, db: i64) -> Result<Self, KvError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password: if password.is_empty() {
                    None
                } else {
                    Some(password.to_string())
                },
                protocol: redis::ProtocolVersion::RESP2,
            },
        };
        let client = redis::Client::open(info)?;
        Ok(Self { client })
    }

    /// Wrap an existing client (used by tests).
    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }

    /// Obtain a multiplexed connection, bounded by the op timeout.
    pub async fn conn(&self) -> Result<MultiplexedConnection, KvError> {
        timed(self.client.get_multiplexed_async_connection()).await
    }

    /// Validate connectivity. Called once at startup; the server refuses to
    /// boot against an unreachable store.
    pub async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        timed(redis::cmd("PING").query_async::<()>(&mut conn)).await
    }

    /// Collect all keys matching `pattern` using cursor-based SCAN so large
    /// keyspaces never block the store.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = timed(
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// MGET the given keys; absent keys come back as `None`.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        timed(conn.mget::<_, Vec<Option<String>>>(keys)).await
    }

    /// Publish a payload on a pub/sub channel. Best effort for event fans.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        timed(conn.publish::<_, _, ()>(channel, payload)).await
    }
}

/// Bound a Redis future by the shared op timeout.
pub async fn timed<T>(
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, KvError> {
    match tokio::time::timeout(KV_OP_TIMEOUT, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(KvError::Timeout(KV_OP_TIMEOUT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_does_not_connect() {
        // Construction must stay lazy so binaries can build state before
        // the store is reachable.
        let kv = KvStore::open("127.0.0.1", 1, "", 0);
        assert!(kv.is_ok());
    }

    #[test]
    fn open_with_password_and_db() {
        assert!(KvStore::open("redis.internal", 6379, "hunter2", 3).is_ok());
    }
}
