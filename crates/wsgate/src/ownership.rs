//! Container ownership records: which agent hosts a user's workspace.
//!
//! Stored under `container:{user}` with no TTL; records only go away when a
//! workspace is deleted. The uniqueness invariant (one record per user) is
//! enforced by the creation flow checking for an existing record first.

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{timed, KvError, KvStore};

/// One user's workspace placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerOwnership {
    pub user: String,
    pub container_name: String,
    pub agent_host: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("container not found")]
    NotFound,

    #[error("ownership store error: {0}")]
    Store(#[from] KvError),

    #[error("corrupt ownership record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for OwnershipError {
    fn from(err: redis::RedisError) -> Self {
        OwnershipError::Store(KvError::Unavailable(err))
    }
}

fn ownership_key(user: &str) -> String {
    format!("container:{user}")
}

/// Registry of user → agent ownership records.
#[derive(Clone)]
pub struct OwnershipRegistry {
    kv: KvStore,
}

impl OwnershipRegistry {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Record a placement. `created_at` defaults to now (RFC 3339).
    pub async fn add(&self, mut info: ContainerOwnership) -> Result<(), OwnershipError> {
        if info.created_at.is_empty() {
            info.created_at = Utc::now().to_rfc3339();
        }
        let data =
            serde_json::to_string(&info).map_err(|e| OwnershipError::Corrupt(e.to_string()))?;
        let mut conn = self.kv.conn().await?;
        timed(
            redis::cmd("SET")
                .arg(ownership_key(&info.user))
                .arg(data)
                .query_async::<()>(&mut conn),
        )
        .await?;
        info!(
            "saved container ownership {} -> {} for {}",
            info.container_name, info.agent_host, info.user
        );
        Ok(())
    }

    pub async fn get(&self, user: &str) -> Result<ContainerOwnership, OwnershipError> {
        let mut conn = self.kv.conn().await?;
        let val: Option<String> = timed(
            redis::cmd("GET")
                .arg(ownership_key(user))
                .query_async(&mut conn),
        )
        .await?;
        let raw = val.ok_or(OwnershipError::NotFound)?;
        serde_json::from_str(&raw).map_err(|e| OwnershipError::Corrupt(e.to_string()))
    }

    pub async fn remove(&self, user: &str) -> Result<(), OwnershipError> {
        let mut conn = self.kv.conn().await?;
        let removed: i64 = timed(
            redis::cmd("DEL")
                .arg(ownership_key(user))
                .query_async(&mut conn),
        )
        .await?;
        if removed == 0 {
            return Err(OwnershipError::NotFound);
        }
        info!("removed container ownership for {user}");
        Ok(())
    }

    /// Every placement record in the store.
    pub async fn get_all(&self) -> Result<Vec<ContainerOwnership>, OwnershipError> {
        let keys = self.kv.scan_keys("container:*").await?;
        let vals = self.kv.mget(&keys).await?;
        let mut out = Vec::with_capacity(vals.len());
        for val in vals.into_iter().flatten() {
            if let Ok(info) = serde_json::from_str::<ContainerOwnership>(&val) {
                out.push(info);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schema() {
        assert_eq!(ownership_key("alice"), "container:alice");
    }

    #[test]
    fn record_roundtrip() {
        let info = ContainerOwnership {
            user: "alice".into(),
            container_name: "code-server-alice".into(),
            agent_host: "http://agent-1:9000".into(),
            created_at: "2026-07-01T12:00:00Z".into(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"container_name\""));
        let back: ContainerOwnership = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn created_at_may_be_absent() {
        let raw = r#"{"user":"bob","container_name":"c","agent_host":"h"}"#;
        let info: ContainerOwnership = serde_json::from_str(raw).unwrap();
        assert!(info.created_at.is_empty());
    }
}
