//! Service discovery over TTL-keyed store entries.
//!
//! Agents register under `service:{name}:{id}` with a TTL of three
//! heartbeat intervals and keep the lease alive by renewing it. Discovery
//! is a pattern scan; registration and deregistration publish events on the
//! `service-events` pub/sub channel for anyone watching topology changes.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{timed, KvError, KvStore};

/// Channel carrying register/deregister events.
pub const EVENTS_CHANNEL: &str = "service-events";

/// A registered service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    #[serde(rename = "mainHost")]
    pub main_host: String,
    #[serde(rename = "mainHostProto")]
    pub main_host_proto: String,
    #[serde(rename = "hostPort")]
    pub host_port: String,
    #[serde(rename = "hostPortProto")]
    pub host_port_proto: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl ServiceInstance {
    /// Base URL of the instance's main API, defaulting the protocol to
    /// plain http when unset.
    pub fn main_url(&self) -> String {
        let proto = if self.main_host_proto.is_empty() {
            "http"
        } else {
            &self.main_host_proto
        };
        format!("{proto}://{}", self.main_host)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Registration attempted while the instance key still exists.
    #[error("service instance already registered: {service}:{instance}")]
    AlreadyRegistered { service: String, instance: String },

    /// No such instance key.
    #[error("service not found")]
    NotFound,

    /// The instance lease has already expired.
    #[error("service instance not registered or expired")]
    Expired,

    #[error("discovery store error: {0}")]
    Store(#[from] KvError),

    #[error("corrupt instance record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for DiscoveryError {
    fn from(err: redis::RedisError) -> Self {
        DiscoveryError::Store(KvError::Unavailable(err))
    }
}

/// TTL-keyed instance registry.
#[derive(Clone)]
pub struct DiscoveryRegistry {
    kv: KvStore,
    ttl: Duration,
}

fn instance_key(service: &str, instance: &str) -> String {
    format!("service:{service}:{instance}")
}

impl DiscoveryRegistry {
    pub fn new(kv: KvStore, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    async fn publish_event(&self, event: &str, service: &str, instance: &str) {
        let payload = serde_json::json!({
            "type": event,
            "service": service,
            "instanceID": instance,
        });
        if let Err(e) = self.kv.publish(EVENTS_CHANNEL, &payload.to_string()).await {
            warn!("failed to publish {event} event for {service}:{instance}: {e}");
        }
    }

    /// Register an instance. The registering connection's real IP is merged
    /// into the instance tags server-side.
    pub async fn register(
        &self,
        instance_id: &str,
        service_name: &str,
        mut instance: ServiceInstance,
        real_ip: &str,
    ) -> Result<(), DiscoveryError> {
        let key = instance_key(service_name, instance_id);
        let mut conn = self.kv.conn().await?;
        let exists: i64 = timed(redis::cmd("EXISTS").arg(&key).query_async(&mut conn)).await?;
        if exists > 0 {
            return Err(DiscoveryError::AlreadyRegistered {
                service: service_name.to_string(),
                instance: instance_id.to_string(),
            });
        }

        instance
            .tags
            .insert("real_ip".to_string(), real_ip.to_string());
        let data =
            serde_json::to_string(&instance).map_err(|e| DiscoveryError::Corrupt(e.to_string()))?;
        timed(
            redis::cmd("SET")
                .arg(&key)
                .arg(data)
                .arg("EX")
                .arg(self.ttl.as_secs())
                .query_async::<()>(&mut conn),
        )
        .await?;
        info!("registered service instance {service_name}:{instance_id}");
        self.publish_event("register", service_name, instance_id).await;
        Ok(())
    }

    /// Drop an instance key.
    pub async fn deregister(
        &self,
        instance_id: &str,
        service_name: &str,
    ) -> Result<(), DiscoveryError> {
        let key = instance_key(service_name, instance_id);
        let mut conn = self.kv.conn().await?;
        let removed: i64 = timed(redis::cmd("DEL").arg(&key).query_async(&mut conn)).await?;
        if removed == 0 {
            return Err(DiscoveryError::NotFound);
        }
        self.publish_event("deregister", service_name, instance_id)
            .await;
        Ok(())
    }

    /// Renew the instance lease. A negative TTL means the lease is gone and
    /// the agent must re-register.
    pub async fn heartbeat(
        &self,
        instance_id: &str,
        service_name: &str,
    ) -> Result<(), DiscoveryError> {
        let key = instance_key(service_name, instance_id);
        let mut conn = self.kv.conn().await?;
        let ttl: i64 = timed(redis::cmd("TTL").arg(&key).query_async(&mut conn)).await?;
        if ttl < 0 {
            warn!("service instance not registered or expired: {instance_id}");
            return Err(DiscoveryError::Expired);
        }
        timed(
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.ttl.as_secs())
                .query_async::<()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    /// All live instances of a service. An empty list is a valid answer.
    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let keys = self.kv.scan_keys(&instance_key(service_name, "*")).await?;
        let vals = self.kv.mget(&keys).await?;
        let mut out = Vec::with_capacity(vals.len());
        for (key, val) in keys.iter().zip(vals) {
            let Some(raw) = val else { continue };
            match serde_json::from_str::<ServiceInstance>(&raw) {
                Ok(inst) => out.push(inst),
                Err(e) => warn!("skipping corrupt instance record at {key}: {e}"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_key_schema() {
        assert_eq!(
            instance_key("container_service", "agent-1"),
            "service:container_service:agent-1"
        );
    }

    #[test]
    fn instance_json_uses_wire_names() {
        let inst = ServiceInstance {
            main_host: "agent-1:9000".into(),
            main_host_proto: "http".into(),
            host_port: "9000".into(),
            host_port_proto: "http".into(),
            version: "1.4.0".into(),
            region: "eu-1".into(),
            tags: HashMap::from([("real_ip".into(), "10.0.0.9".into())]),
        };
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["mainHost"], "agent-1:9000");
        assert_eq!(json["hostPortProto"], "http");
        assert_eq!(json["tags"]["real_ip"], "10.0.0.9");

        let back: ServiceInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn optional_fields_can_be_absent() {
        let raw = r#"{"mainHost":"h","mainHostProto":"http","hostPort":"1","hostPortProto":"http"}"#;
        let inst: ServiceInstance = serde_json::from_str(raw).unwrap();
        assert!(inst.version.is_empty());
        assert!(inst.tags.is_empty());
    }

    #[test]
    fn main_url_defaults_proto() {
        let mut inst = ServiceInstance {
            main_host: "agent-1:9000".into(),
            ..Default::default()
        };
        assert_eq!(inst.main_url(), "http://agent-1:9000");
        inst.main_host_proto = "https".into();
        assert_eq!(inst.main_url(), "https://agent-1:9000");
    }
}
