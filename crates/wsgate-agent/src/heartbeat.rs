//! Discovery client: registration and the heartbeat loop.
//!
//! The agent registers with the proxy backend until it succeeds, then
//! renews its lease every interval. A failed or non-2xx heartbeat triggers
//! a best-effort re-registration; there is no extra backoff beyond the
//! interval itself.

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;

/// Interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Delay between registration retries at startup.
const REGISTER_RETRY: Duration = Duration::from_secs(15);

/// Discovery client bound to this agent's metadata.
pub struct DiscoveryClient {
    http: reqwest::Client,
    server_url: String,
    agent_key: String,
    register_body: serde_json::Value,
    instance_id: String,
    service_name: String,
}

impl DiscoveryClient {
    pub fn new(cfg: &AgentConfig) -> Result<Self> {
        let meta = &cfg.agent_metadata;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()?;
        let register_body = json!({
            "instanceID": meta.instance_id,
            "serviceName": meta.service_name,
            "mainHost": meta.main_host,
            "mainHostProto": meta.main_host_proto,
            "hostPort": meta.host_port,
            "hostPortProto": meta.host_port_proto,
            "version": meta.version,
            "region": meta.region,
            "tags": meta.tags,
        });
        Ok(Self {
            http,
            server_url: meta.server_url.trim_end_matches('/').to_string(),
            agent_key: meta.x_agent_key.clone(),
            register_body,
            instance_id: meta.instance_id.clone(),
            service_name: meta.service_name.clone(),
        })
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}{endpoint}", self.server_url))
            .header("Accept", "application/json")
            .header("X-Agent-Key", &self.agent_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed with status {status}: {body}"));
        }
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        info!("registering agent {}..", self.instance_id);
        self.post("/discovery/register", &self.register_body).await
    }

    pub async fn deregister(&self) -> Result<()> {
        self.post(
            "/discovery/deregister",
            &json!({
                "instanceID": self.instance_id,
                "serviceName": self.service_name,
            }),
        )
        .await
    }

    pub async fn healthcheck(&self) -> Result<()> {
        self.post(
            "/discovery/healthcheck",
            &json!({
                "instanceID": self.instance_id,
                "serviceName": self.service_name,
            }),
        )
        .await
    }

    /// Register until it succeeds, then heartbeat until shutdown. On
    /// shutdown the instance is deregistered best-effort.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            match self.register().await {
                Ok(()) => {
                    info!("registered {}:{}", self.service_name, self.instance_id);
                    break;
                }
                Err(e) => {
                    warn!("register failed, will retry: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(REGISTER_RETRY) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }

        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.healthcheck().await {
                        Ok(()) => info!("healthcheck success: {}", self.instance_id),
                        Err(e) => {
                            warn!("healthcheck failed, re-registering: {e}");
                            if let Err(re) = self.register().await {
                                warn!("re-register failed: {re}");
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.deregister().await {
                        warn!("deregister on shutdown failed: {e}");
                    }
                    return;
                }
            }
        }
    }
}
