//! HTTP client for agent APIs plus the least-loaded agent selector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinSet;

use wsgate::discovery::{DiscoveryError, DiscoveryRegistry, ServiceInstance};

/// Discovery service name agents register under.
pub const CONTAINER_SERVICE: &str = "container_service";

/// Score sentinel: any successful probe (cpu% + ram% ≤ 200) beats it.
const SELECTOR_SENTINEL: f64 = 201.0;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no agent available")]
    NoAgentAvailable,

    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMetrics {
    pub cpu_percent: f64,
    pub cpu_percent_str: String,
    pub ram_percent: f64,
    pub ram_percent_str: String,
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerExists {
    pub name: String,
    pub exist: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerId {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerRunning {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerCreated {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Warnings", default)]
    pub warnings: Vec<String>,
}

/// An agent picked by the selector.
#[derive(Debug, Clone)]
pub struct SelectedAgent {
    pub url: String,
    pub instance: ServiceInstance,
}

/// Client for agent HTTP APIs.
pub struct AgentClient {
    http: reqwest::Client,
    agent_key: String,
    discovery: Arc<DiscoveryRegistry>,
}

impl AgentClient {
    pub fn new(agent_key: &str, discovery: Arc<DiscoveryRegistry>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            agent_key: agent_key.to_string(),
            discovery,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AgentError> {
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .header("X-Agent-Key", &self.agent_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, AgentError> {
        let mut req = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header("X-Agent-Key", &self.agent_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        Self::decode(req.send().await?).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, AgentError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn is_container_exist(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerExists, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/containers/{name}/exist"))
            .await
    }

    pub async fn container_id_by_name(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerId, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/containers/{name}/id"))
            .await
    }

    pub async fn is_container_running(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerRunning, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/containers/{name}/running"))
            .await
    }

    async fn lifecycle(
        &self,
        agent_url: &str,
        name: &str,
        op: &str,
    ) -> Result<ContainerStatus, AgentError> {
        let id = self.container_id_by_name(agent_url, name).await?.id;
        self.post_json(&format!("{agent_url}/api/v1/containers/{id}/{op}"), None)
            .await
    }

    pub async fn start_container(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerStatus, AgentError> {
        self.lifecycle(agent_url, name, "start").await
    }

    pub async fn stop_container(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerStatus, AgentError> {
        self.lifecycle(agent_url, name, "stop").await
    }

    pub async fn restart_container(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerStatus, AgentError> {
        self.lifecycle(agent_url, name, "restart").await
    }

    pub async fn remove_container(
        &self,
        agent_url: &str,
        name: &str,
    ) -> Result<ContainerStatus, AgentError> {
        let id = self.container_id_by_name(agent_url, name).await?.id;
        let resp = self
            .http
            .delete(format!("{agent_url}/api/v1/containers/{id}"))
            .query(&[("force", "true")])
            .header("Accept", "application/json")
            .header("X-Agent-Key", &self.agent_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn container_defaults(
        &self,
        agent_url: &str,
    ) -> Result<serde_json::Value, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/containers/defaults"))
            .await
    }

    pub async fn create_container(
        &self,
        agent_url: &str,
        spec: &serde_json::Value,
    ) -> Result<ContainerCreated, AgentError> {
        info!("creating container on {agent_url}");
        self.post_json(&format!("{agent_url}/api/v1/containers"), Some(spec))
            .await
    }

    pub async fn fetch_metrics(&self, agent_url: &str) -> Result<AgentMetrics, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/metrics")).await
    }

    pub async fn agent_tags(
        &self,
        agent_url: &str,
    ) -> Result<HashMap<String, String>, AgentError> {
        self.get_json(&format!("{agent_url}/api/v1/tags")).await
    }

    /// All registered container-service agents.
    pub async fn all_agents(&self) -> Result<Vec<ServiceInstance>, AgentError> {
        Ok(self.discovery.discover(CONTAINER_SERVICE).await?)
    }

    /// Concurrent metrics fan-out over every registered agent; picks the
    /// one with the lowest `cpu% + ram%`. Probe failures are skipped; if
    /// every probe failed the selection fails.
    pub async fn select_best_agent(&self) -> Result<SelectedAgent, AgentError> {
        let instances = self.all_agents().await?;
        if instances.is_empty() {
            return Err(AgentError::NoAgentAvailable);
        }

        let mut probes = JoinSet::new();
        for instance in instances {
            let url = instance.main_url();
            let client = self.http.clone();
            let agent_key = self.agent_key.clone();
            probes.spawn(async move {
                let result = client
                    .get(format!("{url}/api/v1/metrics"))
                    .header("Accept", "application/json")
                    .header("X-Agent-Key", &agent_key)
                    .send()
                    .await;
                let metrics: Result<AgentMetrics, String> = match result {
                    Ok(resp) if resp.status().is_success() => {
                        resp.json().await.map_err(|e| e.to_string())
                    }
                    Ok(resp) => Err(format!("status {}", resp.status())),
                    Err(e) => Err(e.to_string()),
                };
                (url, instance, metrics)
            });
        }

        let mut best: Option<SelectedAgent> = None;
        let mut min_score = SELECTOR_SENTINEL;
        while let Some(joined) = probes.join_next().await {
            let Ok((url, instance, metrics)) = joined else {
                continue;
            };
            match metrics {
                Ok(m) => {
                    let score = m.cpu_percent + m.ram_percent;
                    if score < min_score {
                        min_score = score;
                        best = Some(SelectedAgent { url, instance });
                    }
                }
                Err(e) => error!("failed to fetch metrics for agent {url}: {e}"),
            }
        }

        best.ok_or(AgentError::NoAgentAvailable)
    }
}

/// Minimum-score pick over `(url, score)` pairs, sentinel included.
/// Factored out of the selector so the decision rule itself is testable.
pub fn pick_min_score(scored: &[(String, f64)]) -> Option<&str> {
    let mut best = None;
    let mut min = SELECTOR_SENTINEL;
    for (url, score) in scored {
        if *score < min {
            min = *score;
            best = Some(url.as_str());
        }
    }
    best
}
