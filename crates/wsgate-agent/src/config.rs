//! Agent configuration.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub container_template: ContainerTemplate,
    pub agent_metadata: AgentMetadata,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub code_server: CodeServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub with_tls: bool,
    pub pem: String,
    pub key: String,
    /// Root of the proc filesystem; overridable for containerized agents.
    pub proc_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            log_level: "info".to_string(),
            with_tls: false,
            pem: String::new(),
            key: String::new(),
            proc_path: "/proc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerTemplate {
    pub image_name: String,
    pub container_name: String,
    pub restart: String,
    pub environment: HashMap<String, String>,
    pub sysctls: HashMap<String, String>,
    pub expose: Vec<u16>,
    pub mem_limit: String,
    pub cpus: i64,
    pub extra_host: Vec<String>,
    pub volumes: Vec<String>,
    pub network: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMetadata {
    pub instance_id: String,
    pub service_name: String,
    #[serde(default = "default_proto")]
    pub main_host_proto: String,
    pub main_host: String,
    #[serde(default = "default_proto")]
    pub host_port_proto: String,
    #[serde(default)]
    pub host_port: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Proxy-backend base URL the agent registers against.
    pub server_url: String,
    pub x_agent_key: String,
}

fn default_proto() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    pub jwt_access_key: String,
    pub jwt_refresh_key: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub session_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodeServerConfig {
    /// Container host base; per-user hosts are `{base}-{username}`.
    pub base_host: String,
    pub base_port: u16,
    pub with_username: bool,
    pub session_prefix: String,
}

impl Default for CodeServerConfig {
    fn default() -> Self {
        Self {
            base_host: "code-server".to_string(),
            base_port: 8443,
            with_username: true,
            session_prefix: "session".to_string(),
        }
    }
}

/// Load configuration from the given file plus `WSGATE_AGENT__` env
/// overrides.
pub fn load(path: &Path) -> anyhow::Result<AgentConfig> {
    let built = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("WSGATE_AGENT").separator("__"))
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?;
    let cfg: AgentConfig = built
        .try_deserialize()
        .context("config did not match the expected schema")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_loads_with_defaults() {
        let dir = std::env::temp_dir().join("wsgate-agent-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            r#"
agent_metadata:
  instance_id: agent-1
  service_name: container_service
  main_host: agent-1:9000
  server_url: https://gateway.internal
  x_agent_key: k
secrets:
  jwt_access_key: a
  jwt_refresh_key: r
  jwt_issuer: wsgate
  jwt_audience: wsgate-users
  session_secret: s
"#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.proc_path, "/proc");
        assert_eq!(cfg.agent_metadata.main_host_proto, "http");
        assert_eq!(cfg.code_server.base_host, "code-server");
        assert_eq!(cfg.code_server.base_port, 8443);
        assert!(cfg.code_server.with_username);
    }
}
