//! Proxy backend configuration.
//!
//! Loaded from YAML/JSON/TOML (picked by file extension) with `WSGATE__`
//! environment overrides layered on top.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub code_server: CodeServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub redisinsight: RedisInsightConfig,
    #[serde(default)]
    pub user_info: UserInfoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub with_tls: bool,
    pub pem: String,
    pub key: String,
    pub log_level: String,
    /// Comma-separated CORS allow origins.
    pub cors_origins: String,
    /// Name of the session cookie.
    pub session_cookie: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            with_tls: false,
            pem: String::new(),
            key: String::new(),
            log_level: "info".to_string(),
            cors_origins: String::new(),
            session_cookie: "X-S".to_string(),
        }
    }
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
pub struct SecretsConfig {
    pub jwt_access_key: String,
    pub jwt_refresh_key: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub session_secret: String,
    /// Shared key agents must present, and the proxy forwards downstream.
    pub agent_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `ldap` (directory bridge) or `static` (config-provisioned users).
    pub backend: String,
    /// Comma-separated groups allowed on user routes.
    pub regular_roles: String,
    /// Comma-separated groups allowed on admin routes.
    pub admin_roles: String,
    /// Identity bridge endpoint for the ldap backend.
    pub ldap_bridge_url: String,
    pub ldap_bridge_api_key: String,
    /// Users for the static backend (bcrypt password hashes).
    pub static_users: Vec<StaticUser>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: "ldap".to_string(),
            regular_roles: String::new(),
            admin_roles: String::new(),
            ldap_bridge_url: String::new(),
            ldap_bridge_api_key: String::new(),
            static_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUser {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodeServerConfig {
    /// Session-store key prefix.
    pub session_prefix: String,
}

impl Default for CodeServerConfig {
    fn default() -> Self {
        Self {
            session_prefix: "session".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Instance lease, roughly three heartbeat intervals.
    pub ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisInsightConfig {
    pub enabled: bool,
    pub proto: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserInfoConfig {
    /// Identity sidecar resolving uid/gid for container env.
    pub url: String,
    pub api_key: String,
}

impl AppConfig {
    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery.ttl_secs)
    }

    /// Parse a comma-separated role list into trimmed entries.
    pub fn parse_roles(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn regular_roles(&self) -> Vec<String> {
        Self::parse_roles(&self.auth.regular_roles)
    }

    pub fn admin_roles(&self) -> Vec<String> {
        Self::parse_roles(&self.auth.admin_roles)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        Self::parse_roles(&self.server.cors_origins)
    }
}

/// Load configuration from the given file plus `WSGATE__` env overrides.
pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
    let built = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("WSGATE").separator("__"))
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?;
    let cfg: AppConfig = built
        .try_deserialize()
        .context("config did not match the expected schema")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roles_trims_and_drops_empties() {
        assert_eq!(
            AppConfig::parse_roles("bdadmins, bddataengineers ,,"),
            vec!["bdadmins", "bddataengineers"]
        );
        assert!(AppConfig::parse_roles("").is_empty());
    }

    #[test]
    fn minimal_yaml_loads_with_defaults() {
        let dir = std::env::temp_dir().join("wsgate-proxy-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            r#"
secrets:
  jwt_access_key: a
  jwt_refresh_key: r
  jwt_issuer: wsgate
  jwt_audience: wsgate-users
  session_secret: s
  agent_key: k
"#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.server.port, 8443);
        assert_eq!(cfg.server.session_cookie, "X-S");
        assert_eq!(cfg.redis.port, 6379);
        assert_eq!(cfg.discovery.ttl_secs, 30);
        assert_eq!(cfg.auth.backend, "ldap");
        assert_eq!(cfg.code_server.session_prefix, "session");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Path::new("/does/not/exist.yaml")).is_err());
    }
}
