//! Directory collaborators for credential verification.
//!
//! The gateway does not implement a directory service. Production deploys
//! run an identity bridge in front of LDAP; development and tests use a
//! static user list with bcrypt hashes.

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{AppConfig, StaticUser};

/// Identity returned by a successful credential check.
#[derive(Debug, Clone)]
pub struct DirectoryUser {
    pub username: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Credential verification seam.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<DirectoryUser, DirectoryError>;
}

/// Directory backed by the deployment's identity bridge (LDAP behind HTTP).
pub struct HttpDirectory {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    username: String,
    #[serde(default)]
    groups: Vec<String>,
}

impl HttpDirectory {
    pub fn new(url: &str, api_key: &str) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<DirectoryUser, DirectoryError> {
        let resp = self
            .http
            .post(format!("{}/authenticate", self.url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {
                let body: BridgeResponse = resp
                    .json()
                    .await
                    .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
                Ok(DirectoryUser {
                    username: body.username,
                    groups: body.groups,
                })
            }
            s if s.as_u16() == 401 || s.as_u16() == 403 => {
                Err(DirectoryError::InvalidCredentials)
            }
            s => {
                warn!("directory bridge returned {s}");
                Err(DirectoryError::Unavailable(format!("bridge status {s}")))
            }
        }
    }
}

/// Directory backed by config-provisioned users.
pub struct StaticDirectory {
    users: Vec<StaticUser>,
}

impl StaticDirectory {
    pub fn new(users: Vec<StaticUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<DirectoryUser, DirectoryError> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or(DirectoryError::InvalidCredentials)?;
        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if !ok {
            return Err(DirectoryError::InvalidCredentials);
        }
        Ok(DirectoryUser {
            username: user.username.clone(),
            groups: user.groups.clone(),
        })
    }
}

/// Build the configured directory backend. Only `ldap` and `static` exist.
pub fn build(cfg: &AppConfig) -> anyhow::Result<Box<dyn Directory>> {
    match cfg.auth.backend.to_lowercase().as_str() {
        "ldap" => {
            if cfg.auth.ldap_bridge_url.is_empty() {
                anyhow::bail!("auth.backend=ldap requires auth.ldap_bridge_url");
            }
            Ok(Box::new(HttpDirectory::new(
                &cfg.auth.ldap_bridge_url,
                &cfg.auth.ldap_bridge_api_key,
            )?))
        }
        "static" => Ok(Box::new(StaticDirectory::new(cfg.auth.static_users.clone()))),
        other => anyhow::bail!("unsupported auth backend: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_dir() -> StaticDirectory {
        let hash = bcrypt::hash("p", 4).unwrap();
        StaticDirectory::new(vec![StaticUser {
            username: "alice".into(),
            password_hash: hash,
            groups: vec!["bdadmins".into()],
        }])
    }

    #[tokio::test]
    async fn static_directory_accepts_good_credentials() {
        let dir = static_dir();
        let user = dir.authenticate("alice", "p").await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.groups, vec!["bdadmins"]);
    }

    #[tokio::test]
    async fn static_directory_rejects_bad_credentials() {
        let dir = static_dir();
        assert!(matches!(
            dir.authenticate("alice", "wrong").await,
            Err(DirectoryError::InvalidCredentials)
        ));
        assert!(matches!(
            dir.authenticate("nobody", "p").await,
            Err(DirectoryError::InvalidCredentials)
        ));
    }
}
