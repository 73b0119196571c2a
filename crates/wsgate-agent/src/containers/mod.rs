//! Workspace container management over the docker/podman CLI.
//!
//! The runtime is auto-detected or configured explicitly. Creation merges
//! the configured template with the request: the request wins field by
//! field, env keys are uppercased and deduplicated, list fields are
//! deduplicated in order.

mod error;

pub use error::{ContainerError, ContainerResult};

use std::collections::HashMap;
use std::process::Stdio;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::ContainerTemplate;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

/// Container creation request, as posted by the proxy backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateContainerRequest {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(rename = "cpuQuota", default)]
    pub cpu_quota: i64,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub sysctls: HashMap<String, String>,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub restart: String,
    #[serde(rename = "extraHosts", alias = "extra_hosts", default)]
    pub extra_hosts: Vec<String>,
}

/// Template defaults exposed to the proxy's creation form.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDefaults {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    pub network: String,
    pub volumes: Vec<String>,
    pub expose: Vec<String>,
    pub ports: Vec<String>,
    #[serde(rename = "cpuQuota")]
    pub cpu_quota: i64,
    pub memory: String,
    pub sysctls: HashMap<String, String>,
    pub restart: String,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

/// Validate a container name or id before it reaches the CLI.
pub fn validate_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ContainerError::InvalidInput(format!(
            "container name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Uppercase env keys and keep the last value per key, preserving first
/// insertion order.
pub fn normalize_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = env.keys().map(|k| k.to_uppercase()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .map(|key| {
            let value = env
                .iter()
                .find(|(k, _)| k.to_uppercase() == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect()
}

fn dedup_in_order(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .filter(|v| !v.is_empty() && seen.insert(v.as_str()))
        .cloned()
        .collect()
}

/// Merge the configured template with the request; request fields win.
pub fn merge_with_template(
    template: &ContainerTemplate,
    req: &CreateContainerRequest,
) -> CreateContainerRequest {
    let mut env: HashMap<String, String> = template.environment.clone();
    env.extend(req.env.clone());

    let mut sysctls = template.sysctls.clone();
    sysctls.extend(req.sysctls.clone());

    let pick = |req_val: &str, tpl_val: &str| {
        if req_val.is_empty() {
            tpl_val.to_string()
        } else {
            req_val.to_string()
        }
    };

    let mut volumes = template.volumes.clone();
    volumes.extend(req.volumes.clone());
    let mut expose: Vec<String> = template.expose.iter().map(|p| p.to_string()).collect();
    expose.extend(req.expose.clone());
    let mut ports = template.ports.clone();
    ports.extend(req.ports.clone());
    let mut extra_hosts = template.extra_host.clone();
    extra_hosts.extend(req.extra_hosts.clone());

    CreateContainerRequest {
        image: pick(&req.image, &template.image_name),
        name: pick(&req.name, &template.container_name),
        env,
        volumes: dedup_in_order(&volumes),
        expose: dedup_in_order(&expose),
        ports: dedup_in_order(&ports),
        cpu_quota: if req.cpu_quota != 0 {
            req.cpu_quota
        } else {
            template.cpus * 1_000_000_000
        },
        memory: pick(&req.memory, &template.mem_limit),
        sysctls,
        network: pick(&req.network, &template.network),
        restart: pick(&req.restart, &template.restart),
        extra_hosts: dedup_in_order(&extra_hosts),
    }
}

/// Build the `create` argument list for a merged request.
pub fn build_create_args(req: &CreateContainerRequest) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), req.name.clone()];
    if !req.memory.is_empty() {
        args.push(format!("--memory={}", req.memory));
    }
    if req.cpu_quota > 0 {
        args.push(format!(
            "--cpus={}",
            req.cpu_quota as f64 / 1_000_000_000f64
        ));
    }
    if !req.restart.is_empty() {
        args.push(format!("--restart={}", req.restart));
    }
    if !req.network.is_empty() {
        args.push(format!("--network={}", req.network));
    }
    for volume in &req.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    for port in &req.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    for port in &req.expose {
        args.push(format!("--expose={port}"));
    }
    for env in normalize_env(&req.env) {
        args.push("-e".to_string());
        args.push(env);
    }
    let mut sysctl_keys: Vec<_> = req.sysctls.keys().collect();
    sysctl_keys.sort();
    for key in sysctl_keys {
        args.push(format!("--sysctl={key}={}", req.sysctls[key]));
    }
    for host in &req.extra_hosts {
        args.push(format!("--add-host={host}"));
    }
    args.push(req.image.clone());
    args
}

/// Container runtime driven through the docker/podman CLI.
pub struct ContainerRuntime {
    runtime: RuntimeType,
    template: ContainerTemplate,
}

impl ContainerRuntime {
    pub fn new(runtime: RuntimeType, template: ContainerTemplate) -> Self {
        Self { runtime, template }
    }

    async fn run(&self, args: &[String]) -> ContainerResult<String> {
        debug!("{} {}", self.runtime.binary(), args.join(" "));
        let output = Command::new(self.runtime.binary())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ContainerError::CommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Template defaults for the creation form.
    pub fn defaults(&self) -> ConfigDefaults {
        let t = &self.template;
        ConfigDefaults {
            image: t.image_name.clone(),
            name: t.container_name.clone(),
            env: t.environment.clone(),
            network: t.network.clone(),
            volumes: t.volumes.clone(),
            expose: t.expose.iter().map(|p| p.to_string()).collect(),
            ports: t.ports.clone(),
            cpu_quota: t.cpus * 1_000_000_000,
            memory: t.mem_limit.clone(),
            sysctls: t.sysctls.clone(),
            restart: t.restart.clone(),
            extra_hosts: t.extra_host.clone(),
        }
    }

    /// Create a container from the template-merged request.
    pub async fn create(&self, req: &CreateContainerRequest) -> ContainerResult<String> {
        let merged = merge_with_template(&self.template, req);
        validate_name(&merged.name)?;
        if merged.image.is_empty() {
            return Err(ContainerError::InvalidInput("image is required".to_string()));
        }
        let id = self.run(&build_create_args(&merged)).await?;
        info!("created container {} ({id})", merged.name);
        Ok(id)
    }

    pub async fn start(&self, id: &str) -> ContainerResult<()> {
        validate_name(id)?;
        self.run(&["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> ContainerResult<()> {
        validate_name(id)?;
        self.run(&["stop".to_string(), id.to_string()]).await?;
        Ok(())
    }

    pub async fn restart(&self, id: &str) -> ContainerResult<()> {
        validate_name(id)?;
        self.run(&["restart".to_string(), id.to_string()]).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str, force: bool) -> ContainerResult<()> {
        validate_name(id)?;
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id.to_string());
        self.run(&args).await?;
        Ok(())
    }

    /// Id of the container with exactly this name, if any.
    pub async fn id_by_name(&self, name: &str) -> ContainerResult<Option<String>> {
        validate_name(name)?;
        let out = self
            .run(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name=^{name}$"),
                "--format".to_string(),
                "{{.ID}}".to_string(),
            ])
            .await?;
        Ok(out.lines().next().map(str::to_string).filter(|s| !s.is_empty()))
    }

    pub async fn exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.id_by_name(name).await?.is_some())
    }

    pub async fn running(&self, name: &str) -> ContainerResult<bool> {
        validate_name(name)?;
        let out = self
            .run(&[
                "ps".to_string(),
                "--filter".to_string(),
                format!("name=^{name}$"),
                "--filter".to_string(),
                "status=running".to_string(),
                "--format".to_string(),
                "{{.ID}}".to_string(),
            ])
            .await?;
        Ok(!out.is_empty())
    }

    async fn list_filtered(&self, name_filter: Option<&str>) -> ContainerResult<Vec<ContainerSummary>> {
        let mut args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Status}}".to_string(),
        ];
        if let Some(filter) = name_filter {
            args.push("--filter".to_string());
            args.push(format!("name={filter}"));
        }
        let out = self.run(&args).await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                Some(ContainerSummary {
                    id: fields.next()?.to_string(),
                    name: fields.next()?.to_string(),
                    image: fields.next()?.to_string(),
                    state: fields.next().unwrap_or_default().to_string(),
                    status: fields.next().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    pub async fn list(&self) -> ContainerResult<Vec<ContainerSummary>> {
        self.list_filtered(None).await
    }

    /// Workspace containers only, by the template's name base.
    pub async fn list_workspaces(&self, base: &str) -> ContainerResult<Vec<ContainerSummary>> {
        self.list_filtered(Some(base)).await
    }

    pub async fn logs(&self, id: &str, tail: u32) -> ContainerResult<String> {
        validate_name(id)?;
        self.run(&[
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            id.to_string(),
        ])
        .await
    }

    /// One-shot resource usage snapshot.
    pub async fn stats(&self, id: &str) -> ContainerResult<serde_json::Value> {
        validate_name(id)?;
        let out = self
            .run(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "json".to_string(),
                id.to_string(),
            ])
            .await?;
        serde_json::from_str(&out).map_err(|e| ContainerError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ContainerTemplate {
        ContainerTemplate {
            image_name: "code-server:4.19".to_string(),
            container_name: "code-server".to_string(),
            restart: "unless-stopped".to_string(),
            environment: HashMap::from([("tz".to_string(), "UTC".to_string())]),
            sysctls: HashMap::new(),
            expose: vec![8443],
            mem_limit: "4g".to_string(),
            cpus: 2,
            extra_host: vec![],
            volumes: vec!["/nfs/home:/config".to_string()],
            network: "workspaces".to_string(),
            ports: vec![],
        }
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("code-server-alice").is_ok());
        assert!(validate_name("a_b.c-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("bad;rm -rf").is_err());
        assert!(validate_name(&"x".repeat(200)).is_err());
    }

    #[test]
    fn env_is_uppercased_and_deduplicated() {
        let env = HashMap::from([
            ("puid".to_string(), "1000".to_string()),
            ("TZ".to_string(), "UTC".to_string()),
        ]);
        let normalized = normalize_env(&env);
        assert!(normalized.contains(&"PUID=1000".to_string()));
        assert!(normalized.contains(&"TZ=UTC".to_string()));
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn merge_request_wins_over_template() {
        let req = CreateContainerRequest {
            image: "custom:latest".to_string(),
            name: "code-server-alice".to_string(),
            memory: String::new(),
            ..Default::default()
        };
        let merged = merge_with_template(&template(), &req);
        assert_eq!(merged.image, "custom:latest");
        assert_eq!(merged.name, "code-server-alice");
        // Template fills the blanks.
        assert_eq!(merged.memory, "4g");
        assert_eq!(merged.network, "workspaces");
        assert_eq!(merged.cpu_quota, 2_000_000_000);
        assert_eq!(merged.volumes, vec!["/nfs/home:/config"]);
        assert_eq!(merged.expose, vec!["8443"]);
    }

    #[test]
    fn merge_combines_env_with_request_priority() {
        let req = CreateContainerRequest {
            env: HashMap::from([("tz".to_string(), "Europe/Istanbul".to_string())]),
            ..Default::default()
        };
        let merged = merge_with_template(&template(), &req);
        assert_eq!(merged.env.get("tz").unwrap(), "Europe/Istanbul");
    }

    #[test]
    fn create_args_shape() {
        let req = merge_with_template(
            &template(),
            &CreateContainerRequest {
                name: "code-server-alice".to_string(),
                env: HashMap::from([("PUID".to_string(), "1000".to_string())]),
                ports: vec!["8443:8443".to_string()],
                ..Default::default()
            },
        );
        let args = build_create_args(&req);
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--name".to_string()));
        assert!(args.contains(&"code-server-alice".to_string()));
        assert!(args.contains(&"--memory=4g".to_string()));
        assert!(args.contains(&"--cpus=2".to_string()));
        assert!(args.contains(&"--restart=unless-stopped".to_string()));
        assert!(args.contains(&"--network=workspaces".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"8443:8443".to_string()));
        // Image is the last argument.
        assert_eq!(args.last().unwrap(), "code-server:4.19");
    }

    #[test]
    fn dedup_preserves_order() {
        let items = vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            String::new(),
        ];
        assert_eq!(dedup_in_order(&items), vec!["a", "b"]);
    }
}
