//! Test utilities and common setup.

use std::collections::HashMap;

use axum::Router;
use wsgate::session::store::derive_key;
use wsgate::{KvStore, SessionStore, TokenService};
use wsgate_agent::config::{
    AgentConfig, AgentMetadata, CodeServerConfig, ContainerTemplate, RedisConfig, SecretsConfig,
    ServerConfig,
};
use wsgate_agent::containers::{ContainerRuntime, RuntimeType};
use wsgate_agent::routes::create_router;
use wsgate_agent::state::AppState;

pub const TEST_AGENT_KEY: &str = "test-agent-key";

/// Agent config pointing proc reads at a temp directory with fixed
/// stat/meminfo fixtures.
pub fn test_config() -> AgentConfig {
    let proc_dir = std::env::temp_dir().join("wsgate-agent-test-proc");
    std::fs::create_dir_all(&proc_dir).unwrap();
    std::fs::write(
        proc_dir.join("stat"),
        "cpu  100 0 100 700 50 0 50 0 0 0\n",
    )
    .unwrap();
    std::fs::write(
        proc_dir.join("meminfo"),
        "MemTotal:       16384000 kB\nMemAvailable:   12288000 kB\n",
    )
    .unwrap();

    AgentConfig {
        server: ServerConfig {
            proc_path: proc_dir.to_str().unwrap().to_string(),
            ..Default::default()
        },
        container_template: ContainerTemplate::default(),
        agent_metadata: AgentMetadata {
            instance_id: "agent-test".to_string(),
            service_name: "container_service".to_string(),
            main_host_proto: "http".to_string(),
            main_host: "localhost:9000".to_string(),
            host_port_proto: "http".to_string(),
            host_port: "9000".to_string(),
            version: "0.0.0-test".to_string(),
            region: "test".to_string(),
            tags: HashMap::from([("rack".to_string(), "t1".to_string())]),
            server_url: "http://localhost:1".to_string(),
            x_agent_key: TEST_AGENT_KEY.to_string(),
        },
        secrets: SecretsConfig {
            jwt_access_key: "test-access".to_string(),
            jwt_refresh_key: "test-refresh".to_string(),
            jwt_issuer: "wsgate".to_string(),
            jwt_audience: "wsgate-users".to_string(),
            session_secret: "test-session-secret".to_string(),
        },
        redis: RedisConfig::default(),
        code_server: CodeServerConfig::default(),
    }
}

/// Build a test agent app. The KV client is lazy, so routes that never
/// touch the store work without a live Redis.
pub fn test_app() -> Router {
    let cfg = test_config();
    let kv = KvStore::open("127.0.0.1", 1, "", 0).unwrap();
    let store = SessionStore::new(kv, "session", derive_key("test-session-secret"));
    let tokens = TokenService::new("test-access", "test-refresh", "wsgate", "wsgate-users");
    let runtime = ContainerRuntime::new(RuntimeType::Docker, cfg.container_template.clone());
    let state = AppState::new(cfg, runtime, store, tokens);
    create_router(state)
}
