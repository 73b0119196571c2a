//! Test utilities and common setup.

use std::sync::Arc;

use axum::Router;
use wsgate::discovery::DiscoveryRegistry;
use wsgate::ownership::OwnershipRegistry;
use wsgate::session::store::derive_key;
use wsgate::{ConnRegistry, KvStore, Revoker, SessionStore, TokenService};

use wsgate_proxy::agents::AgentClient;
use wsgate_proxy::auth::directory::StaticDirectory;
use wsgate_proxy::config::{
    AppConfig, AuthConfig, CodeServerConfig, DiscoveryConfig, RedisConfig, RedisInsightConfig,
    SecretsConfig, ServerConfig, StaticUser, UserInfoConfig,
};
use wsgate_proxy::routes::create_router;
use wsgate_proxy::state::AppState;

pub const TEST_AGENT_KEY: &str = "test-agent-key";

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        redis: RedisConfig::default(),
        secrets: SecretsConfig {
            jwt_access_key: "test-access".to_string(),
            jwt_refresh_key: "test-refresh".to_string(),
            jwt_issuer: "wsgate".to_string(),
            jwt_audience: "wsgate-users".to_string(),
            session_secret: "test-session-secret".to_string(),
            agent_key: TEST_AGENT_KEY.to_string(),
        },
        auth: AuthConfig {
            backend: "static".to_string(),
            regular_roles: "bdadmins, bddataengineers".to_string(),
            admin_roles: "bdadmins".to_string(),
            ldap_bridge_url: String::new(),
            ldap_bridge_api_key: String::new(),
            static_users: vec![StaticUser {
                username: "alice".to_string(),
                password_hash: bcrypt::hash("p", 4).unwrap(),
                groups: vec!["bdadmins".to_string()],
            }],
        },
        code_server: CodeServerConfig::default(),
        discovery: DiscoveryConfig::default(),
        redisinsight: RedisInsightConfig::default(),
        user_info: UserInfoConfig::default(),
    }
}

/// Build a test app over a lazy KV client: routes that never touch the
/// store work without a live Redis.
pub fn test_app() -> Router {
    let cfg = test_config();
    let kv = KvStore::open("127.0.0.1", 1, "", 0).unwrap();
    let store = SessionStore::new(kv.clone(), "session", derive_key("test-session-secret"));
    let tokens = TokenService::new("test-access", "test-refresh", "wsgate", "wsgate-users");
    let revoker = Arc::new(Revoker::new());
    let registry = Arc::new(ConnRegistry::new(revoker.clone()));
    let discovery = DiscoveryRegistry::new(kv.clone(), cfg.discovery_ttl());
    let ownership = OwnershipRegistry::new(kv);
    let agents = AgentClient::new(TEST_AGENT_KEY, Arc::new(discovery.clone())).unwrap();
    let directory = Box::new(StaticDirectory::new(cfg.auth.static_users.clone()));

    let state = AppState::new(
        cfg, store, tokens, directory, revoker, registry, discovery, ownership, agents,
    );
    create_router(state)
}
