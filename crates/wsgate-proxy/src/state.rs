//! Application state shared across handlers.

use std::sync::Arc;

use wsgate::discovery::DiscoveryRegistry;
use wsgate::ownership::OwnershipRegistry;
use wsgate::{ConnRegistry, Revoker, SessionStore, TokenService};

use crate::agents::AgentClient;
use crate::auth::directory::Directory;
use crate::auth::AuthService;
use crate::config::AppConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<SessionStore>,
    pub tokens: Arc<TokenService>,
    pub auth: Arc<AuthService>,
    pub directory: Arc<dyn Directory>,
    pub revoker: Arc<Revoker>,
    pub registry: Arc<ConnRegistry>,
    pub discovery: Arc<DiscoveryRegistry>,
    pub ownership: Arc<OwnershipRegistry>,
    pub agents: Arc<AgentClient>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: SessionStore,
        tokens: TokenService,
        directory: Box<dyn Directory>,
        revoker: Arc<Revoker>,
        registry: Arc<ConnRegistry>,
        discovery: DiscoveryRegistry,
        ownership: OwnershipRegistry,
        agents: AgentClient,
    ) -> Self {
        let store = Arc::new(store);
        let tokens = Arc::new(tokens);
        let auth = Arc::new(AuthService::new(
            store.clone(),
            tokens.clone(),
            revoker.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            tokens,
            auth,
            directory: Arc::from(directory),
            revoker,
            registry,
            discovery: Arc::new(discovery),
            ownership: Arc::new(ownership),
            agents: Arc::new(agents),
        }
    }
}
