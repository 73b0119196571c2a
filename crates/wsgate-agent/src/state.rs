//! Agent application state.

use std::sync::Arc;

use wsgate::{SessionStore, TokenService};

use crate::auth::AgentAuthService;
use crate::config::AgentConfig;
use crate::containers::ContainerRuntime;
use crate::metrics::MetricsService;
use crate::proxy::AllowedPorts;

/// State shared across agent handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub runtime: Arc<ContainerRuntime>,
    pub metrics: Arc<MetricsService>,
    pub auth: Arc<AgentAuthService>,
    pub allowed_ports: Arc<AllowedPorts>,
}

impl AppState {
    pub fn new(
        config: AgentConfig,
        runtime: ContainerRuntime,
        store: SessionStore,
        tokens: TokenService,
    ) -> Self {
        let metrics = MetricsService::new(&config.server.proc_path);
        let auth = AgentAuthService::new(Arc::new(store), Arc::new(tokens));
        Self {
            config: Arc::new(config),
            runtime: Arc::new(runtime),
            metrics: Arc::new(metrics),
            auth: Arc::new(auth),
            allowed_ports: Arc::new(AllowedPorts::default()),
        }
    }
}
