use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use wsgate::discovery::DiscoveryRegistry;
use wsgate::ownership::OwnershipRegistry;
use wsgate::session::store::derive_key;
use wsgate::{ConnRegistry, KvStore, Revoker, SessionStore, TokenService};

use wsgate_proxy::agents::AgentClient;
use wsgate_proxy::auth::directory;
use wsgate_proxy::config::{self, AppConfig};
use wsgate_proxy::routes::create_router;
use wsgate_proxy::serve::{serve_http, serve_https};
use wsgate_proxy::state::AppState;

/// Interval between janitor sweeps of closed upgraded connections.
const JANITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(
    name = "wsgate-proxy",
    about = "wsgate proxy backend: session auth and reverse proxy into workspace agents",
    version
)]
struct Cli {
    /// Path to the config file (YAML, JSON or TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn find_config(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    for candidate in ["config.yaml", "config.json", "config.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(config_path) = find_config(&cli) else {
        eprintln!("error: no --config given and no config file found in the working directory");
        return ExitCode::FAILURE;
    };

    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&cfg.server.log_level),
    )
    .init();
    info!("loaded config from {}", config_path.display());

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let kv = KvStore::open(
        &cfg.redis.host,
        cfg.redis.port,
        &cfg.redis.password,
        cfg.redis.db,
    )?;
    kv.ping()
        .await
        .map_err(|e| anyhow::anyhow!("redis unavailable: {e}"))?;
    info!("redis connection ok ({}:{})", cfg.redis.host, cfg.redis.port);

    let store = SessionStore::new(
        kv.clone(),
        &cfg.code_server.session_prefix,
        derive_key(&cfg.secrets.session_secret),
    );
    let tokens = TokenService::new(
        &cfg.secrets.jwt_access_key,
        &cfg.secrets.jwt_refresh_key,
        &cfg.secrets.jwt_issuer,
        &cfg.secrets.jwt_audience,
    );

    let revoker = Arc::new(Revoker::new());
    let registry = Arc::new(ConnRegistry::new(revoker.clone()));
    let discovery = DiscoveryRegistry::new(kv.clone(), cfg.discovery_ttl());
    let ownership = OwnershipRegistry::new(kv.clone());
    let agents = AgentClient::new(&cfg.secrets.agent_key, Arc::new(discovery.clone()))?;
    let dir = directory::build(&cfg)?;
    info!("configured auth backend: {}", cfg.auth.backend);

    let shutdown = CancellationToken::new();
    registry.clone().start_janitor(shutdown.clone(), JANITOR_INTERVAL);

    let with_tls = cfg.server.with_tls;
    let pem = cfg.server.pem.clone();
    let key = cfg.server.key.clone();
    let address: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;

    let state = AppState::new(
        cfg, store, tokens, dir, revoker, registry, discovery, ownership, agents,
    );
    let app = create_router(state);

    let result = if with_tls {
        serve_https(app, address, &pem, &key).await
    } else {
        serve_http(app, address).await
    };
    shutdown.cancel();
    result
}
