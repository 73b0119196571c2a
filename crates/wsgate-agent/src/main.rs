use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use wsgate::session::store::derive_key;
use wsgate::{KvStore, SessionStore, TokenService};

use wsgate_agent::config::{self, AgentConfig};
use wsgate_agent::containers::{ContainerRuntime, RuntimeType};
use wsgate_agent::heartbeat::DiscoveryClient;
use wsgate_agent::routes::create_router;
use wsgate_agent::serve;
use wsgate_agent::state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "wsgate-agent",
    about = "wsgate agent: workspace containers, host metrics and the container-side proxy",
    version
)]
struct Cli {
    /// Path to the config file (YAML, JSON or TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Container runtime to drive
    #[arg(long, value_enum, default_value_t = RuntimeArg::Docker)]
    runtime: RuntimeArg,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum RuntimeArg {
    Docker,
    Podman,
}

impl From<RuntimeArg> for RuntimeType {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => RuntimeType::Docker,
            RuntimeArg::Podman => RuntimeType::Podman,
        }
    }
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

    match run(cfg, cli.runtime.into()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cfg: AgentConfig, runtime_type: RuntimeType) -> anyhow::Result<()> {
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
        kv,
        &cfg.code_server.session_prefix,
        derive_key(&cfg.secrets.session_secret),
    );
    let tokens = TokenService::new(
        &cfg.secrets.jwt_access_key,
        &cfg.secrets.jwt_refresh_key,
        &cfg.secrets.jwt_issuer,
        &cfg.secrets.jwt_audience,
    );
    let runtime = ContainerRuntime::new(runtime_type, cfg.container_template.clone());

    let shutdown = CancellationToken::new();
    let discovery = DiscoveryClient::new(&cfg)?;
    tokio::spawn(discovery.run(shutdown.clone()));

    let address: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    let with_tls = cfg.server.with_tls;
    let pem = cfg.server.pem.clone();
    let key = cfg.server.key.clone();

    let state = AppState::new(cfg, runtime, store, tokens);
    let app = create_router(state);

    let result = serve::run(app, address, with_tls, &pem, &key).await;
    shutdown.cancel();
    // Give the deregister call a moment before the runtime tears down.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    result
}
