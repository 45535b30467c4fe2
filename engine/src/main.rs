use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use orch_adapter::{AgentAdapter, LiveAdapter};
use orch_core::{Config, EventBus, Repository, Store};
use orch_engine::RunEngine;
use orch_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use orch_preview::PreviewSupervisor;
use orch_server::{serve, AppState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "orch-engine")]
#[command(about = "Orchestration run server: executes PLAN/ACT/CHECK/FIX/REPORT packages against an agent adapter")]
struct Cli {
    #[arg(long, env = "ORCH_HOST")]
    host: Option<String>,
    #[arg(long, env = "ORCH_PORT")]
    port: Option<u16>,
    #[arg(long, default_value = ".orch")]
    state_dir: PathBuf,
    #[arg(long, default_value_t = 14)]
    log_retention_days: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logs_dir = canonical_logs_dir_from_root(&cli.state_dir);
    let _guard = match init_process_logging(ProcessKind::Engine, &logs_dir, cli.log_retention_days) {
        Ok((guard, info)) => {
            tracing::info!(logs_dir = %info.logs_dir, "structured logging initialized");
            Some(guard)
        }
        Err(err) => {
            eprintln!("failed to initialize file logging, falling back to stderr: {err}");
            tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
            None
        }
    };

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state = build_state(&config).await?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host or port")?;
    info!("starting orch-engine on http://{addr} (adapter={})", if config.uses_live_adapter() { "live" } else { "mock" });
    serve(addr, state).await?;
    Ok(())
}

async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let store = Arc::new(Store::open(&config.db_path).await?);
    let event_bus = EventBus::new();
    let repo = Repository::new(store, event_bus);

    let adapter: Arc<dyn AgentAdapter> = if config.uses_live_adapter() {
        Arc::new(LiveAdapter::new(
            config.adapter_base_url.clone().expect("uses_live_adapter checked adapter_base_url"),
            config.adapter_secret.clone(),
            config.adapter_cwd.clone(),
        ))
    } else {
        Arc::new(orch_adapter::MockAdapter::new())
    };

    let preview = Arc::new(PreviewSupervisor::new());
    let engine = Arc::new(RunEngine::new(repo.clone(), adapter, preview.clone()));

    Ok(AppState::new(repo, engine, preview, config.clone()))
}
