use std::sync::Arc;

use orch_core::{Config, Repository};
use orch_engine::RunEngine;
use orch_preview::PreviewSupervisor;

mod http;

pub use http::serve;

/// Everything an axum handler needs, cloned per-request (every field is an
/// `Arc` or `Clone`-cheap handle onto shared state).
#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub engine: Arc<RunEngine>,
    pub preview: Arc<PreviewSupervisor>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(repo: Repository, engine: Arc<RunEngine>, preview: Arc<PreviewSupervisor>, config: Config) -> Self {
        Self {
            repo,
            engine,
            preview,
            config: Arc::new(config),
        }
    }
}
