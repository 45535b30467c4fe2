use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("illegal status transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: String,
        from: String,
        to: String,
    },
    #[error("io error persisting store: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
