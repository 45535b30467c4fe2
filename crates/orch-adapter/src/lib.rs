pub mod live;
pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use live::LiveAdapter;
pub use mock::MockAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("session create failed: {0}")]
    SessionCreateFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("canceled")]
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub tokens: u64,
    pub cost_usd: f64,
}

/// One chunk of an in-progress assistant response. The stream terminates
/// with `Finish` or an `Err`.
#[derive(Debug, Clone)]
pub enum AssistantChunk {
    Text(String),
    ToolCall { name: String, args: serde_json::Value },
    ToolResult { id: String, output: serde_json::Value },
    Usage(TokenUsage),
    Finish { reason: String },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<AssistantChunk, AdapterError>> + Send>>;

/// The external contract the engine drives: create a session, stream a
/// prompt's response, cancel a session. Two implementations: `live`
/// (talks to a real coding-agent backend over HTTP) and `mock`
/// (deterministic, for tests and `ORCH_ALLOW_MOCK_RUNS=1` development).
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn create_session(&self, config: SessionConfig) -> Result<String, AdapterError>;

    async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        model: &str,
        directory: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, AdapterError>;

    /// Idempotent, best-effort.
    async fn cancel_session(&self, session_id: &str);
}
