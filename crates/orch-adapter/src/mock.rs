use async_stream::stream;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{AdapterError, AgentAdapter, AssistantChunk, ChunkStream, SessionConfig, TokenUsage};

/// Deterministic adapter used for tests and `ORCH_ALLOW_MOCK_RUNS=1`
/// development. It has no notion of the orchestration stage machine; it
/// reads the leading `STAGE:<name>` or `WORKER_TASK:<id>` marker line that
/// the engine's prompt builder always emits, and returns a canned JSON
/// response shaped the way that stage (or worker task) expects.
#[derive(Default)]
pub struct MockAdapter {
    sessions: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn canned_response(prompt: &str) -> serde_json::Value {
        let first_line = prompt.lines().next().unwrap_or_default();
        if let Some(rest) = first_line.strip_prefix("STAGE:") {
            return match rest {
                "plan" => json!({
                    "implementationPlanMd": "- [ ] T1: do the work\n",
                    "tasks": [{"taskId": "T1", "description": "do the work"}],
                    "summary": "plan ready",
                }),
                "act" => json!({
                    "workerDispatch": [{"taskId": "T1"}],
                    "notes": "dispatch",
                }),
                "check" => json!({
                    "status": "pass",
                    "failedCriteria": [],
                    "summary": "all good",
                }),
                "fix" => json!({
                    "workerDispatch": [],
                    "notes": "nothing to fix",
                }),
                "report" => json!({
                    "summary": "done",
                    "artifacts": [{"kind": "summary", "uri": "mock://artifact/1"}],
                }),
                _ => json!({}),
            };
        }
        if first_line.starts_with("WORKER_TASK:") {
            return json!({
                "resultJson": {"ok": true},
                "evidence": [{"type": "log_excerpt", "payload": {"text": "ran task"}}],
            });
        }
        json!({})
    }
}

#[async_trait]
impl AgentAdapter for MockAdapter {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn create_session(&self, _config: SessionConfig) -> Result<String, AdapterError> {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().await.push(id.clone());
        Ok(id)
    }

    async fn send_prompt(
        &self,
        _session_id: &str,
        prompt: &str,
        _model: &str,
        _directory: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, AdapterError> {
        let response = Self::canned_response(prompt);
        let text = response.to_string();
        let stream = stream! {
            if cancel.is_cancelled() {
                yield Err(AdapterError::Canceled);
                return;
            }
            yield Ok(AssistantChunk::Text(text));
            yield Ok(AssistantChunk::Usage(TokenUsage { tokens: 42, cost_usd: 0.001 }));
            yield Ok(AssistantChunk::Finish { reason: "stop".to_string() });
        };
        Ok(Box::pin(stream))
    }

    async fn cancel_session(&self, _session_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn plan_stage_returns_task_list() {
        let adapter = MockAdapter::new();
        let session = adapter
            .create_session(SessionConfig {
                model: "mock/model".into(),
                system_prompt_ref: None,
                temperature: None,
            })
            .await
            .unwrap();
        let mut stream = adapter
            .send_prompt(&session, "STAGE:plan\nbuild the thing", "mock/model", None, CancellationToken::new())
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            AssistantChunk::Text(text) => {
                let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed["tasks"][0]["taskId"], "T1");
            }
            _ => panic!("expected text chunk"),
        }
    }

    #[tokio::test]
    async fn cancellation_yields_canceled_error() {
        let adapter = MockAdapter::new();
        let token = CancellationToken::new();
        token.cancel();
        let mut stream = adapter
            .send_prompt("s", "STAGE:plan", "mock/model", None, token)
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(AdapterError::Canceled)));
    }
}
