use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, AgentAdapter, AssistantChunk, ChunkStream, SessionConfig, TokenUsage};

/// Talks to a real coding-agent backend over HTTP. The wire protocol is a
/// thin session/prompt surface: `POST {base}/sessions` to create a
/// session, `POST {base}/sessions/{id}/messages` with `stream: true` for a
/// server-sent-events response, `POST {base}/sessions/{id}/cancel` to
/// cancel.
pub struct LiveAdapter {
    base_url: String,
    secret: Option<String>,
    cwd: Option<String>,
    client: Client,
}

impl LiveAdapter {
    pub fn new(base_url: String, secret: Option<String>, cwd: Option<String>) -> Self {
        Self {
            base_url,
            secret,
            cwd,
            client: Client::new(),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => builder.bearer_auth(secret),
            None => builder,
        }
    }
}

#[async_trait]
impl AgentAdapter for LiveAdapter {
    fn kind(&self) -> &'static str {
        "live"
    }

    async fn create_session(&self, config: SessionConfig) -> Result<String, AdapterError> {
        let url = format!("{}/sessions", self.base_url);
        let mut body = json!({
            "model": config.model,
            "systemPromptRef": config.system_prompt_ref,
            "temperature": config.temperature,
        });
        if let Some(cwd) = &self.cwd {
            body["directory"] = json!(cwd);
        }
        let req = self.authed(self.client.post(url).json(&body));
        let resp = req
            .send()
            .await
            .map_err(|err| AdapterError::SessionCreateFailed(err.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::SessionCreateFailed(format!(
                "status {status}: {text}"
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|err| AdapterError::SessionCreateFailed(err.to_string()))?;
        value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::SessionCreateFailed("response missing sessionId".into()))
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        model: &str,
        directory: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, AdapterError> {
        let url = format!("{}/sessions/{}/messages", self.base_url, session_id);
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
        });
        if let Some(dir) = directory.or(self.cwd.as_deref()) {
            body["directory"] = json!(dir);
        }
        let req = self.authed(self.client.post(url).json(&body));
        let resp = req
            .send()
            .await
            .map_err(|err| AdapterError::Transport(err.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Transport(format!("status {status}: {text}")));
        }

        let mut bytes = resp.bytes_stream();
        let stream = stream! {
            let mut buffer = String::new();
            loop {
                if cancel.is_cancelled() {
                    yield Err(AdapterError::Canceled);
                    return;
                }
                let Some(chunk) = bytes.next().await else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(err) => {
                        yield Err(AdapterError::Transport(err.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else { continue };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            continue;
                        }
                        match parse_chunk(payload) {
                            Ok(chunk) => yield Ok(chunk),
                            Err(err) => yield Err(err),
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn cancel_session(&self, session_id: &str) {
        let url = format!("{}/sessions/{}/cancel", self.base_url, session_id);
        let _ = self.authed(self.client.post(url)).send().await;
    }
}

fn parse_chunk(payload: &str) -> Result<AssistantChunk, AdapterError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| AdapterError::MalformedOutput(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AdapterError::MalformedOutput("chunk missing 'type'".into()))?;
    match kind {
        "text" => Ok(AssistantChunk::Text(
            value
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        )),
        "tool_call" => Ok(AssistantChunk::ToolCall {
            name: value
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            args: value.get("args").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Ok(AssistantChunk::ToolResult {
            id: value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            output: value.get("output").cloned().unwrap_or(Value::Null),
        }),
        "usage" => Ok(AssistantChunk::Usage(TokenUsage {
            tokens: value.get("tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            cost_usd: value.get("costUsd").and_then(|v| v.as_f64()).unwrap_or(0.0),
        })),
        "finish" => Ok(AssistantChunk::Finish {
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("stop")
                .to_string(),
        }),
        other => Err(AdapterError::MalformedOutput(format!(
            "unknown chunk type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_chunk() {
        let chunk = parse_chunk(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert!(matches!(chunk, AssistantChunk::Text(t) if t == "hi"));
    }

    #[test]
    fn rejects_unknown_chunk_type() {
        let err = parse_chunk(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedOutput(_)));
    }
}
