use serde::{Deserialize, Serialize};
use serde_json::Value;

use orch_types::{Artifact, Evidence, Run, RunCounters, Task};

/// `{ "error": { "code", "message", "details?" } }` per the HTTP surface
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorPayload {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(code: impl Into<String>, message: impl Into<String>, details: Value) -> Self {
        Self {
            error: ErrorPayload {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }
}

/// The aggregate response body for `GET /runs/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub counters: RunCounters,
    pub tasks: Vec<Task>,
    pub results: Vec<orch_types::ResultRecord>,
    pub evidence: Vec<Evidence>,
    pub artifacts: Vec<Artifact>,
    pub latest_event_id: i64,
}

/// The `GET /health` response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub ok: bool,
    pub adapter: String,
    pub allow_mock_runs: bool,
}
