use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client-submitted orchestration package. Immutable once accepted by the
/// Repository; the embedded copy on `Run` is the source of truth for the
/// rest of a run's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationPackage {
    pub package_version: String,
    pub metadata: PackageMetadata,
    pub objective: Objective,
    pub agents: Agents,
    pub registries: Registries,
    pub run_policy: RunPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub package_id: String,
    pub created_at: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Objective {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    pub done_criteria: Vec<DoneCriterion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneCriterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub required_evidence_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agents {
    pub orchestrator: AgentConfig,
    pub worker: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    /// `<provider>/<id>`, e.g. `anthropic/claude-orchestrator`.
    pub model: String,
    pub system_prompt_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Registries {
    #[serde(default)]
    pub skills: Vec<RegistryEntry>,
    #[serde(default)]
    pub variables: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    pub limits: Limits,
    pub retries: Retries,
    pub concurrency: Concurrency,
    pub timeouts: Timeouts,
    pub budget: Budget,
    pub determinism: Determinism,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_orchestrator_iterations: u32,
    pub max_worker_iterations: u32,
    pub max_run_wall_clock_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retries {
    pub max_worker_task_retries: u32,
    pub max_malformed_output_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concurrency {
    pub max_workers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub worker_task_ms: u64,
    pub orchestrator_step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Determinism {
    pub enforce_stage_order: bool,
    pub require_strict_json: bool,
    pub single_session_per_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewConfig {
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: String,
    pub ready_path: String,
    #[serde(default)]
    pub auto_stop_on_terminal: bool,
}
