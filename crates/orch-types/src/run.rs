use serde::{Deserialize, Serialize};

use crate::package::OrchestrationPackage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled | RunStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub budget_tokens_used: u64,
    pub budget_cost_used: f64,
    pub orchestration_package: OrchestrationPackage,
}

impl Run {
    pub fn new(id: String, package: OrchestrationPackage, now: String) -> Self {
        Self {
            id,
            status: RunStatus::Queued,
            reason: None,
            cancel_requested: false,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            finished_at: None,
            session_id: None,
            budget_tokens_used: 0,
            budget_cost_used: 0.0,
            orchestration_package: package,
        }
    }
}

/// Derived, Repository-maintained counters for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub orchestrator_iterations: u32,
    pub workers_spawned: u32,
    pub worker_failures: u32,
    pub evidence_items: u32,
    pub latest_event_id: i64,
}
