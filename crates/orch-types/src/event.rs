use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An append-only, globally ordered event row. `eventId` is assigned by the
/// Store at append time and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub run_id: String,
    pub event_id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub ts: String,
}

impl Event {
    pub fn new(run_id: impl Into<String>, event_type: impl Into<String>, mut data: Value, ts: String) -> Self {
        let run_id = run_id.into();
        if let Value::Object(map) = &mut data {
            map.insert("runId".to_string(), json!(run_id.clone()));
        }
        Self {
            run_id,
            event_id: 0,
            event_type: event_type.into(),
            data,
            ts,
        }
    }
}

pub mod event_type {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_SUCCEEDED: &str = "run.succeeded";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELED: &str = "run.canceled";
    pub const RUN_TIMED_OUT: &str = "run.timed_out";
    pub const RUN_CANCEL_REQUESTED: &str = "run.cancel.requested";

    pub const ORCHESTRATOR_PLAN_STARTED: &str = "orchestrator.plan.started";
    pub const ORCHESTRATOR_PLAN_COMPLETED: &str = "orchestrator.plan.completed";
    pub const ORCHESTRATOR_ACT_STARTED: &str = "orchestrator.act.started";
    pub const ORCHESTRATOR_ACT_COMPLETED: &str = "orchestrator.act.completed";
    pub const ORCHESTRATOR_CHECK_STARTED: &str = "orchestrator.check.started";
    pub const ORCHESTRATOR_CHECK_COMPLETED: &str = "orchestrator.check.completed";
    pub const ORCHESTRATOR_FIX_STARTED: &str = "orchestrator.fix.started";
    pub const ORCHESTRATOR_FIX_COMPLETED: &str = "orchestrator.fix.completed";
    pub const ORCHESTRATOR_REPORT_STARTED: &str = "orchestrator.report.started";
    pub const ORCHESTRATOR_REPORT_COMPLETED: &str = "orchestrator.report.completed";

    pub const WORKER_TASK_CREATED: &str = "worker.task.created";
    pub const WORKER_TASK_STARTED: &str = "worker.task.started";
    pub const WORKER_TASK_COMPLETED: &str = "worker.task.completed";
    pub const WORKER_TASK_FAILED: &str = "worker.task.failed";

    pub const EVIDENCE_RECORDED: &str = "evidence.recorded";
    pub const ARTIFACT_RECORDED: &str = "artifact.recorded";

    pub const PREVIEW_STARTING: &str = "preview.starting";
    pub const PREVIEW_READY: &str = "preview.ready";
    pub const PREVIEW_STOPPED: &str = "preview.stopped";
    pub const PREVIEW_ERROR: &str = "preview.error";
}
