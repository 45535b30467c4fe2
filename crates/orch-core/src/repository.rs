use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use orch_types::{
    event_type, Artifact, Evidence, EvidenceType, OrchestrationPackage, ResultRecord, Run,
    RunCounters, RunStatus, Task, TaskStatus,
};

use crate::error::StoreError;
use crate::event_bus::EventBus;
use crate::store::Store;

/// Typed operations over the Store. Owns monotonic `eventId` allocation
/// (by delegating to `Store::append_event`, the only path that produces
/// events) and enforces the run-status state machine.
#[derive(Clone)]
pub struct Repository {
    store: Arc<Store>,
    event_bus: EventBus,
}

fn now() -> String {
    orch_types::now_rfc3339()
}

impl Repository {
    pub fn new(store: Arc<Store>, event_bus: EventBus) -> Self {
        Self { store, event_bus }
    }

    /// Gives HTTP handlers a way to subscribe to the live bus directly;
    /// the Repository otherwise only exposes durable reads/writes.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
    ) -> Result<orch_types::Event, StoreError> {
        let event = self.store.append_event(run_id, event_type, data, now()).await?;
        self.event_bus.publish(event.clone()).await;
        Ok(event)
    }

    pub async fn create_run(&self, pkg: OrchestrationPackage) -> Result<Run, StoreError> {
        let id = Uuid::new_v4().to_string();
        let run = Run::new(id, pkg, now());
        let run = self.store.insert_run(run).await?;
        self.append_event(&run.id, event_type::RUN_CREATED, json!({})).await?;
        Ok(run)
    }

    /// Records and publishes an arbitrary event. Used by callers outside
    /// this module that own a lifecycle the Repository itself doesn't model
    /// end-to-end: the RunEngine's stage-transition events, the
    /// PreviewSupervisor's `preview.*` events.
    pub async fn record_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
    ) -> Result<orch_types::Event, StoreError> {
        self.append_event(run_id, event_type, data).await
    }

    /// Persists and publishes a `preview.*` event. The PreviewSupervisor
    /// calls this directly; it owns no storage of its own (§4.5).
    pub async fn record_preview_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
    ) -> Result<orch_types::Event, StoreError> {
        self.record_event(run_id, event_type, data).await
    }

    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        self.store.get_run(run_id).await
    }

    pub async fn get_run_or_throw(&self, run_id: &str) -> Result<Run, StoreError> {
        self.store.get_run_or_err(run_id).await
    }

    pub async fn list_run_events(&self, run_id: &str, since_event_id: i64) -> Vec<orch_types::Event> {
        self.store.list_events(run_id, since_event_id).await
    }

    pub async fn list_tasks(&self, run_id: &str) -> Vec<Task> {
        self.store.list_tasks(run_id).await
    }

    pub async fn list_results(&self, run_id: &str, limit: usize) -> Vec<ResultRecord> {
        self.store.list_results(run_id, limit).await
    }

    pub async fn list_evidence(&self, run_id: &str) -> Vec<Evidence> {
        self.store.list_evidence(run_id).await
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Vec<Artifact> {
        self.store.list_artifacts(run_id).await
    }

    pub async fn get_run_counters(&self, run_id: &str) -> RunCounters {
        self.store.get_counters(run_id).await
    }

    fn legal_transition(from: RunStatus, to: RunStatus) -> bool {
        use RunStatus::*;
        if from.is_terminal() {
            return false;
        }
        matches!(
            (from, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, TimedOut)
        )
    }

    /// Asserts a legal transition (§4.6 state machine), updates timestamps,
    /// and emits the matching `run.*` event.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut run = self.store.get_run_or_err(run_id).await?;
        if !Self::legal_transition(run.status, status) {
            return Err(StoreError::IllegalTransition {
                run_id: run_id.to_string(),
                from: run.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let ts = now();
        run.updated_at = ts.clone();
        if run.status == RunStatus::Queued && status != RunStatus::Queued {
            run.started_at.get_or_insert_with(|| ts.clone());
        }
        if status.is_terminal() {
            run.finished_at = Some(ts.clone());
        }
        run.status = status;
        run.reason = reason.clone();
        let run = self.store.put_run(run).await?;

        let event_name = match status {
            RunStatus::Running => event_type::RUN_STARTED,
            RunStatus::Succeeded => event_type::RUN_SUCCEEDED,
            RunStatus::Failed => event_type::RUN_FAILED,
            RunStatus::Canceled => event_type::RUN_CANCELED,
            RunStatus::TimedOut => event_type::RUN_TIMED_OUT,
            RunStatus::Queued => unreachable!("no transition targets Queued"),
        };
        self.append_event(run_id, event_name, json!({"reason": reason})).await?;
        Ok(run)
    }

    /// Sets `cancelRequested`. If the run is still `queued`, the caller
    /// (the HTTP handler, per §4.6) is expected to follow up with
    /// `update_run_status(Canceled, "canceled_by_user")`.
    pub async fn request_cancel(&self, run_id: &str) -> Result<Run, StoreError> {
        let mut run = self.store.get_run_or_err(run_id).await?;
        run.cancel_requested = true;
        run.updated_at = now();
        let run = self.store.put_run(run).await?;
        self.append_event(run_id, event_type::RUN_CANCEL_REQUESTED, json!({})).await?;
        Ok(run)
    }

    pub async fn record_task(&self, task: Task) -> Result<(), StoreError> {
        let run_id = task.run_id.clone();
        let task_id = task.task_id.clone();
        let status = task.status;
        self.store.push_task(task).await?;
        let event_name = match status {
            TaskStatus::Queued => event_type::WORKER_TASK_CREATED,
            TaskStatus::Running => event_type::WORKER_TASK_STARTED,
            TaskStatus::Succeeded => event_type::WORKER_TASK_COMPLETED,
            TaskStatus::Failed => event_type::WORKER_TASK_FAILED,
            TaskStatus::Skipped => event_type::WORKER_TASK_FAILED,
        };
        if status == TaskStatus::Queued {
            self.store
                .with_counters_mut(&run_id, |c| c.workers_spawned += 1)
                .await?;
        }
        if status == TaskStatus::Failed {
            self.store
                .with_counters_mut(&run_id, |c| c.worker_failures += 1)
                .await?;
        }
        self.append_event(&run_id, event_name, json!({"taskId": task_id})).await?;
        Ok(())
    }

    pub async fn record_result(&self, result: ResultRecord) -> Result<(), StoreError> {
        let run_id = result.run_id.clone();
        self.store.push_result(result).await?;
        Ok(())
    }

    pub async fn record_evidence(&self, evidence: Evidence) -> Result<(), StoreError> {
        let run_id = evidence.run_id.clone();
        let evidence_id = evidence.evidence_id.clone();
        let evidence_type = evidence.evidence_type;
        self.store.push_evidence(evidence).await?;
        self.store
            .with_counters_mut(&run_id, |c| c.evidence_items += 1)
            .await?;
        self.append_event(
            &run_id,
            event_type::EVIDENCE_RECORDED,
            json!({"evidenceId": evidence_id, "type": evidence_type.as_str()}),
        )
        .await?;
        Ok(())
    }

    pub async fn record_artifact(&self, artifact: Artifact) -> Result<(), StoreError> {
        let run_id = artifact.run_id.clone();
        let artifact_id = artifact.artifact_id.clone();
        self.store.push_artifact(artifact).await?;
        self.append_event(
            &run_id,
            event_type::ARTIFACT_RECORDED,
            json!({"artifactId": artifact_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn add_budget(&self, run_id: &str, tokens: u64, cost_usd: f64) -> Result<Run, StoreError> {
        let mut run = self.store.get_run_or_err(run_id).await?;
        run.budget_tokens_used = run.budget_tokens_used.saturating_add(tokens);
        run.budget_cost_used += cost_usd;
        run.updated_at = now();
        self.store.put_run(run).await
    }

    pub async fn bump_orchestrator_iteration(&self, run_id: &str) -> Result<u32, StoreError> {
        let counters = self
            .store
            .with_counters_mut(run_id, |c| c.orchestrator_iterations += 1)
            .await?;
        Ok(counters.orchestrator_iterations)
    }

    /// Every `doneCriteria.requiredEvidenceTypes` must have at least one
    /// matching Evidence row accumulated across the whole run (§4.6
    /// evidence gate, cumulative per §9 open-question decision).
    pub async fn has_evidence_type(&self, run_id: &str, ty: EvidenceType) -> bool {
        self.store
            .list_evidence(run_id)
            .await
            .iter()
            .any(|e| e.evidence_type == ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_types::OrchestrationPackage;

    fn sample_package() -> OrchestrationPackage {
        serde_json::from_value(serde_json::json!({
            "packageVersion": "0.1.0",
            "metadata": {"packageId": "p", "createdAt": "t", "createdBy": "u"},
            "objective": {"title": "t", "description": "d", "inputs": {}, "doneCriteria": []},
            "agents": {
                "orchestrator": {"name": "o", "model": "a/b", "systemPromptRef": "p"},
                "worker": {"name": "w", "model": "a/b", "systemPromptRef": "p"}
            },
            "registries": {"skills": [], "variables": []},
            "runPolicy": {
                "limits": {"maxOrchestratorIterations": 1, "maxWorkerIterations": 1, "maxRunWallClockMs": 1000},
                "retries": {"maxWorkerTaskRetries": 0, "maxMalformedOutputRetries": 0},
                "concurrency": {"maxWorkers": 1},
                "timeouts": {"workerTaskMs": 1000, "orchestratorStepMs": 1000},
                "budget": {"maxTokens": 1, "maxCostUsd": 1.0},
                "determinism": {"enforceStageOrder": true, "requireStrictJson": true, "singleSessionPerRun": true}
            }
        }))
        .unwrap()
    }

    async fn repo() -> Repository {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        Repository::new(store, EventBus::new())
    }

    #[tokio::test]
    async fn create_run_starts_queued_and_emits_event() {
        let repo = repo().await;
        let run = repo.create_run(sample_package()).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        let events = repo.list_run_events(&run.id, 0).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_type::RUN_CREATED);
    }

    #[tokio::test]
    async fn terminal_status_rejects_further_transitions() {
        let repo = repo().await;
        let run = repo.create_run(sample_package()).await.unwrap();
        repo.update_run_status(&run.id, RunStatus::Running, None)
            .await
            .unwrap();
        repo.update_run_status(&run.id, RunStatus::Succeeded, None)
            .await
            .unwrap();
        let err = repo
            .update_run_status(&run.id, RunStatus::Failed, Some("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn queued_to_canceled_is_legal() {
        let repo = repo().await;
        let run = repo.create_run(sample_package()).await.unwrap();
        let run = repo
            .update_run_status(&run.id, RunStatus::Canceled, Some("canceled_by_user".into()))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn recording_evidence_bumps_counter_and_gate() {
        let repo = repo().await;
        let run = repo.create_run(sample_package()).await.unwrap();
        assert!(!repo.has_evidence_type(&run.id, EvidenceType::LogExcerpt).await);
        repo.record_evidence(Evidence {
            run_id: run.id.clone(),
            evidence_id: "ev1".into(),
            evidence_type: EvidenceType::LogExcerpt,
            payload: json!({}),
            linked_task_id: None,
            created_at: now(),
        })
        .await
        .unwrap();
        assert!(repo.has_evidence_type(&run.id, EvidenceType::LogExcerpt).await);
        let counters = repo.get_run_counters(&run.id).await;
        assert_eq!(counters.evidence_items, 1);
    }
}
