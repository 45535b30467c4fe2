use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orch_adapter::{AdapterError, AgentAdapter, AssistantChunk, SessionConfig};
use orch_core::Repository;
use orch_preview::PreviewSupervisor;
use orch_stages::{parse_stage_output, Stage, StageOutcome, StageOutput, StageSequencer};
use orch_types::{event_type, Artifact, Evidence, OrchestrationPackage, ResultRecord, RunStatus, Task, TaskStatus};

use crate::prompts::{stage_prompt, worker_prompt};
use crate::worker::WorkerOutput;

fn now() -> String {
    orch_types::now_rfc3339()
}

fn stage_events(stage: Stage) -> (&'static str, &'static str) {
    match stage {
        Stage::Plan => (event_type::ORCHESTRATOR_PLAN_STARTED, event_type::ORCHESTRATOR_PLAN_COMPLETED),
        Stage::Act => (event_type::ORCHESTRATOR_ACT_STARTED, event_type::ORCHESTRATOR_ACT_COMPLETED),
        Stage::Check => (event_type::ORCHESTRATOR_CHECK_STARTED, event_type::ORCHESTRATOR_CHECK_COMPLETED),
        Stage::Fix => (event_type::ORCHESTRATOR_FIX_STARTED, event_type::ORCHESTRATOR_FIX_COMPLETED),
        Stage::Report => (event_type::ORCHESTRATOR_REPORT_STARTED, event_type::ORCHESTRATOR_REPORT_COMPLETED),
    }
}

/// Drives a single run from `queued` to a terminal status. Owns no state of
/// its own beyond the per-run in-memory contexts needed for cancellation;
/// everything durable flows through the Repository.
pub struct RunEngine {
    repo: Repository,
    adapter: Arc<dyn AgentAdapter>,
    preview: Arc<PreviewSupervisor>,
    contexts: Mutex<HashMap<String, CancellationToken>>,
}

impl RunEngine {
    pub fn new(repo: Repository, adapter: Arc<dyn AgentAdapter>, preview: Arc<PreviewSupervisor>) -> Self {
        Self {
            repo,
            adapter,
            preview,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Requests cooperative cancellation for an in-flight run. A no-op if
    /// the run has no active engine context (already terminal, or not yet
    /// scheduled).
    pub async fn request_cancel(&self, run_id: &str) {
        if let Some(token) = self.contexts.lock().await.get(run_id) {
            token.cancel();
        }
    }

    /// Spawns the engine loop on the runtime. Panics inside the loop are
    /// caught at this boundary and surfaced as `run.failed` /
    /// `internal_error`, per the engine task boundary contract.
    pub fn schedule(self: Arc<Self>, run_id: String) {
        tokio::spawn(async move {
            let engine = self.clone();
            let id = run_id.clone();
            let result = AssertUnwindSafe(engine.run_until_terminal(&id)).catch_unwind().await;
            self.contexts.lock().await.remove(&run_id);
            if let Err(panic) = result {
                let message = panic_message(&panic);
                let _ = self
                    .repo
                    .update_run_status(&run_id, RunStatus::Failed, Some(format!("internal_error: {message}")))
                    .await;
            }
        });
    }

    /// Runs a scheduled run to completion and returns its terminal status.
    /// Exposed directly (not just via `schedule`) so tests can await it
    /// without racing a background task.
    pub async fn run_until_terminal(&self, run_id: &str) -> RunStatus {
        let token = CancellationToken::new();
        self.contexts.lock().await.insert(run_id.to_string(), token.clone());

        let Ok(run) = self.repo.get_run_or_throw(run_id).await else {
            return RunStatus::Failed;
        };
        let pkg = run.orchestration_package.clone();

        if let Err(status) = self.repo.update_run_status(run_id, RunStatus::Running, None).await {
            tracing::warn!(run_id, error = %status, "failed to transition run to running");
            return RunStatus::Failed;
        }

        let session_id = match self.establish_session(&pkg).await {
            Ok(id) => id,
            Err(reason) => {
                return self.fail(run_id, reason).await;
            }
        };

        let deadline = Instant::now() + Duration::from_millis(pkg.run_policy.limits.max_run_wall_clock_ms);
        let semaphore = Arc::new(Semaphore::new(pkg.run_policy.concurrency.max_workers as usize));
        let mut sequencer = StageSequencer::new();
        let mut known_tasks: HashMap<String, String> = HashMap::new();

        let terminal = loop {
            if sequencer.stage() == Stage::Plan
                && sequencer.iteration() > pkg.run_policy.limits.max_orchestrator_iterations
            {
                break self.fail(run_id, "max_orchestrator_iterations_exceeded").await;
            }
            if Instant::now() >= deadline {
                break self.timeout(run_id, &session_id).await;
            }
            if token.is_cancelled() || self.repo.get_run(run_id).await.map(|r| r.cancel_requested).unwrap_or(false) {
                break self.cancel(run_id, &session_id).await;
            }
            if self.budget_exhausted(run_id, &pkg).await {
                break self.fail(run_id, "budget_exceeded").await;
            }

            let stage = sequencer.stage();
            if stage == Stage::Plan {
                let _ = self.repo.bump_orchestrator_iteration(run_id).await;
            }
            let (started_event, completed_event) = stage_events(stage);
            let _ = self.repo.record_event(run_id, started_event, json!({})).await;

            let output = match self
                .run_stage(run_id, &pkg, stage, sequencer.iteration(), &session_id, token.clone())
                .await
            {
                Ok(output) => output,
                Err(reason) => break self.fail(run_id, reason).await,
            };

            match &output {
                StageOutput::Plan(plan) => {
                    known_tasks = plan
                        .tasks
                        .iter()
                        .map(|t| (t.task_id.clone(), t.description.clone()))
                        .collect();
                }
                StageOutput::Act(dispatch) | StageOutput::Fix(dispatch) => {
                    if !dispatch.worker_dispatch.iter().all(|item| known_tasks.contains_key(&item.task_id)) {
                        break self.fail(run_id, "invalid_task_id").await;
                    }
                    match self
                        .dispatch_workers(run_id, &pkg, &dispatch.worker_dispatch, &known_tasks, &session_id, semaphore.clone(), token.clone())
                        .await
                    {
                        Ok(()) => {}
                        Err(reason) => break self.fail(run_id, reason).await,
                    }
                }
                StageOutput::Check(check) => {
                    if !self.evidence_gate_satisfied(run_id, &pkg).await {
                        break self.fail(run_id, "evidence_missing").await;
                    }
                    let _ = check;
                }
                StageOutput::Report(report) => {
                    for artifact in &report.artifacts {
                        let _ = self
                            .repo
                            .record_artifact(Artifact {
                                run_id: run_id.to_string(),
                                artifact_id: Uuid::new_v4().to_string(),
                                kind: artifact.kind.clone(),
                                uri: artifact.uri.clone(),
                                checksum: artifact.checksum.clone(),
                                created_at: now(),
                            })
                            .await;
                    }
                }
            }

            let _ = self
                .repo
                .record_event(run_id, completed_event, json!({"output": stage_output_json(&output)}))
                .await;

            let check_status = match &output {
                StageOutput::Check(check) => Some(check.status),
                _ => None,
            };
            match sequencer.complete(stage, check_status) {
                StageOutcome::Advance(_) => continue,
                StageOutcome::IterationComplete => break self.succeed(run_id).await,
            }
        };

        self.adapter.cancel_session(&session_id).await;
        if pkg.preview.as_ref().map(|p| p.auto_stop_on_terminal).unwrap_or(false) {
            self.preview.stop(run_id, &self.repo).await;
        }
        terminal
    }

    async fn establish_session(&self, pkg: &OrchestrationPackage) -> Result<String, &'static str> {
        let config = SessionConfig {
            model: pkg.agents.orchestrator.model.clone(),
            system_prompt_ref: Some(pkg.agents.orchestrator.system_prompt_ref.clone()),
            temperature: pkg.agents.orchestrator.temperature,
        };
        match self.adapter.create_session(config.clone()).await {
            Ok(id) => Ok(id),
            Err(AdapterError::Transport(_)) => match self.adapter.create_session(config).await {
                Ok(id) => Ok(id),
                Err(_) => Err("adapter_unavailable"),
            },
            Err(_) => Err("session_create_failed"),
        }
    }

    async fn budget_exhausted(&self, run_id: &str, pkg: &OrchestrationPackage) -> bool {
        let Some(run) = self.repo.get_run(run_id).await else {
            return false;
        };
        run.budget_tokens_used >= pkg.run_policy.budget.max_tokens
            || run.budget_cost_used >= pkg.run_policy.budget.max_cost_usd
    }

    async fn evidence_gate_satisfied(&self, run_id: &str, pkg: &OrchestrationPackage) -> bool {
        for criterion in &pkg.objective.done_criteria {
            for ty in &criterion.required_evidence_types {
                let Some(evidence_type) = parse_evidence_type(ty) else {
                    continue;
                };
                if !self.repo.has_evidence_type(run_id, evidence_type).await {
                    return false;
                }
            }
        }
        true
    }

    async fn run_stage(
        &self,
        run_id: &str,
        pkg: &OrchestrationPackage,
        stage: Stage,
        iteration: u32,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<StageOutput, &'static str> {
        let max_retries = pkg.run_policy.retries.max_malformed_output_retries;
        let mut retry_hint: Option<String> = None;

        for attempt in 0..=max_retries {
            let prompt = stage_prompt(stage, pkg, iteration, retry_hint.as_deref());
            let step_timeout = Duration::from_millis(pkg.run_policy.timeouts.orchestrator_step_ms);
            let text = match tokio::time::timeout(
                step_timeout,
                collect_text(&*self.adapter, session_id, &prompt, &pkg.agents.orchestrator.model, None, cancel.clone(), &self.repo, run_id),
            )
            .await
            {
                Ok(Ok(text)) => text,
                Ok(Err(AdapterError::Canceled)) => return Err("canceled"),
                Ok(Err(_)) => return Err("adapter_unavailable"),
                Err(_) => return Err("adapter_unavailable"),
            };

            match parse_stage_output(stage, &text) {
                Ok(output) => return Ok(output),
                Err(err) => {
                    if attempt == max_retries {
                        return Err("malformed_orchestrator_output");
                    }
                    retry_hint = Some(err.to_string());
                }
            }
        }
        Err("malformed_orchestrator_output")
    }

    async fn dispatch_workers(
        &self,
        run_id: &str,
        pkg: &OrchestrationPackage,
        items: &[orch_stages::WorkerDispatchItem],
        known_tasks: &HashMap<String, String>,
        session_id: &str,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Result<(), &'static str> {
        let fatal = Arc::new(AtomicBool::new(false));

        futures::stream::iter(items.iter().cloned())
            .for_each_concurrent(pkg.run_policy.concurrency.max_workers as usize, |item| {
                let semaphore = semaphore.clone();
                let fatal = fatal.clone();
                let cancel = cancel.clone();
                let session_id = session_id.to_string();
                let model = pkg.agents.worker.model.clone();
                let max_retries = pkg.run_policy.retries.max_worker_task_retries;
                let worker_timeout = Duration::from_millis(pkg.run_policy.timeouts.worker_task_ms);
                let description = known_tasks.get(&item.task_id).cloned().unwrap_or_default();
                async move {
                    let _ = self
                        .repo
                        .record_task(Task::new(run_id, item.task_id.clone(), description.clone()))
                        .await;

                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };

                    let mut task = Task::new(run_id, item.task_id.clone(), description.clone());
                    task.status = TaskStatus::Running;
                    let _ = self.repo.record_task(task.clone()).await;

                    let mut retry_hint: Option<String> = None;
                    for attempt in 0..=max_retries {
                        task.attempts = attempt + 1;
                        let prompt = worker_prompt(&item.task_id, &description, retry_hint.as_deref());
                        let result = tokio::time::timeout(
                            worker_timeout,
                            collect_text(&*self.adapter, &session_id, &prompt, &model, None, cancel.clone(), &self.repo, run_id),
                        )
                        .await;

                        let text = match result {
                            Ok(Ok(text)) => text,
                            Ok(Err(AdapterError::Canceled)) => return,
                            Ok(Err(_)) => {
                                if attempt == max_retries {
                                    fatal.store(true, Ordering::SeqCst);
                                    task.status = TaskStatus::Failed;
                                    task.last_error = Some("adapter error".into());
                                    let _ = self.repo.record_task(task.clone()).await;
                                    return;
                                }
                                retry_hint = Some("adapter error, please retry".into());
                                continue;
                            }
                            Err(_) => {
                                retry_hint = Some("timed out, please retry".into());
                                if attempt == max_retries {
                                    task.status = TaskStatus::Failed;
                                    task.last_error = Some("worker task timed out".into());
                                    let _ = self.repo.record_task(task.clone()).await;
                                    return;
                                }
                                continue;
                            }
                        };

                        match serde_json::from_str::<WorkerOutput>(&text) {
                            Ok(output) => {
                                for evidence_item in output.evidence {
                                    let _ = self
                                        .repo
                                        .record_evidence(Evidence {
                                            run_id: run_id.to_string(),
                                            evidence_id: Uuid::new_v4().to_string(),
                                            evidence_type: evidence_item.evidence_type,
                                            payload: evidence_item.payload,
                                            linked_task_id: Some(item.task_id.clone()),
                                            created_at: now(),
                                        })
                                        .await;
                                }
                                let _ = self
                                    .repo
                                    .record_result(ResultRecord {
                                        run_id: run_id.to_string(),
                                        task_id: item.task_id.clone(),
                                        attempt: task.attempts,
                                        output_json: output.result_json,
                                        evidence_ids: Vec::new(),
                                        created_at: now(),
                                    })
                                    .await;
                                task.status = TaskStatus::Succeeded;
                                let _ = self.repo.record_task(task.clone()).await;
                                return;
                            }
                            Err(err) => {
                                if attempt == max_retries {
                                    task.status = TaskStatus::Failed;
                                    task.last_error = Some(err.to_string());
                                    let _ = self.repo.record_task(task.clone()).await;
                                    return;
                                }
                                retry_hint = Some(err.to_string());
                            }
                        }
                    }
                }
            })
            .await;

        if fatal.load(Ordering::SeqCst) {
            Err("worker_fatal")
        } else {
            Ok(())
        }
    }

    async fn fail(&self, run_id: &str, reason: &'static str) -> RunStatus {
        let _ = self.repo.update_run_status(run_id, RunStatus::Failed, Some(reason.to_string())).await;
        RunStatus::Failed
    }

    async fn succeed(&self, run_id: &str) -> RunStatus {
        let _ = self.repo.update_run_status(run_id, RunStatus::Succeeded, None).await;
        RunStatus::Succeeded
    }

    async fn timeout(&self, run_id: &str, session_id: &str) -> RunStatus {
        self.adapter.cancel_session(session_id).await;
        let _ = self.repo.update_run_status(run_id, RunStatus::TimedOut, Some("run_wall_clock_exceeded".into())).await;
        RunStatus::TimedOut
    }

    async fn cancel(&self, run_id: &str, session_id: &str) -> RunStatus {
        self.adapter.cancel_session(session_id).await;
        let _ = self
            .repo
            .update_run_status(run_id, RunStatus::Canceled, Some("canceled_by_user".into()))
            .await;
        RunStatus::Canceled
    }
}

async fn collect_text(
    adapter: &dyn AgentAdapter,
    session_id: &str,
    prompt: &str,
    model: &str,
    directory: Option<&str>,
    cancel: CancellationToken,
    repo: &Repository,
    run_id: &str,
) -> Result<String, AdapterError> {
    let mut stream = adapter.send_prompt(session_id, prompt, model, directory, cancel).await?;
    let mut text = String::new();
    let mut tokens = 0u64;
    let mut cost = 0.0;
    while let Some(chunk) = stream.next().await {
        match chunk? {
            AssistantChunk::Text(part) => text.push_str(&part),
            AssistantChunk::Usage(usage) => {
                tokens += usage.tokens;
                cost += usage.cost_usd;
            }
            AssistantChunk::Finish { .. } => break,
            AssistantChunk::ToolCall { .. } | AssistantChunk::ToolResult { .. } => {}
        }
    }
    if tokens > 0 || cost > 0.0 {
        let _ = repo.add_budget(run_id, tokens, cost).await;
    }
    Ok(text)
}

fn parse_evidence_type(raw: &str) -> Option<orch_types::EvidenceType> {
    use orch_types::EvidenceType::*;
    match raw {
        "log_excerpt" => Some(LogExcerpt),
        "diff" => Some(Diff),
        "file_ref" => Some(FileRef),
        "test_report" => Some(TestReport),
        "url" => Some(Url),
        _ => None,
    }
}

fn stage_output_json(output: &StageOutput) -> serde_json::Value {
    match output {
        StageOutput::Plan(v) => serde_json::to_value(v).unwrap_or_default(),
        StageOutput::Act(v) | StageOutput::Fix(v) => serde_json::to_value(v).unwrap_or_default(),
        StageOutput::Check(v) => serde_json::to_value(v).unwrap_or_default(),
        StageOutput::Report(v) => serde_json::to_value(v).unwrap_or_default(),
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orch_adapter::MockAdapter;
    use orch_core::{EventBus, Store};
    use orch_types::event_type;

    use super::*;

    fn sample_package() -> OrchestrationPackage {
        serde_json::from_value(serde_json::json!({
            "packageVersion": "0.1.0",
            "metadata": {"packageId": "p", "createdAt": "t", "createdBy": "u"},
            "objective": {
                "title": "ship it",
                "description": "make the mock run succeed",
                "inputs": {},
                "doneCriteria": [{"id": "dc1", "description": "evidence present", "requiredEvidenceTypes": ["log_excerpt"]}]
            },
            "agents": {
                "orchestrator": {"name": "o", "model": "mock/orchestrator", "systemPromptRef": "orch-prompt"},
                "worker": {"name": "w", "model": "mock/worker", "systemPromptRef": "worker-prompt"}
            },
            "registries": {"skills": [], "variables": []},
            "runPolicy": {
                "limits": {"maxOrchestratorIterations": 3, "maxWorkerIterations": 3, "maxRunWallClockMs": 60000},
                "retries": {"maxWorkerTaskRetries": 1, "maxMalformedOutputRetries": 1},
                "concurrency": {"maxWorkers": 2},
                "timeouts": {"workerTaskMs": 5000, "orchestratorStepMs": 5000},
                "budget": {"maxTokens": 1_000_000, "maxCostUsd": 100.0},
                "determinism": {"enforceStageOrder": true, "requireStrictJson": true, "singleSessionPerRun": true}
            }
        }))
        .unwrap()
    }

    async fn engine() -> (RunEngine, Repository) {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let repo = Repository::new(store, EventBus::new());
        let adapter: Arc<dyn AgentAdapter> = Arc::new(MockAdapter::new());
        let preview = Arc::new(PreviewSupervisor::new());
        (RunEngine::new(repo.clone(), adapter, preview), repo)
    }

    #[tokio::test]
    async fn happy_path_reaches_succeeded_with_full_stage_cycle() {
        let (engine, repo) = engine().await;
        let run = repo.create_run(sample_package()).await.unwrap();

        let status = engine.run_until_terminal(&run.id).await;

        assert_eq!(status, RunStatus::Succeeded);
        let final_run = repo.get_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Succeeded);

        let events: Vec<String> = repo
            .list_run_events(&run.id, 0)
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        for expected in [
            event_type::RUN_STARTED,
            event_type::ORCHESTRATOR_PLAN_COMPLETED,
            event_type::ORCHESTRATOR_ACT_COMPLETED,
            event_type::ORCHESTRATOR_CHECK_COMPLETED,
            event_type::ORCHESTRATOR_REPORT_COMPLETED,
            event_type::RUN_SUCCEEDED,
        ] {
            assert!(events.contains(&expected.to_string()), "missing {expected} in {events:?}");
        }

        let tasks = repo.list_tasks(&run.id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Succeeded);

        let evidence = repo.list_evidence(&run.id).await;
        assert!(!evidence.is_empty());

        let artifacts = repo.list_artifacts(&run.id).await;
        assert_eq!(artifacts.len(), 1);
    }

    #[tokio::test]
    async fn missing_evidence_type_fails_the_run_at_check() {
        let mut pkg = sample_package();
        pkg.objective.done_criteria[0].required_evidence_types = vec!["diff".to_string()];
        let (engine, repo) = engine().await;
        let run = repo.create_run(pkg).await.unwrap();

        let status = engine.run_until_terminal(&run.id).await;

        assert_eq!(status, RunStatus::Failed);
        let final_run = repo.get_run(&run.id).await.unwrap();
        assert_eq!(final_run.reason.as_deref(), Some("evidence_missing"));
    }

    #[tokio::test]
    async fn request_cancel_before_run_starts_is_a_harmless_no_op() {
        let (engine, _repo) = engine().await;
        engine.request_cancel("never-scheduled").await;
    }
}
