use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use orch_types::{Artifact, Evidence, Event, ResultRecord, Run, RunCounters, Task};

use crate::error::StoreError;

const MEMORY_SENTINEL: &str = ":memory:";

/// The durable tables named in the data model, persisted as a single JSON
/// snapshot. Every mutating Store method takes the write lock for the
/// duration of its in-memory mutation and its (optional) disk flush, which
/// is what gives `appendEvent` its atomic `eventId` allocation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    runs: HashMap<String, Run>,
    tasks: HashMap<String, Vec<Task>>,
    results: HashMap<String, Vec<ResultRecord>>,
    evidence: HashMap<String, Vec<Evidence>>,
    artifacts: HashMap<String, Vec<Artifact>>,
    events: HashMap<String, Vec<Event>>,
    counters: HashMap<String, RunCounters>,
    next_event_id: i64,
}

pub struct Store {
    snapshot_path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl Store {
    /// Opens the store at `path`. The `:memory:` sentinel disables disk
    /// persistence entirely; state then lives only in the process.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_SENTINEL {
            return Ok(Self {
                snapshot_path: None,
                tables: RwLock::new(Tables::default()),
            });
        }
        fs::create_dir_all(path).await?;
        let snapshot_path = path.join("store.json");
        let tables = if snapshot_path.exists() {
            let raw = fs::read_to_string(&snapshot_path).await?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Tables::default()
        };
        Ok(Self {
            snapshot_path: Some(snapshot_path),
            tables: RwLock::new(tables),
        })
    }

    async fn flush(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(tables)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn insert_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut tables = self.tables.write().await;
        tables.counters.entry(run.id.clone()).or_default();
        tables.runs.insert(run.id.clone(), run.clone());
        self.flush(&tables).await?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        self.tables.read().await.runs.get(run_id).cloned()
    }

    pub async fn get_run_or_err(&self, run_id: &str) -> Result<Run, StoreError> {
        self.get_run(run_id)
            .await
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    /// Replaces the stored run row. Callers are expected to have already
    /// validated any transition; the Store itself does not know the state
    /// machine.
    pub async fn put_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut tables = self.tables.write().await;
        tables.runs.insert(run.id.clone(), run.clone());
        self.flush(&tables).await?;
        Ok(run)
    }

    pub async fn get_counters(&self, run_id: &str) -> RunCounters {
        self.tables
            .read()
            .await
            .counters
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn with_counters_mut<F>(&self, run_id: &str, f: F) -> Result<RunCounters, StoreError>
    where
        F: FnOnce(&mut RunCounters),
    {
        let mut tables = self.tables.write().await;
        let entry = tables.counters.entry(run_id.to_string()).or_default();
        f(entry);
        let result = entry.clone();
        self.flush(&tables).await?;
        Ok(result)
    }

    pub async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
        ts: String,
    ) -> Result<Event, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_event_id += 1;
        let mut event = Event::new(run_id, event_type, data, ts);
        event.event_id = tables.next_event_id;
        tables
            .events
            .entry(run_id.to_string())
            .or_default()
            .push(event.clone());
        let counters = tables.counters.entry(run_id.to_string()).or_default();
        counters.latest_event_id = event.event_id;
        self.flush(&tables).await?;
        Ok(event)
    }

    pub async fn list_events(&self, run_id: &str, since_event_id: i64) -> Vec<Event> {
        self.tables
            .read()
            .await
            .events
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_id > since_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn push_task(&self, task: Task) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let list = tables.tasks.entry(task.run_id.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|t| t.task_id == task.task_id) {
            *existing = task;
        } else {
            list.push(task);
        }
        self.flush(&tables).await?;
        Ok(())
    }

    pub async fn list_tasks(&self, run_id: &str) -> Vec<Task> {
        self.tables
            .read()
            .await
            .tasks
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn push_result(&self, result: ResultRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .results
            .entry(result.run_id.clone())
            .or_default()
            .push(result);
        self.flush(&tables).await?;
        Ok(())
    }

    pub async fn list_results(&self, run_id: &str, limit: usize) -> Vec<ResultRecord> {
        self.tables
            .read()
            .await
            .results
            .get(run_id)
            .map(|r| r.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn push_evidence(&self, evidence: Evidence) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .evidence
            .entry(evidence.run_id.clone())
            .or_default()
            .push(evidence);
        self.flush(&tables).await?;
        Ok(())
    }

    pub async fn list_evidence(&self, run_id: &str) -> Vec<Evidence> {
        self.tables
            .read()
            .await
            .evidence
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn push_artifact(&self, artifact: Artifact) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .artifacts
            .entry(artifact.run_id.clone())
            .or_default()
            .push(artifact);
        self.flush(&tables).await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Vec<Artifact> {
        self.tables
            .read()
            .await
            .artifacts
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_ids_are_monotonic_and_global() {
        let store = Store::open(MEMORY_SENTINEL).await.unwrap();
        let e1 = store
            .append_event("run-a", "run.created", serde_json::json!({}), "t".into())
            .await
            .unwrap();
        let e2 = store
            .append_event("run-b", "run.created", serde_json::json!({}), "t".into())
            .await
            .unwrap();
        let e3 = store
            .append_event("run-a", "run.started", serde_json::json!({}), "t".into())
            .await
            .unwrap();
        assert_eq!(e1.event_id, 1);
        assert_eq!(e2.event_id, 2);
        assert_eq!(e3.event_id, 3);
    }

    #[tokio::test]
    async fn list_events_excludes_since_id() {
        let store = Store::open(MEMORY_SENTINEL).await.unwrap();
        for _ in 0..5 {
            store
                .append_event("run-a", "x", serde_json::json!({}), "t".into())
                .await
                .unwrap();
        }
        let tail = store.list_events("run-a", 3).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_id, 4);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).await.unwrap();
            store
                .insert_run(Run::new(
                    "r1".into(),
                    sample_package(),
                    "2026-08-01T00:00:00Z".into(),
                ))
                .await
                .unwrap();
        }
        let reopened = Store::open(dir.path()).await.unwrap();
        assert!(reopened.get_run("r1").await.is_some());
    }

    fn sample_package() -> orch_types::OrchestrationPackage {
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
}
