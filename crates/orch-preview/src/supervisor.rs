use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, Method};
use orch_core::Repository;
use orch_types::{event_type, PreviewConfig};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const LOG_RING_CAPACITY: usize = 200;
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const READY_PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(2500);
const READY_PROBE_GLOBAL_TIMEOUT: Duration = Duration::from_secs(45);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewState {
    Starting,
    Ready,
    Stopped,
    Error,
}

impl PreviewState {
    fn as_str(self) -> &'static str {
        match self {
            PreviewState::Starting => "starting",
            PreviewState::Ready => "ready",
            PreviewState::Stopped => "stopped",
            PreviewState::Error => "error",
        }
    }
}

struct PreviewEntry {
    state: PreviewState,
    port: Option<u16>,
    started_at: Option<String>,
    stopped_at: Option<String>,
    error: Option<String>,
    child: Option<Arc<Mutex<Child>>>,
    logs: VecDeque<String>,
}

impl PreviewEntry {
    fn stopped() -> Self {
        Self {
            state: PreviewState::Stopped,
            port: None,
            started_at: None,
            stopped_at: None,
            error: None,
            child: None,
            logs: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub proxied_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("preview disabled for this run")]
    Disabled,
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("preview not running")]
    NotRunning,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

fn proxied_path(run_id: &str) -> String {
    format!("/runs/{run_id}/preview/")
}

fn now() -> String {
    orch_types::now_rfc3339()
}

/// Owns one child process per run: allocates a port, spawns the command,
/// probes readiness, proxies GET/HEAD to it, and tears it down. Entries are
/// looked up and mutated under a single map lock; child I/O and HTTP calls
/// happen without the lock held, mirroring the teacher's PTY manager.
pub struct PreviewSupervisor {
    entries: Arc<Mutex<HashMap<String, PreviewEntry>>>,
    client: reqwest::Client,
}

impl PreviewSupervisor {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(READY_PROBE_CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            client,
        }
    }

    pub async fn get(&self, run_id: &str) -> PreviewStatus {
        let entries = self.entries.lock().await;
        match entries.get(run_id) {
            Some(entry) => status_from_entry(run_id, entry),
            None => status_from_entry(run_id, &PreviewEntry::stopped()),
        }
    }

    pub async fn start(
        &self,
        run_id: &str,
        cfg: &PreviewConfig,
        repo: &Repository,
    ) -> Result<PreviewStatus, PreviewError> {
        if !cfg.enabled {
            return Err(PreviewError::Disabled);
        }
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(run_id) {
                if matches!(entry.state, PreviewState::Starting | PreviewState::Ready) {
                    return Ok(status_from_entry(run_id, entry));
                }
            }
        }

        let port = allocate_port()
            .await
            .map_err(|err| PreviewError::SpawnFailed(err.to_string()))?;

        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                run_id.to_string(),
                PreviewEntry {
                    state: PreviewState::Starting,
                    port: Some(port),
                    started_at: Some(now()),
                    stopped_at: None,
                    error: None,
                    child: None,
                    logs: VecDeque::new(),
                },
            );
        }
        let _ = repo
            .record_preview_event(run_id, event_type::PREVIEW_STARTING, json!({"port": port}))
            .await;

        let args = substitute_args(&cfg.args, port, run_id);
        let mut command = Command::new(&cfg.command);
        command
            .args(&args)
            .current_dir(&cfg.cwd)
            .env("PORT", port.to_string())
            .env("HOST", "127.0.0.1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.mark_error(run_id, format!("spawn failed: {err}")).await;
                let _ = repo
                    .record_preview_event(
                        run_id,
                        event_type::PREVIEW_ERROR,
                        json!({"error": err.to_string()}),
                    )
                    .await;
                return Ok(self.get(run_id).await);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            self.spawn_log_reader(run_id.to_string(), stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_log_reader(run_id.to_string(), stderr);
        }

        let child = Arc::new(Mutex::new(child));
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(run_id) {
                entry.child = Some(child.clone());
            }
        }

        self.watch_readiness(run_id.to_string(), port, cfg.ready_path.clone(), child, repo.clone());

        Ok(self.get(run_id).await)
    }

    pub async fn stop(&self, run_id: &str, repo: &Repository) -> PreviewStatus {
        let child = {
            let entries = self.entries.lock().await;
            entries.get(run_id).and_then(|e| e.child.clone())
        };
        {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(run_id.to_string()).or_insert_with(PreviewEntry::stopped);
            if entry.state == PreviewState::Stopped {
                return status_from_entry(run_id, entry);
            }
            entry.state = PreviewState::Stopped;
            entry.stopped_at = Some(now());
            entry.child = None;
        }

        if let Some(child) = child {
            let mut child = child.lock().await;
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await;
            let _ = child.start_kill();
        }

        let _ = repo.record_preview_event(run_id, event_type::PREVIEW_STOPPED, json!({})).await;
        self.get(run_id).await
    }

    pub async fn proxy(
        &self,
        run_id: &str,
        method: &Method,
        upstream_path_and_query: &str,
        incoming_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ProxyError> {
        if method != Method::GET && method != Method::HEAD {
            return Err(ProxyError::MethodNotAllowed);
        }
        let port = {
            let entries = self.entries.lock().await;
            match entries.get(run_id) {
                Some(entry) if entry.state == PreviewState::Ready => entry.port,
                _ => None,
            }
        };
        let Some(port) = port else {
            return Err(ProxyError::NotRunning);
        };

        let url = format!("http://127.0.0.1:{port}{upstream_path_and_query}");
        let mut req = self.client.request(method.clone(), url);
        for (name, value) in incoming_headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            req = req.header(name, value);
        }
        req.send().await.map_err(|err| ProxyError::Upstream(err.to_string()))
    }

    async fn mark_error(&self, run_id: &str, message: String) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(run_id.to_string()).or_insert_with(PreviewEntry::stopped);
        entry.state = PreviewState::Error;
        entry.error = Some(message);
    }

    fn spawn_log_reader(&self, run_id: String, stream: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut entries = entries.lock().await;
                if let Some(entry) = entries.get_mut(&run_id) {
                    if entry.logs.len() >= LOG_RING_CAPACITY {
                        entry.logs.pop_front();
                    }
                    entry.logs.push_back(line);
                }
            }
        });
    }

    fn watch_readiness(
        &self,
        run_id: String,
        port: u16,
        ready_path: String,
        child: Arc<Mutex<Child>>,
        repo: Repository,
    ) {
        let entries = self.entries.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("http://127.0.0.1:{port}{ready_path}");
            let deadline = tokio::time::Instant::now() + READY_PROBE_GLOBAL_TIMEOUT;
            loop {
                if let Ok(Some(status)) = child.lock().await.try_wait() {
                    let already_ready = {
                        let entries = entries.lock().await;
                        entries.get(&run_id).map(|e| e.state) == Some(PreviewState::Ready)
                    };
                    let mut entries = entries.lock().await;
                    let entry = entries.entry(run_id.clone()).or_insert_with(PreviewEntry::stopped);
                    if already_ready {
                        entry.state = PreviewState::Stopped;
                        entry.stopped_at = Some(now());
                        drop(entries);
                        let _ = repo.record_preview_event(&run_id, event_type::PREVIEW_STOPPED, json!({})).await;
                    } else {
                        let reason = format!("preview exited (code={:?})", status.code());
                        entry.state = PreviewState::Error;
                        entry.error = Some(reason.clone());
                        drop(entries);
                        let _ = repo
                            .record_preview_event(&run_id, event_type::PREVIEW_ERROR, json!({"error": reason}))
                            .await;
                    }
                    return;
                }

                match client.get(&url).send().await {
                    Ok(resp) if (200..500).contains(&resp.status().as_u16()) => {
                        let mut entries = entries.lock().await;
                        let entry = entries.entry(run_id.clone()).or_insert_with(PreviewEntry::stopped);
                        entry.state = PreviewState::Ready;
                        drop(entries);
                        let _ = repo
                            .record_preview_event(
                                &run_id,
                                event_type::PREVIEW_READY,
                                json!({"externalUrl": proxied_path(&run_id)}),
                            )
                            .await;
                        return;
                    }
                    _ => {}
                }

                if tokio::time::Instant::now() >= deadline {
                    let reason = "preview readiness timed out after 45000ms".to_string();
                    let mut entries = entries.lock().await;
                    let entry = entries.entry(run_id.clone()).or_insert_with(PreviewEntry::stopped);
                    entry.state = PreviewState::Error;
                    entry.error = Some(reason.clone());
                    drop(entries);
                    let _ = repo
                        .record_preview_event(&run_id, event_type::PREVIEW_ERROR, json!({"error": reason}))
                        .await;
                    return;
                }
                tokio::time::sleep(READY_PROBE_INTERVAL).await;
            }
        });
    }
}

impl Default for PreviewSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn status_from_entry(run_id: &str, entry: &PreviewEntry) -> PreviewStatus {
    let external_url = (entry.state == PreviewState::Ready).then(|| proxied_path(run_id));
    PreviewStatus {
        state: entry.state.as_str().to_string(),
        port: entry.port,
        proxied_path: proxied_path(run_id),
        started_at: entry.started_at.clone(),
        stopped_at: entry.stopped_at.clone(),
        error: entry.error.clone(),
        external_url,
        logs: entry.logs.iter().cloned().collect(),
    }
}

async fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn substitute_args(args: &[String], port: u16, run_id: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace("{PORT}", &port.to_string()).replace("{RUN_ID}", run_id))
        .collect()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host" | "connection" | "transfer-encoding" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::{EventBus, Store};

    async fn repo() -> Repository {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        Repository::new(store, EventBus::new())
    }

    fn disabled_cfg() -> PreviewConfig {
        PreviewConfig {
            enabled: false,
            command: "true".into(),
            args: vec![],
            cwd: ".".into(),
            ready_path: "/".into(),
            auto_stop_on_terminal: true,
        }
    }

    #[tokio::test]
    async fn start_rejects_disabled_preview() {
        let supervisor = PreviewSupervisor::new();
        let repo = repo().await;
        let err = supervisor.start("r1", &disabled_cfg(), &repo).await.unwrap_err();
        assert!(matches!(err, PreviewError::Disabled));
    }

    #[tokio::test]
    async fn get_on_unknown_run_is_synthetic_stopped() {
        let supervisor = PreviewSupervisor::new();
        let status = supervisor.get("nope").await;
        assert_eq!(status.state, "stopped");
        assert_eq!(status.proxied_path, "/runs/nope/preview/");
    }

    #[tokio::test]
    async fn stop_on_never_started_run_is_idempotent() {
        let supervisor = PreviewSupervisor::new();
        let repo = repo().await;
        let status = supervisor.stop("r1", &repo).await;
        assert_eq!(status.state, "stopped");
    }

    #[tokio::test]
    async fn proxy_rejects_non_get_head() {
        let supervisor = PreviewSupervisor::new();
        let err = supervisor
            .proxy("r1", &Method::POST, "/", &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MethodNotAllowed));
    }

    #[tokio::test]
    async fn proxy_returns_not_running_when_no_entry() {
        let supervisor = PreviewSupervisor::new();
        let err = supervisor
            .proxy("r1", &Method::GET, "/", &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotRunning));
    }

    #[test]
    fn substitute_args_replaces_placeholders() {
        let args = vec!["--port={PORT}".to_string(), "--run={RUN_ID}".to_string()];
        let out = substitute_args(&args, 4321, "run-1");
        assert_eq!(out, vec!["--port=4321", "--run=run-1"]);
    }
}
