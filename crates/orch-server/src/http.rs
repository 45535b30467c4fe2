use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use orch_core::StoreError;
use orch_preview::ProxyError;
use orch_types::{validate, RunStatus};
use orch_wire::{ErrorBody, HealthStatus, RunDetail};

use crate::AppState;

const SSE_PING_INTERVAL: Duration = Duration::from_secs(15);

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(code, message))).into_response()
}

fn validation_error_response(errors: Vec<orch_types::ValidationError>) -> Response {
    let details = json!({
        "fields": errors.iter().map(|e| json!({"path": e.path, "message": e.message})).collect::<Vec<_>>(),
    });
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::with_details("invalid_package", "orchestration package failed validation", details)),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::RunNotFound(id) => error_response(StatusCode::NOT_FOUND, "not_found", format!("no run with id '{id}'")),
        StoreError::IllegalTransition { run_id, from, to } => error_response(
            StatusCode::CONFLICT,
            "illegal_transition",
            format!("run {run_id} cannot move from {from} to {to}"),
        ),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string()),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        ok: true,
        adapter: if state.config.uses_live_adapter() { "live".to_string() } else { "mock".to_string() },
        allow_mock_runs: state.config.allow_mock_runs,
    })
}

async fn create_run(State(state): State<AppState>, Json(raw): Json<Value>) -> Response {
    let pkg = match validate(&raw) {
        Ok(pkg) => pkg,
        Err(errors) => return validation_error_response(errors),
    };
    if !state.config.uses_live_adapter() && !state.config.allow_mock_runs {
        return error_response(
            StatusCode::CONFLICT,
            "mock_adapter_disabled",
            "no live adapter is configured and ORCH_ALLOW_MOCK_RUNS is not set",
        );
    }
    let run = match state.repo.create_run(pkg).await {
        Ok(run) => run,
        Err(err) => return store_error_response(err),
    };
    state.engine.clone().schedule(run.id.clone());
    (StatusCode::CREATED, Json(run)).into_response()
}

async fn run_detail(state: &AppState, run_id: &str) -> Result<RunDetail, Response> {
    let run = state
        .repo
        .get_run(run_id)
        .await
        .ok_or_else(|| store_error_response(StoreError::RunNotFound(run_id.to_string())))?;
    let counters = state.repo.get_run_counters(run_id).await;
    let tasks = state.repo.list_tasks(run_id).await;
    let results = state.repo.list_results(run_id, 200).await;
    let evidence = state.repo.list_evidence(run_id).await;
    let artifacts = state.repo.list_artifacts(run_id).await;
    let latest_event_id = counters.latest_event_id;
    Ok(RunDetail {
        run,
        counters,
        tasks,
        results,
        evidence,
        artifacts,
        latest_event_id,
    })
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match run_detail(&state, &run_id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(resp) => resp,
    }
}

async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let run = match state.repo.get_run(&run_id).await {
        Some(run) => run,
        None => return store_error_response(StoreError::RunNotFound(run_id)),
    };
    if run.status.is_terminal() {
        return error_response(
            StatusCode::CONFLICT,
            "already_terminal",
            format!("run {run_id} is already {}", run.status.as_str()),
        );
    }
    if let Err(err) = state.repo.request_cancel(&run_id).await {
        return store_error_response(err);
    }
    if run.status == RunStatus::Queued {
        return match state
            .repo
            .update_run_status(&run_id, RunStatus::Canceled, Some("canceled_by_user".into()))
            .await
        {
            Ok(run) => Json(run).into_response(),
            Err(err) => store_error_response(err),
        };
    }
    state.engine.request_cancel(&run_id).await;
    match state.repo.get_run(&run_id).await {
        Some(run) => Json(run).into_response(),
        None => store_error_response(StoreError::RunNotFound(run_id)),
    }
}

async fn start_preview(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let Some(run) = state.repo.get_run(&run_id).await else {
        return store_error_response(StoreError::RunNotFound(run_id));
    };
    let Some(cfg) = run.orchestration_package.preview.as_ref().filter(|cfg| cfg.enabled) else {
        return error_response(StatusCode::CONFLICT, "preview_disabled", "this run has no preview configuration");
    };
    match state.preview.start(&run_id, cfg, &state.repo).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(StatusCode::CONFLICT, "preview_start_failed", err.to_string()),
    }
}

async fn stop_preview(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let status = state.preview.stop(&run_id, &state.repo).await;
    Json(status).into_response()
}

async fn get_preview(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    Json(state.preview.get(&run_id).await).into_response()
}

async fn proxy_preview(
    State(state): State<AppState>,
    Path((run_id, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let upstream_path = format!("/{rest}");
    let http_method = http::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(http::Method::GET);
    let mut http_headers = http::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let Ok(name) = http::HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = http::HeaderValue::from_bytes(value.as_bytes()) {
                http_headers.insert(name, value);
            }
        }
    }
    match state.preview.proxy(&run_id, &http_method, &upstream_path, &http_headers).await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in upstream.headers().iter() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            let body = upstream.bytes().await.unwrap_or_default();
            builder
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(ProxyError::NotRunning) => error_response(StatusCode::NOT_FOUND, "preview_not_running", "preview is not ready"),
        Err(ProxyError::MethodNotAllowed) => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "only GET and HEAD are proxied")
        }
        Err(ProxyError::Upstream(msg)) => error_response(StatusCode::BAD_GATEWAY, "preview_upstream_error", msg),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<i64>,
}

fn event_to_sse(event: orch_types::Event) -> SseEvent {
    SseEvent::default()
        .id(event.event_id.to_string())
        .event(event.event_type.clone())
        .data(serde_json::to_string(&event).unwrap_or_default())
}

/// Replays every persisted event up to the subscriber's watermark (so
/// nothing written before `subscribe()` observed it is lost), then forwards
/// the live stream. `subscribe`/`publish` share one lock in the EventBus
/// (see its doc comment) so this handoff has no gap and no duplicate.
fn run_event_stream(state: AppState, run_id: String, last_event_id: Option<i64>) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        let since = last_event_id.unwrap_or(0);
        let (watermark, mut rx) = state.repo.event_bus().subscribe(&run_id).await;

        for event in state.repo.list_run_events(&run_id, since).await {
            if event.event_id <= watermark {
                yield Ok(event_to_sse(event));
            }
        }

        loop {
            match rx.recv().await {
                Some(orch_core::event_bus::BusMessage::Event(event)) => yield Ok(event_to_sse(event)),
                Some(orch_core::event_bus::BusMessage::Ping) => yield Ok(SseEvent::default().event("ping").data("{}")),
                None => break,
            }
        }
    }
}

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(query.last_event_id);
    Sse::new(run_event_stream(state, run_id, last_event_id)).keep_alive(KeepAlive::new().interval(SSE_PING_INTERVAL))
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(run_events))
        .route("/runs/{id}/preview", get(get_preview))
        .route("/runs/{id}/preview/start", post(start_preview))
        .route("/runs/{id}/preview/stop", post(stop_preview))
        .route("/runs/{id}/preview/{*rest}", get(proxy_preview).head(proxy_preview))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;
    use orch_adapter::MockAdapter;
    use orch_core::{Config, Repository, Store};
    use orch_engine::RunEngine;
    use orch_preview::PreviewSupervisor;
    use tower::ServiceExt;

    use super::*;

    async fn error_code(resp: Response) -> String {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let parsed: ErrorBody = serde_json::from_slice(&body).expect("error body");
        parsed.error.code
    }

    fn sample_package_json() -> Value {
        json!({
            "packageVersion": "0.1.0",
            "metadata": {"packageId": "p", "createdAt": "t", "createdBy": "u"},
            "objective": {
                "title": "t", "description": "d", "inputs": {},
                "doneCriteria": [{"id": "dc1", "description": "d", "requiredEvidenceTypes": []}]
            },
            "agents": {
                "orchestrator": {"name": "o", "model": "mock/o", "systemPromptRef": "p"},
                "worker": {"name": "w", "model": "mock/w", "systemPromptRef": "p"}
            },
            "registries": {"skills": [], "variables": []},
            "runPolicy": {
                "limits": {"maxOrchestratorIterations": 2, "maxWorkerIterations": 2, "maxRunWallClockMs": 30000},
                "retries": {"maxWorkerTaskRetries": 1, "maxMalformedOutputRetries": 1},
                "concurrency": {"maxWorkers": 1},
                "timeouts": {"workerTaskMs": 5000, "orchestratorStepMs": 5000},
                "budget": {"maxTokens": 100000, "maxCostUsd": 10.0},
                "determinism": {"enforceStageOrder": true, "requireStrictJson": true, "singleSessionPerRun": true}
            }
        })
    }

    async fn test_state() -> AppState {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let event_bus = orch_core::EventBus::new();
        let repo = Repository::new(store, event_bus);
        let adapter: Arc<dyn orch_adapter::AgentAdapter> = Arc::new(MockAdapter::new());
        let preview = Arc::new(PreviewSupervisor::new());
        let engine = Arc::new(RunEngine::new(repo.clone(), adapter, preview.clone()));
        let mut config = Config::from_env();
        config.allow_mock_runs = true;
        AppState::new(repo, engine, preview, config)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(axum::http::Request::get("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_rejects_invalid_package() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::post("/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&json!({})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(resp).await, "invalid_package");
    }

    #[tokio::test]
    async fn create_run_rejects_when_mock_adapter_disabled() {
        let mut state = test_state().await;
        state.config = Arc::new(Config {
            allow_mock_runs: false,
            ..(*state.config).clone()
        });
        let app = app_router(state);
        let resp = app
            .oneshot(
                axum::http::Request::post("/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&sample_package_json()).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(resp).await, "mock_adapter_disabled");
    }

    #[tokio::test]
    async fn create_run_accepts_valid_package_and_schedules_it() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::post("/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&sample_package_json()).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn get_unknown_run_is_404() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(axum::http::Request::get("/runs/nope").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(resp).await, "not_found");
    }

    #[tokio::test]
    async fn cancel_of_terminal_run_is_already_terminal() {
        let state = test_state().await;
        let run = state.repo.create_run(validate(&sample_package_json()).unwrap()).await.unwrap();
        state.repo.update_run_status(&run.id, RunStatus::Running, None).await.unwrap();
        state.repo.update_run_status(&run.id, RunStatus::Succeeded, None).await.unwrap();
        let app = app_router(state);
        let resp = app
            .oneshot(
                axum::http::Request::post(format!("/runs/{}/cancel", run.id))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(resp).await, "already_terminal");
    }

    #[tokio::test]
    async fn start_preview_without_config_is_preview_disabled() {
        let state = test_state().await;
        let run = state.repo.create_run(validate(&sample_package_json()).unwrap()).await.unwrap();
        let app = app_router(state);
        let resp = app
            .oneshot(
                axum::http::Request::post(format!("/runs/{}/preview/start", run.id))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(resp).await, "preview_disabled");
    }
}
