use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use agentdock_core::UploadError;
use agentdock_orchestrator::{AdmissionError, SubmitRequest};
use agentdock_types::{EngineEvent, ProviderCredentials, SessionCoordinates};

use crate::{AppState, SERVICE_NAME};

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let sweeper = tokio::spawn(crate::run_upload_sweeper(state.clone()));
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("agentdock server listening on {addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    sweeper.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Multipart framing needs room on top of the file itself.
    let upload_limit = state.files().max_bytes().saturating_add(64 * 1024);

    Router::new()
        .route("/", get(health))
        .route("/health/store", get(store_health))
        .route("/agent/skyvern", post(skyvern_disabled))
        .route("/agent/{provider}", post(submit_agent))
        .route(
            "/files",
            post(upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/global/event", get(events))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, detail: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "detail": detail.into(), "code": code })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let agents = state
        .providers()
        .list()
        .into_iter()
        .map(|info| info.id)
        .collect::<Vec<_>>();
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "agents": agents,
        "activeTasks": state.supervisor().active_count(),
        "queuedTasks": state.supervisor().waiting_count(),
    }))
}

async fn store_health(State(state): State<AppState>) -> Json<Value> {
    let url = state.store_url.clone();
    match state.store().health().await {
        Ok(health) => Json(json!({
            "status": "connected",
            "backend": health.backend,
            "url": url,
            "sessions_count": health.sessions_count,
        })),
        Err(err) => Json(json!({
            "status": "error",
            "url": url,
            "error": err.to_string(),
        })),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AgentRequestInput {
    session_id: Option<String>,
    /// Non-string values are treated as missing.
    instruction: Option<Value>,
    provider_model: Option<String>,
    #[serde(alias = "browser")]
    browser_session: Option<SessionCoordinates>,
    #[serde(default, alias = "credentials")]
    api_keys: ProviderCredentials,
    #[serde(default)]
    secrets: HashMap<String, String>,
    file_id: Option<String>,
    agent_id: Option<String>,
}

async fn submit_agent(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(input): Json<AgentRequestInput>,
) -> Response {
    let Some(session_id) = input
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "SESSION_ID_REQUIRED",
            "sessionId is required",
        );
    };
    let request = SubmitRequest {
        provider,
        session_id,
        instruction: input.instruction.and_then(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        }),
        provider_model: input.provider_model,
        browser_session: input.browser_session,
        credentials: input.api_keys,
        secrets: input.secrets,
        file_id: input.file_id,
        agent_id: input.agent_id,
    };
    match state.orchestrator.submit(request).await {
        Ok(admission) => Json(admission).into_response(),
        Err(err) => admission_error_response(&err),
    }
}

/// Kept so clients still targeting it get a clear answer instead of an
/// unknown-adapter error.
async fn skyvern_disabled() -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "PROVIDER_DISABLED",
        "Skyvern agent is currently disabled. Please use Browser-Use or Notte instead.",
    )
}

fn admission_error_response(err: &AdmissionError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    if status.is_server_error() {
        tracing::error!(code = err.error_code(), "admission failed: {err}");
    }
    error_response(status, err.error_code(), err.to_string())
}

async fn upload_file(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "UPLOAD_MALFORMED", err.to_string())
            }
        };
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "UPLOAD_MALFORMED", err.to_string())
            }
        };
        return match state.files().persist(&file_name, &bytes).await {
            Ok(file) => Json(file.receipt()).into_response(),
            Err(UploadError::Io(err)) => {
                tracing::error!("failed to persist upload: {err}");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "UPLOAD_STORAGE_FAILED",
                    "failed to store upload",
                )
            }
            Err(err) => error_response(StatusCode::BAD_REQUEST, "UPLOAD_REJECTED", err.to_string()),
        };
    }
    error_response(
        StatusCode::BAD_REQUEST,
        "UPLOAD_MISSING_FILE",
        "multipart field `file` is required",
    )
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EventFilterQuery {
    agent_id: Option<String>,
    session_id: Option<String>,
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let field_matches = |key: &str, wanted: &Option<String>| match wanted {
        Some(wanted) => event.properties.get(key).and_then(|v| v.as_str()) == Some(wanted.as_str()),
        None => true,
    };
    field_matches("agentId", &filter.agent_id) && field_matches("sessionId", &filter.session_id)
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.events().subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if event_matches_filter(&event, &filter) => Some(Ok(Event::default()
            .data(serde_json::to_string(&event).unwrap_or_default()))),
        _ => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}
