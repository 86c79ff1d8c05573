//! HTTP API server for assistd.
//!
//! Serves the Assistants-shaped run endpoints under `/v1`, plus the few
//! assistant/thread endpoints needed to create runs against.

use std::net::SocketAddr;
use std::sync::Arc;

use assist_core::{Id, ListParams};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::controller::{
    ControllerError, CreateAssistantParams, CreateRunParams, CreateThreadAndRunParams,
    CreateThreadParams, ModifyRunParams, RunController, SubmitToolOutputsParams,
};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub controller: RunController,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/assistants", post(create_assistant))
        .route("/assistants/{assistant_id}", get(get_assistant))
        .route("/threads", post(create_thread))
        .route("/threads/runs", post(create_thread_and_run))
        .route("/threads/{thread_id}", get(get_thread))
        .route("/threads/{thread_id}/runs", post(create_run).get(list_runs))
        .route(
            "/threads/{thread_id}/runs/{run_id}",
            get(get_run).post(modify_run),
        )
        .route(
            "/threads/{thread_id}/runs/{run_id}/submit_tool_outputs",
            post(submit_tool_outputs),
        )
        .route("/threads/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .route("/threads/{thread_id}/runs/{run_id}/steps", get(list_steps))
        .route(
            "/threads/{thread_id}/runs/{run_id}/steps/{step_id}",
            get(get_step),
        );

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    bind_address: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr: SocketAddr = format!("{bind_address}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(error_body(
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "invalid auth token",
            )),
            None => Err(error_body(
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "missing auth token",
            )),
        }
    } else {
        Ok(())
    }
}

// --- Error responses ---

/// Error response body: `{"error": {"message", "type"}}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

fn error_body(status: StatusCode, kind: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                message: message.into(),
                kind,
            },
        }),
    )
}

/// Map a controller error onto a status code and body, logging it.
fn api_error(err: ControllerError) -> ApiError {
    let message = err.to_string();
    match err {
        ControllerError::NotFound { .. } => {
            warn!("{message}");
            error_body(StatusCode::NOT_FOUND, "not_found", message)
        }
        ControllerError::InvalidState { .. } => {
            warn!("{message}");
            error_body(StatusCode::BAD_REQUEST, "invalid_state", message)
        }
        ControllerError::InvalidInput(_) => {
            warn!("{message}");
            error_body(StatusCode::BAD_REQUEST, "invalid_request", message)
        }
        ControllerError::Internal(_) | ControllerError::Storage(_) | ControllerError::Queue(_) => {
            error!("request failed: {message}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        warn!("rejected request body: {}", rejection.body_text());
        error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
    })
}

fn list_query(query: Result<Query<ListParams>, QueryRejection>) -> ApiResult<ListParams> {
    query.map(|Query(params)| params).map_err(|rejection| {
        error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
    })
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /v1/assistants
async fn create_assistant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateAssistantParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let assistant = state
        .controller
        .create_assistant(params)
        .await
        .map_err(api_error)?;
    Ok(Json(assistant))
}

/// GET /v1/assistants/{assistant_id}
async fn get_assistant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(assistant_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let assistant = state
        .controller
        .get_assistant(&Id::from_string(assistant_id))
        .await
        .map_err(api_error)?;
    Ok(Json(assistant))
}

/// POST /v1/threads
async fn create_thread(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateThreadParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let thread = state
        .controller
        .create_thread(params)
        .await
        .map_err(api_error)?;
    Ok(Json(thread))
}

/// GET /v1/threads/{thread_id}
async fn get_thread(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let thread = state
        .controller
        .get_thread(&Id::from_string(thread_id))
        .await
        .map_err(api_error)?;
    Ok(Json(thread))
}

/// POST /v1/threads/{thread_id}/runs
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    payload: Result<Json<CreateRunParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let run = state
        .controller
        .create_run(&Id::from_string(thread_id), params)
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// POST /v1/threads/runs
async fn create_thread_and_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateThreadAndRunParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let run = state
        .controller
        .create_thread_and_run(params)
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// GET /v1/threads/{thread_id}/runs
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = list_query(query)?;

    let page = state
        .controller
        .list_runs(&Id::from_string(thread_id), &params)
        .await
        .map_err(api_error)?;
    Ok(Json(page))
}

/// GET /v1/threads/{thread_id}/runs/{run_id}
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let run = state
        .controller
        .get_run(&Id::from_string(thread_id), &Id::from_string(run_id))
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// POST /v1/threads/{thread_id}/runs/{run_id}
async fn modify_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
    payload: Result<Json<ModifyRunParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let run = state
        .controller
        .modify_run(&Id::from_string(thread_id), &Id::from_string(run_id), params)
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// POST /v1/threads/{thread_id}/runs/{run_id}/submit_tool_outputs
async fn submit_tool_outputs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
    payload: Result<Json<SubmitToolOutputsParams>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = body(payload)?;

    let receipt = state
        .controller
        .submit_tool_outputs(
            &Id::from_string(thread_id),
            &Id::from_string(run_id),
            &params.tool_outputs,
        )
        .await
        .map_err(api_error)?;
    Ok(Json(receipt))
}

/// POST /v1/threads/{thread_id}/runs/{run_id}/cancel
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let run = state
        .controller
        .cancel_run(&Id::from_string(thread_id), &Id::from_string(run_id))
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// GET /v1/threads/{thread_id}/runs/{run_id}/steps
async fn list_steps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let params = list_query(query)?;

    let page = state
        .controller
        .list_steps(&Id::from_string(thread_id), &Id::from_string(run_id), &params)
        .await
        .map_err(api_error)?;
    Ok(Json(page))
}

/// GET /v1/threads/{thread_id}/runs/{run_id}/steps/{step_id}
async fn get_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((thread_id, run_id, step_id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let step = state
        .controller
        .get_step(
            &Id::from_string(thread_id),
            &Id::from_string(run_id),
            &Id::from_string(step_id),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(step))
}
