use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use courier_core::breaker::ServiceBreakers;
use courier_core::limiter::RateLimiter;
use courier_core::pipeline::Pipeline;
use courier_store::models::{EventKind, OutputFormat, Task, TaskEvent};

use crate::auth::{AuthError, AuthRegistry};
use crate::config::Settings;
use crate::rate_limit;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::EmailTaken => Self::conflict(err.to_string()),
            AuthError::BadCredentials | AuthError::Expired | AuthError::Invalid(_) => {
                Self::unauthorized(err.to_string())
            }
            AuthError::Disabled => Self::unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and request types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub auth: Arc<AuthRegistry>,
    pub breakers: ServiceBreakers,
    pub settings: Arc<Settings>,
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
    #[serde(default)]
    output_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AuthRequest {
    email: String,
    password: String,
}

fn parse_command(body: &CommandBody) -> Result<(String, OutputFormat), AppError> {
    let command = body.command.trim().to_string();
    if command.is_empty() || command.len() > 2000 {
        return Err(AppError::bad_request(
            "command must be between 1 and 2000 characters",
        ));
    }

    let format = match body.output_format.as_deref() {
        None => OutputFormat::Json,
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::bad_request(format!("unknown output format {raw:?}")))?,
    };

    Ok((command, format))
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .auth
        .optional_user(authorization)
        .map(|user| user.user_id)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = settings.cors_origin_list();
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let parsed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    let cors = cors_layer(&state.settings);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/sync", post(create_task_sync))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/result", get(get_task_result))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/events", get(stream_events))
        .route("/api/ws", get(ws_run_task))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit::rate_limit,
        ))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, limiter: Arc<RateLimiter>) -> Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", state.settings.app_host, state.settings.app_port).parse()?;
    let app = build_router(state, limiter);

    tracing::info!("courier serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    tracing::info!("courier serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "llm_configured": state.settings.has_llm_credentials(),
        "browser_configured": state.settings.has_browser_credentials(),
        "mode": if state.settings.has_llm_credentials() { "live" } else { "mock" },
        "store_backend": state.pipeline.store().backend_name(),
        "circuit_breakers": {
            "llm": state.breakers.llm.stats(),
            "browser": state.breakers.browser.stats(),
        },
    }))
}

/// Accept a command and run the pipeline in the background.
async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let (command, format) = parse_command(&body)?;
    let owner = bearer_user(&state, &headers);

    let task = state.pipeline.submit(command, format, owner).await;
    let task_id = task.task_id.clone();

    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        pipeline.run(&task_id).await;
    });

    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// Accept a command and wait for the pipeline to finish.
async fn create_task_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<Json<Task>, AppError> {
    let (command, format) = parse_command(&body)?;
    let owner = bearer_user(&state, &headers);

    let task = state.pipeline.submit(command, format, owner).await;
    let finished = state
        .pipeline
        .run(&task.task_id)
        .await
        .ok_or_else(|| AppError::not_found("task vanished during execution"))?;
    Ok(Json(finished))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<Task>> {
    let limit = params.limit.unwrap_or(50);
    Json(state.pipeline.store().list_recent(limit).await)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .pipeline
        .store()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("task not found"))?;
    Ok(Json(task))
}

async fn get_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = state
        .pipeline
        .store()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("task not found"))?;

    if !task.status.is_terminal() {
        return Err(AppError::conflict(format!("task is still {}", task.status)));
    }

    Ok(Json(serde_json::json!({
        "task_id": task.task_id,
        "output": task.output,
        "format": task.output_format,
    })))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .pipeline
        .store()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("task not found"))?;
    if task.status.is_terminal() {
        return Err(AppError::conflict(format!("task already {}", task.status)));
    }

    state.pipeline.cancel(&id).await;
    let current = state
        .pipeline
        .store()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("task not found"))?;
    Ok(Json(current))
}

// ---------------------------------------------------------------------------
// Event streaming
// ---------------------------------------------------------------------------

fn ndjson_line(event: &TaskEvent) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}

/// Newline-delimited JSON event stream, ending after `task_done`.
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = state
        .pipeline
        .store()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("task not found"))?;

    // A late subscriber to a finished task gets a single synthesized
    // terminal event instead of hanging forever.
    if task.status.is_terminal() {
        let done = TaskEvent::new(
            &task.task_id,
            EventKind::TaskDone,
            serde_json::json!({
                "status": task.status,
                "error": task.error,
                "cost_usd": task.cost_usd,
                "duration_ms": task.duration_ms,
            }),
        );
        return Ok((
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            ndjson_line(&done),
        )
            .into_response());
    }

    let mut subscription = state.pipeline.broadcaster().subscribe(&id);
    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let done = event.kind == EventKind::TaskDone;
            yield Ok::<String, Infallible>(ndjson_line(&event));
            if done {
                break;
            }
        }
    };

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        axum::body::Body::from_stream(stream),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Command WebSocket
// ---------------------------------------------------------------------------

/// WebSocket flow: the client connects, sends one command JSON, then
/// receives every pipeline event as a text frame followed by the final
/// Task, after which the server closes.
async fn ws_run_task(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_command_socket(state, socket))
}

async fn handle_command_socket(state: AppState, mut socket: WebSocket) {
    let raw = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };

    let parsed: Result<CommandBody, _> = serde_json::from_str(raw.as_str());
    let (command, format) = match parsed.as_ref().map_err(|e| e.to_string()).and_then(|body| {
        parse_command(body).map_err(|e| e.message)
    }) {
        Ok(ok) => ok,
        Err(message) => {
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({"error": message}).to_string().into(),
                ))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let task = state.pipeline.submit(command, format, None).await;
    let mut subscription = state.pipeline.broadcaster().subscribe(&task.task_id);

    let runner = {
        let pipeline = Arc::clone(&state.pipeline);
        let task_id = task.task_id.clone();
        tokio::spawn(async move { pipeline.run(&task_id).await })
    };

    while let Some(event) = subscription.recv().await {
        let done = event.kind == EventKind::TaskDone;
        let frame = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(frame.into())).await.is_err() {
            tracing::info!(task_id = %task.task_id, "websocket client disconnected");
            break;
        }
        if done {
            break;
        }
    }

    if let Ok(Some(finished)) = runner.await {
        let frame = serde_json::to_string(&finished).unwrap_or_else(|_| "{}".to_string());
        let _ = socket.send(Message::Text(frame.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(body): Json<AuthRequest>,
) -> Result<Json<crate::auth::TokenResponse>, AppError> {
    validate_auth_request(&body)?;
    let issued = state.auth.register(&body.email, &body.password)?;
    Ok(Json(issued))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<AuthRequest>,
) -> Result<Json<crate::auth::TokenResponse>, AppError> {
    validate_auth_request(&body)?;
    let issued = state.auth.login(&body.email, &body.password)?;
    Ok(Json(issued))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.auth.optional_user(authorization) {
        Some(user) => Json(serde_json::json!({
            "authenticated": true,
            "user_id": user.user_id,
            "email": user.email,
        })),
        None => Json(serde_json::json!({
            "authenticated": false,
            "message": if state.auth.enabled() {
                "missing or invalid token"
            } else {
                "auth not configured (jwt secret not set)"
            },
        })),
    }
}

fn validate_auth_request(body: &AuthRequest) -> Result<(), AppError> {
    if body.email.len() < 3 || body.email.len() > 255 {
        return Err(AppError::bad_request("email must be 3-255 characters"));
    }
    if body.password.len() < 8 || body.password.len() > 128 {
        return Err(AppError::bad_request("password must be 8-128 characters"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
