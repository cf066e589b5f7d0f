//! The REST surface: an `axum::Router` over the shared `Runtime`, plus the
//! periodic background tick task. Grounded on the teacher's
//! `examples/scheduler/src/{web.rs,main.rs,scheduler.rs}` bootstrap idiom —
//! one shared handle, a spawned loop task, typed `ApiError` responses.

use crate::error::RuntimeError;
use crate::model::{Entry, Group, GroupDeleteMode};
use crate::runtime::Runtime;
use crate::schema::Catalog;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/contexts", get(list_contexts).post(create_context))
        .route("/api/contexts/search", get(search_contexts))
        .route(
            "/api/contexts/{id}",
            get(get_context).put(update_context).delete(delete_context),
        )
        .route("/api/schema", get(get_schema).put(put_schema))
        .route("/api/awareness", get(get_awareness))
        .route("/api/analyze", post(analyze))
        .route("/api/pending-actions", get(list_pending_actions))
        .route("/api/pending-actions/bulk", post(bulk_pending_actions))
        .route("/api/pending-actions/{id}/approve", post(approve_pending_action))
        .route("/api/pending-actions/{id}/dismiss", post(dismiss_pending_action))
        .route("/api/bubbles", get(list_bubbles).post(create_bubble))
        .route(
            "/api/bubbles/{id}",
            get(get_bubble).put(update_bubble).delete(delete_bubble),
        )
        .route("/api/bubbles/{id}/contexts", get(bubble_contexts))
        .with_state(runtime)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Spawns the periodic improver tick, returning a handle the caller can
/// abort on shutdown. Mirrors the scheduler example's `sleep`-then-run loop,
/// generalized to run the improver instead of a task queue drain.
pub fn spawn_ticker(runtime: Arc<Runtime>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !runtime.config.tick_enabled {
            return;
        }
        let interval = Duration::from_millis(runtime.config.tick_interval_ms);
        loop {
            sleep(interval).await;
            info!("running scheduled improvement tick");
            let report = runtime.tick().await;
            info!(
                "tick finished: {} kinds auto-executed, {} enqueued, {} skipped",
                report.auto_executed.len(),
                report.enqueued,
                report.skipped_protected
            );
        }
    })
}

/// Waits for SIGINT or SIGTERM, then aborts the ticker, allowing up to a
/// 5-second drain before returning.
pub async fn shutdown_signal(ticker: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight tick (up to 5s)");
    ticker.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), ticker).await;
}

// ---- handlers: health -------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store_path: String,
    awareness_path: String,
    lm_host: String,
}

async fn health(State(state): State<Arc<Runtime>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store_path: state.config.store_path.display().to_string(),
        awareness_path: state.config.awareness_path.display().to_string(),
        lm_host: state.config.lm_host.clone(),
    })
}

// ---- handlers: contexts -------------------------------------------------

#[derive(Deserialize)]
struct ListContextsQuery {
    tag: Option<String>,
}

async fn list_contexts(
    State(state): State<Arc<Runtime>>,
    Query(q): Query<ListContextsQuery>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(state.list_contexts(q.tag.as_deref())?))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search_contexts(
    State(state): State<Arc<Runtime>>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(state.search_context(&q.q)?))
}

#[derive(Deserialize)]
struct CreateContextRequest {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default, rename = "bubbleId")]
    bubble_id: Option<String>,
}

fn default_source() -> String {
    "rest".to_string()
}

async fn create_context(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<CreateContextRequest>,
) -> Result<(StatusCode, Json<Entry>), ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let entry = state.save_context(req.content, req.tags, req.source, req.bubble_id)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_context(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<Json<Entry>, ApiError> {
    let entry = state
        .get_context(&id)?
        .ok_or_else(|| ApiError::not_found(format!("no entry with id {id}")))?;
    Ok(Json(entry))
}

#[derive(Deserialize)]
struct UpdateContextRequest {
    content: Option<String>,
    tags: Option<Vec<String>>,
}

async fn update_context(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateContextRequest>,
) -> Result<Json<Entry>, ApiError> {
    Ok(Json(state.update_context(&id, req.content, req.tags)?))
}

async fn delete_context(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.delete_context(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- handlers: schema ---------------------------------------------------

async fn get_schema(State(state): State<Arc<Runtime>>) -> Json<Option<Catalog>> {
    Json(state.get_catalog())
}

async fn put_schema(
    State(state): State<Arc<Runtime>>,
    Json(catalog): Json<Catalog>,
) -> Result<StatusCode, ApiError> {
    state.put_catalog(catalog)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- handlers: awareness / analyze --------------------------------------

async fn get_awareness(State(state): State<Arc<Runtime>>) -> Result<impl IntoResponse, ApiError> {
    let model = state.introspect(false).await?;
    Ok(Json(model))
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    action: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    source: &'static str,
    result: serde_json::Value,
}

async fn analyze(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let source = if state.analyzer.is_lm_enabled() { "lm" } else { "deterministic" };
    let result = match req.action.as_str() {
        "contradictions" => serde_json::to_value(state.analyze_contradictions().await?)
            .map_err(RuntimeError::Serde)?,
        "suggest_schema" => serde_json::to_value(state.suggest_schema().await?)
            .map_err(RuntimeError::Serde)?,
        "summarize" => {
            let focus = req.params.get("focus").and_then(|v| v.as_str());
            serde_json::to_value(state.summarize_context(focus).await?).map_err(RuntimeError::Serde)?
        }
        "deep_introspect" => serde_json::to_value(state.introspect(true).await?).map_err(RuntimeError::Serde)?,
        other => return Err(ApiError::bad_request(format!("unknown analyze action: {other}"))),
    };
    Ok(Json(AnalyzeResponse { source, result }))
}

// ---- handlers: pending actions -------------------------------------------

async fn list_pending_actions(
    State(state): State<Arc<Runtime>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.review_pending_actions()?))
}

async fn approve_pending_action(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let action = state.approve_action(&id)?;
    Ok(Json(serde_json::json!({"executed": action.is_some(), "action": action})))
}

#[derive(Deserialize, Default)]
struct DismissRequest {
    reason: Option<String>,
}

async fn dismiss_pending_action(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
    body: Option<Json<DismissRequest>>,
) -> Result<StatusCode, ApiError> {
    let reason = body.and_then(|Json(r)| r.reason);
    let dismissed = state.dismiss_action(&id, reason)?;
    if !dismissed {
        return Err(ApiError::not_found(format!("no pending action with id {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct BulkPendingRequest {
    action_ids: Vec<String>,
    decision: BulkDecision,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum BulkDecision {
    Approve,
    Dismiss,
}

#[derive(Serialize)]
struct BulkResultItem {
    id: String,
    ok: bool,
}

async fn bulk_pending_actions(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<BulkPendingRequest>,
) -> Result<Json<Vec<BulkResultItem>>, ApiError> {
    let mut results = Vec::with_capacity(req.action_ids.len());
    for id in req.action_ids {
        let ok = match req.decision {
            BulkDecision::Approve => state.approve_action(&id)?.is_some(),
            BulkDecision::Dismiss => state.dismiss_action(&id, None)?,
        };
        results.push(BulkResultItem { id, ok });
    }
    Ok(Json(results))
}

// ---- handlers: bubbles (groups) ------------------------------------------

#[derive(Deserialize)]
struct CreateBubbleRequest {
    name: String,
    description: Option<String>,
}

async fn list_bubbles(State(state): State<Arc<Runtime>>) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(state.list_groups()?))
}

async fn create_bubble(
    State(state): State<Arc<Runtime>>,
    Json(req): Json<CreateBubbleRequest>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let group = state.create_group(req.name, req.description)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_bubble(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<Json<Group>, ApiError> {
    let group = state
        .list_groups()?
        .into_iter()
        .find(|g| g.id == id)
        .ok_or_else(|| ApiError::not_found(format!("no bubble with id {id}")))?;
    Ok(Json(group))
}

#[derive(Deserialize)]
struct UpdateBubbleRequest {
    name: Option<String>,
    description: Option<String>,
}

async fn update_bubble(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateBubbleRequest>,
) -> Result<Json<Group>, ApiError> {
    Ok(Json(state.update_group(&id, req.name, req.description)?))
}

#[derive(Deserialize, Default)]
struct DeleteBubbleQuery {
    #[serde(default)]
    cascade: bool,
}

async fn delete_bubble(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
    Query(q): Query<DeleteBubbleQuery>,
) -> Result<StatusCode, ApiError> {
    let mode = if q.cascade { GroupDeleteMode::Cascade } else { GroupDeleteMode::Orphan };
    state.delete_group(&id, mode)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bubble_contexts(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(state.contexts_in_group(&id)?))
}

// ---- error mapping -------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::InvalidArgument(_) | RuntimeError::MalformedStore(_) => {
                StatusCode::BAD_REQUEST
            }
            RuntimeError::Io(_) | RuntimeError::Serde(_) | RuntimeError::LmUnavailable(_) | RuntimeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {err}");
        }
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.message, "status": self.status.as_u16()})),
        )
            .into_response()
    }
}
