//! Route definitions and router setup
//!
//! Dashboard API: read endpoints over the dashboard state, two trigger
//! endpoints that delegate to the pipeline, and a server-sent event stream.

use crate::bindings::BindingsOutcome;
use crate::dashboard::{DashboardState, DashboardStats};
use crate::error::{ApiResult, AppError};
use crate::introspection::SchemaSnapshot;
use crate::notify::{Notification, HISTORY_CAP};
use crate::pipeline::{CycleReport, CycleTrigger};
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    http::{header, Method},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::{debug, info, warn, Level};

/// Create the dashboard router with all routes and middleware
pub fn create_router(state: SharedState) -> Router {
    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(build_cors_layer())
        .propagate_x_request_id();

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Read model
        .route("/api/status", get(get_status))
        .route("/api/schema", get(get_schema))
        .route("/api/notifications", get(list_notifications))
        .route("/api/stats", get(get_stats))
        // Triggers
        .route("/api/trigger-check", post(trigger_check))
        .route("/api/regenerate-bindings", post(regenerate_bindings))
        // Push
        .route("/api/events", get(events))
        .layer(middleware)
        .with_state(state)
}

/// The dashboard is served locally; any origin may read it.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}

// ==================== Request/Response Types ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub state: DashboardState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub success: bool,
    pub schema: SchemaSnapshot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationListResponse {
    pub success: bool,
    pub notifications: Vec<Notification>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub success: bool,
    pub stats: DashboardStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    pub report: CycleReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateResponse {
    pub success: bool,
    pub message: String,
    pub bindings: BindingsOutcome,
}

// ==================== Handlers ====================

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Dashboard is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<StatusResponse>> {
    let dashboard = state.hub.read_state().await?;
    Ok(Json(StatusResponse {
        success: true,
        state: dashboard,
    }))
}

async fn get_schema(State(state): State<SharedState>) -> ApiResult<Json<SchemaResponse>> {
    let schema = state
        .pipeline()
        .backups()
        .current()
        .await?
        .ok_or_else(|| AppError::NotFound("No schema snapshot has been captured yet".to_string()))?;
    Ok(Json(SchemaResponse {
        success: true,
        schema,
    }))
}

async fn list_notifications(
    State(state): State<SharedState>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<NotificationListResponse>> {
    let limit = query.limit.unwrap_or(50).min(HISTORY_CAP);
    let history = state.pipeline().notifier().history().summary(limit).await?;
    Ok(Json(NotificationListResponse {
        success: true,
        notifications: history.recent,
        total: history.total,
    }))
}

async fn get_stats(State(state): State<SharedState>) -> ApiResult<Json<StatsResponse>> {
    let dashboard = state.hub.read_state().await?;
    Ok(Json(StatsResponse {
        success: true,
        stats: dashboard.stats,
    }))
}

/// Run one detection cycle now. 409 while another cycle is in flight.
async fn trigger_check(State(state): State<SharedState>) -> ApiResult<Json<TriggerResponse>> {
    info!("👆 Manual check requested from dashboard");
    let report = state.pipeline().run_cycle(CycleTrigger::Manual).await?;
    if let Err(e) = state.hub.refresh().await {
        warn!("Dashboard refresh after manual check failed: {}", e);
    }
    Ok(Json(TriggerResponse {
        success: true,
        message: report.message(),
        report,
    }))
}

async fn regenerate_bindings(
    State(state): State<SharedState>,
) -> ApiResult<Json<RegenerateResponse>> {
    info!("👆 Binding regeneration requested from dashboard");
    let bindings = state.pipeline().regenerate_bindings().await?;
    if let Err(e) = state.hub.refresh().await {
        warn!("Dashboard refresh after regeneration failed: {}", e);
    }
    Ok(Json(RegenerateResponse {
        success: true,
        message: format!("Regenerated {}", bindings.path.display()),
        bindings,
    }))
}

/// Server-sent events: one `state` event with the full state, then an
/// `update` event per published change.
async fn events(
    State(state): State<SharedState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (receiver, guard) = state.hub.subscribe();
    let initial = state.hub.read_state().await?;
    let first = Event::default()
        .event("state")
        .json_data(&initial)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let updates = BroadcastStream::new(receiver).filter_map(move |update| {
        // Subscriber stays counted until the stream is dropped.
        let _held = &guard;
        match update {
            Ok(next) => match Event::default().event("update").json_data(&next) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Failed to encode dashboard update: {}", e);
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!("Dashboard subscriber lagged, skipped {} update(s)", skipped);
                None
            }
        }
    });

    let stream = tokio_stream::once(first)
        .chain(updates)
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
