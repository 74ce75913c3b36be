//! Rebuild HTTP routes: bus ingress and the REST API.

pub mod api;
pub mod bus;

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::events::notification::TaskNotification;
use crate::models::build::ArtifactBuild;
use crate::models::event::{Event, EventFilter};
use crate::models::tree::EventTree;
use crate::services::dispatcher::ManualRequest;
use crate::services::executor::Delivery;
use crate::services::Services;
use crate::store::Stats;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct RebuildRouterState {
    pub services: Services,
    pub bus: mpsc::Sender<Delivery>,
    pub tasks: mpsc::Sender<TaskNotification>,
}

/// Build the rebuild service's Axum router.
pub fn rebuild_router(state: RebuildRouterState) -> Router {
    Router::new()
        // Bus ingress
        .route("/bus/messages", post(bus_message_handler))
        .route("/bus/tasks", post(task_notification_handler))
        // Events
        .route("/api/events", get(list_events).post(trigger_handler))
        .route("/api/events/{event_id}", get(get_event_tree))
        .route("/api/events/{event_id}/cancel", post(cancel_handler))
        // Builds
        .route("/api/builds/{build_id}", get(get_build))
        .route("/api/stats", get(get_stats))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
}

// ── Bus ──

async fn bus_message_handler(
    State(state): State<RebuildRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    bus::accept_message(&state.services.config, &state.bus, &headers, body).await
}

async fn task_notification_handler(
    State(state): State<RebuildRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    bus::accept_task_notification(&state.services.config, &state.tasks, &headers, body).await
}

// ── Events ──

async fn trigger_handler(
    State(state): State<RebuildRouterState>,
    Json(req): Json<ManualRequest>,
) -> Result<(StatusCode, Json<api::TriggerResponse>), StatusCode> {
    if req.artifacts.is_empty() && req.search_key.is_none() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    api::trigger(&state.services, &state.bus, req)
        .await
        .map(|r| (StatusCode::ACCEPTED, Json(r)))
        .map_err(|e| {
            tracing::error!("Manual trigger error: {e}");
            api::status_of(&e)
        })
}

async fn list_events(
    State(state): State<RebuildRouterState>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<Vec<Event>>, StatusCode> {
    api::list_events(&state.services, &filter)
        .await
        .map(Json)
        .map_err(|e| api::status_of(&e))
}

async fn get_event_tree(
    State(state): State<RebuildRouterState>,
    Path(event_id): Path<i64>,
) -> Result<Json<EventTree>, StatusCode> {
    api::event_tree(&state.services, event_id)
        .await
        .map(Json)
        .map_err(|e| api::status_of(&e))
}

async fn cancel_handler(
    State(state): State<RebuildRouterState>,
    Path(event_id): Path<i64>,
    Query(query): Query<api::CancelQuery>,
) -> Result<Json<Event>, StatusCode> {
    api::cancel(&state.services, event_id, query)
        .await
        .map(Json)
        .map_err(|e| api::status_of(&e))
}

// ── Builds ──

async fn get_build(
    State(state): State<RebuildRouterState>,
    Path(build_id): Path<i64>,
) -> Result<Json<ArtifactBuild>, StatusCode> {
    api::get_build(&state.services, build_id)
        .await
        .map(Json)
        .map_err(|e| api::status_of(&e))
}

async fn get_stats(State(state): State<RebuildRouterState>) -> Result<Json<Stats>, StatusCode> {
    api::stats(&state.services)
        .await
        .map(Json)
        .map_err(|e| api::status_of(&e))
}
