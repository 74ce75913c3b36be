//! REST API: manual trigger, cancellation and the read model.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RebuildError;
use crate::models::build::ArtifactBuild;
use crate::models::event::{Event, EventFilter};
use crate::models::tree::EventTree;
use crate::services::dispatcher::ManualRequest;
use crate::services::executor::Delivery;
use crate::services::Services;
use crate::store::Stats;

/// Response to a manual trigger: the event as recorded, before any handler
/// has run.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub event: Event,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    pub reason: Option<String>,
}

const DEFAULT_CANCEL_REASON: &str = "Canceled on request.";

/// Map a service error to an HTTP status, logging server-side failures.
pub fn status_of(e: &RebuildError) -> StatusCode {
    match e {
        RebuildError::NotFound { .. } => StatusCode::NOT_FOUND,
        RebuildError::InvalidTransition { .. } | RebuildError::Contention { .. } => {
            StatusCode::CONFLICT
        }
        RebuildError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        RebuildError::Store(inner) => {
            tracing::error!("Store error: {inner}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Record the manual event and queue its message for the bus consumer.
pub async fn trigger(
    services: &Services,
    bus: &mpsc::Sender<Delivery>,
    req: ManualRequest,
) -> Result<TriggerResponse, RebuildError> {
    let (event, message) = services.dispatcher.accept_manual(req).await?;
    bus.send(Delivery::new(message))
        .await
        .map_err(|_| RebuildError::Shutdown)?;
    Ok(TriggerResponse { event })
}

pub async fn list_events(services: &Services, filter: &EventFilter) -> Result<Vec<Event>, RebuildError> {
    let filter = EventFilter {
        limit: Some(filter.limit.unwrap_or(50).clamp(1, 500)),
        ..filter.clone()
    };
    services.events.find(&filter).await
}

pub async fn event_tree(services: &Services, event_id: i64) -> Result<EventTree, RebuildError> {
    services
        .events
        .tree(event_id)
        .await?
        .ok_or(RebuildError::NotFound {
            entity: "event",
            id: event_id,
        })
}

pub async fn cancel(
    services: &Services,
    event_id: i64,
    query: CancelQuery,
) -> Result<Event, RebuildError> {
    let reason = query
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
    tracing::info!(event_id, reason = %reason, "Cancel requested");
    services.scheduler.cancel_event(event_id, &reason).await
}

pub async fn get_build(services: &Services, build_id: i64) -> Result<ArtifactBuild, RebuildError> {
    services
        .events
        .get_build(build_id)
        .await?
        .ok_or(RebuildError::NotFound {
            entity: "build",
            id: build_id,
        })
}

pub async fn stats(services: &Services) -> Result<Stats, RebuildError> {
    Ok(services.events.store().stats().await?)
}
