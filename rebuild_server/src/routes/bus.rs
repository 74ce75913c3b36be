//! Bus ingress: signed change-event messages and build-system task
//! notifications. Both are validated, parsed and queued; processing happens
//! in the background loops.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::config::RebuildConfig;
use crate::events::notification::TaskNotification;
use crate::events::InboundMessage;
use crate::services::executor::Delivery;
use crate::services::signature::{validate_signature, SIGNATURE_HEADER};

/// Check the HMAC signature and decode the body.
fn verified<T: DeserializeOwned>(
    config: &RebuildConfig,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !validate_signature(&config.bus_secret, body, signature) {
        tracing::warn!("Bus message signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!("Malformed bus message: {e}");
        StatusCode::BAD_REQUEST
    })
}

pub async fn accept_message(
    config: &RebuildConfig,
    queue: &mpsc::Sender<Delivery>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let message: InboundMessage = verified(config, headers, &body)?;
    tracing::debug!(
        message_id = %message.msg_id,
        event_type = %message.event.event_type(),
        "Bus message accepted"
    );
    queue.send(Delivery::new(message)).await.map_err(|_| {
        tracing::error!("Bus consumer is gone, rejecting message");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn accept_task_notification(
    config: &RebuildConfig,
    queue: &mpsc::Sender<TaskNotification>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let notification: TaskNotification = verified(config, headers, &body)?;
    tracing::debug!(
        task_id = %notification.task_id,
        outcome = ?notification.outcome,
        "Task notification accepted"
    );
    queue.send(notification).await.map_err(|_| {
        tracing::error!("Notification consumer is gone, rejecting notification");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(StatusCode::ACCEPTED)
}
