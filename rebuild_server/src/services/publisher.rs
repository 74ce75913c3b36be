//! Outgoing state-change notifications.
//!
//! Publishing is best effort: a failed publish is logged and never rolls
//! back the state change it describes.

use async_trait::async_trait;

use crate::events::notification::StateChange;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, change: &StateChange);
}

/// Logs every change at debug level. Used when no endpoint is configured.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, change: &StateChange) {
        match change {
            StateChange::Event(event) => tracing::debug!(
                topic = change.topic(),
                event_id = event.id,
                state = %event.state,
                "State change"
            ),
            StateChange::Build(build) => tracing::debug!(
                topic = change.topic(),
                build_id = build.id,
                event_id = build.event_id,
                state = %build.state,
                "State change"
            ),
        }
    }
}

/// Posts each change as JSON to a messaging endpoint.
pub struct HttpPublisher {
    client: reqwest::Client,
    url: String,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, change: &StateChange) {
        let result = self
            .client
            .post(&self.url)
            .header("User-Agent", "centrix-rebuild")
            .header("x-rebuild-topic", change.topic())
            .json(change)
            .send()
            .await;

        match result {
            Ok(resp) if !resp.status().is_success() => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(topic = change.topic(), "Publish failed: {} {}", status, text);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(topic = change.topic(), "Publish failed: {}", e),
        }
    }
}
