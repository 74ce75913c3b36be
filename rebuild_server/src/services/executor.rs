//! Background control loops.
//!
//! - the bus loop hands each inbound message to the dispatcher on its own
//!   task, re-enqueues follow-ups and redrives transient failures;
//! - the notification loop feeds task-state reports to the aggregator;
//! - the sweeper fails builds stuck in BUILD past the timeout horizon.
//!
//! The loops share nothing but the store; channels only carry work in.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::RebuildConfig;
use crate::events::notification::TaskNotification;
use crate::events::InboundMessage;
use crate::services::aggregator::Aggregator;
use crate::services::dispatcher::Dispatcher;

/// One delivery attempt of a bus message. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: InboundMessage,
    pub attempt: u32,
}

impl Delivery {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            message,
            attempt: 1,
        }
    }
}

/// Run the bus consumer forever. Spawned as a background tokio task.
pub async fn run_bus_consumer(
    dispatcher: Dispatcher,
    config: Arc<RebuildConfig>,
    tx: mpsc::Sender<Delivery>,
    mut rx: mpsc::Receiver<Delivery>,
) {
    tracing::info!(
        max_redeliveries = config.max_redeliveries,
        "Bus consumer started"
    );
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    while let Some(delivery) = rx.recv().await {
        let msg_id = delivery.message.msg_id.clone();
        let fresh = in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_id.clone());
        if !fresh {
            tracing::debug!(message_id = %msg_id, "Message already being processed, dropping duplicate");
            continue;
        }

        let dispatcher = dispatcher.clone();
        let config = config.clone();
        let tx = tx.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let redeliver = match dispatcher.dispatch(&delivery.message).await {
                Ok(report) => {
                    for follow_up in report.follow_ups {
                        if tx.send(Delivery::new(follow_up)).await.is_err() {
                            tracing::warn!("Bus channel closed, dropping follow-up");
                        }
                    }
                    report.retryable.then_some(report.event.id)
                }
                Err(e) => {
                    tracing::error!(message_id = %msg_id, "Dispatch error: {e}");
                    None
                }
            };

            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&msg_id);

            let Some(event_id) = redeliver else {
                return;
            };
            if delivery.attempt > config.max_redeliveries {
                if let Err(e) = dispatcher.give_up(event_id, delivery.attempt).await {
                    tracing::error!(event_id, "Failed to give up on event: {e}");
                }
                return;
            }

            tokio::time::sleep(config.redelivery_delay).await;
            tracing::info!(
                event_id,
                message_id = %msg_id,
                attempt = delivery.attempt + 1,
                "Redelivering message"
            );
            let next = Delivery {
                message: delivery.message,
                attempt: delivery.attempt + 1,
            };
            if tx.send(next).await.is_err() {
                tracing::warn!(event_id, "Bus channel closed, dropping redelivery");
            }
        });
    }
    tracing::info!("Bus consumer stopped");
}

/// Run the task-notification consumer until every sender is dropped.
pub async fn run_notification_consumer(
    aggregator: Aggregator,
    mut rx: mpsc::Receiver<TaskNotification>,
) {
    tracing::info!("Notification consumer started");
    while let Some(notification) = rx.recv().await {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            if let Err(e) = aggregator.apply(&notification).await {
                tracing::error!(task_id = %notification.task_id, "Notification error: {e}");
            }
        });
    }
    tracing::info!("Notification consumer stopped");
}

/// Run the timeout sweeper forever. Spawned as a background tokio task.
pub async fn run_timeout_sweeper(aggregator: Aggregator, config: Arc<RebuildConfig>) {
    tracing::info!(
        timeout_secs = config.build_timeout.as_secs(),
        interval_secs = config.sweep_interval.as_secs(),
        "Timeout sweeper started"
    );

    loop {
        tokio::time::sleep(config.sweep_interval).await;
        match aggregator.sweep_timeouts(chrono::Utc::now()).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(builds = n, "Failed timed-out builds"),
            Err(e) => tracing::error!("Timeout sweep error: {e}"),
        }
    }
}
