//! Dispatcher: turns an inbound message into an event and runs the handlers
//! that can process it.
//!
//! Every matching handler runs, in declared order, and each outcome is
//! recorded against the event. One handler failing never stops the others.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RebuildConfig;
use crate::error::RebuildError;
use crate::events::{EventPayload, InboundMessage};
use crate::handlers::{HandlerContext, HandlerOutcome, HandlerRegistry};
use crate::models::artifact::ArtifactRef;
use crate::models::event::{Event, EventState, HandlerOutcomeKind, HandlerResult, NewEvent};
use crate::services::scheduler::Scheduler;

/// What happened to one inbound message.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event: Event,
    pub created: bool,
    pub results: Vec<HandlerResult>,
    /// Messages produced by handlers, to be dispatched in turn.
    pub follow_ups: Vec<InboundMessage>,
    /// A handler failed transiently and nothing was planned; the message
    /// should be redelivered.
    pub retryable: bool,
}

/// Manual-trigger request: an explicit artifact list or a search key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualRequest {
    #[serde(default)]
    pub search_key: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub requester: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    ctx: HandlerContext,
    scheduler: Scheduler,
    config: Arc<RebuildConfig>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        ctx: HandlerContext,
        scheduler: Scheduler,
        config: Arc<RebuildConfig>,
    ) -> Self {
        Self {
            registry,
            ctx,
            scheduler,
            config,
        }
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Result<DispatchReport, RebuildError> {
        let events = &self.ctx.events;
        let event_type = message.event.event_type();
        crate::metrics::message_received(event_type.as_str());

        let (event, created) = events.create(self.new_event(message)).await?;

        let mut report = DispatchReport {
            event,
            created,
            results: Vec::new(),
            follow_ups: Vec::new(),
            retryable: false,
        };

        if !created {
            if report.event.state != EventState::Initialized {
                tracing::info!(
                    event_id = report.event.id,
                    message_id = %message.msg_id,
                    state = %report.event.state,
                    "Message already processed, ignoring redelivery"
                );
                return Ok(report);
            }
            // Planned before a crash but never started.
            if !events.builds(report.event.id).await?.is_empty() {
                report.event = self.scheduler.start_event(report.event.id).await?;
                return Ok(report);
            }
        }

        let event_id = report.event.id;
        let handlers = self.registry.matching(&message.event);
        if handlers.is_empty() {
            report.event = events
                .transition(
                    event_id,
                    EventState::Skipped,
                    format!("No handler is able to process {event_type} events."),
                )
                .await?;
            return Ok(report);
        }

        let mut planned = 0usize;
        let mut declined: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut transient: Option<String> = None;

        for handler in handlers {
            let name = handler.name();
            let result = match handler.handle(&self.ctx, &report.event, &message.event).await {
                Ok(HandlerOutcome::Planned { builds, detail }) => {
                    planned += builds.len();
                    HandlerResult::new(name, HandlerOutcomeKind::Planned, detail)
                }
                Ok(HandlerOutcome::Forwarded { follow_ups, detail }) => {
                    report.follow_ups.extend(follow_ups);
                    declined.push(detail.clone());
                    HandlerResult::new(name, HandlerOutcomeKind::Forwarded, detail)
                }
                Ok(HandlerOutcome::Declined(detail)) => {
                    declined.push(detail.clone());
                    HandlerResult::new(name, HandlerOutcomeKind::Declined, detail)
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(event_id, handler = name, "Handler failed transiently: {e}");
                    transient = Some(e.to_string());
                    HandlerResult::new(name, HandlerOutcomeKind::Retryable, e.to_string())
                }
                Err(e) => {
                    tracing::error!(event_id, handler = name, "Handler failed: {e}");
                    failures.push(format!("{name}: {e}"));
                    HandlerResult::new(name, HandlerOutcomeKind::Failed, e.to_string())
                }
            };
            events.record_handler_result(event_id, result.clone()).await?;
            report.results.push(result);
        }

        report.event = if planned > 0 {
            self.scheduler.start_event(event_id).await?
        } else if let Some(error) = transient {
            report.retryable = true;
            events
                .transition(
                    event_id,
                    EventState::Initialized,
                    format!("Waiting for redelivery after: {error}"),
                )
                .await?
        } else if !failures.is_empty() {
            events
                .transition(event_id, EventState::Failed, failures.join(" "))
                .await?
        } else {
            events
                .transition(event_id, EventState::Skipped, declined.join(" "))
                .await?
        };
        Ok(report)
    }

    /// Dispatch a message and, depth-first in arrival order, every follow-up
    /// it produces.
    pub async fn dispatch_all(
        &self,
        message: InboundMessage,
    ) -> Result<Vec<DispatchReport>, RebuildError> {
        let mut queue = VecDeque::from([message]);
        let mut reports = Vec::new();
        while let Some(next) = queue.pop_front() {
            let report = self.dispatch(&next).await?;
            queue.extend(report.follow_ups.iter().cloned());
            reports.push(report);
        }
        Ok(reports)
    }

    fn new_event(&self, message: &InboundMessage) -> NewEvent {
        NewEvent {
            message_id: message.msg_id.clone(),
            event_type: message.event.event_type(),
            search_key: message.event.search_key(),
            dry_run: message.dry_run || self.config.dry_run,
            requester: message.requester.clone(),
        }
    }

    /// Synthesize a bus message for a manual request and record its
    /// INITIALIZED event. The message still has to go through the bus queue;
    /// dispatching it picks the recorded event up by message id.
    pub async fn accept_manual(
        &self,
        request: ManualRequest,
    ) -> Result<(Event, InboundMessage), RebuildError> {
        let message = InboundMessage {
            msg_id: format!("manual-{}", uuid::Uuid::new_v4()),
            dry_run: request.dry_run,
            requester: request.requester,
            event: EventPayload::ManualRebuild {
                search_key: request.search_key,
                artifacts: request.artifacts,
            },
        };
        let (event, _) = self.ctx.events.create(self.new_event(&message)).await?;
        tracing::info!(
            event_id = event.id,
            message_id = %message.msg_id,
            "Manual rebuild requested"
        );
        Ok((event, message))
    }

    /// Stop redriving a message whose handlers kept failing transiently.
    pub async fn give_up(&self, event_id: i64, attempts: u32) -> Result<Event, RebuildError> {
        let event = self.ctx.events.require(event_id).await?;
        if event.state != EventState::Initialized {
            return Ok(event);
        }
        let reason = format!(
            "Gave up after {attempts} deliveries. {}",
            event.state_reason
        );
        self.ctx
            .events
            .transition(event_id, EventState::Failed, reason.trim_end())
            .await
    }
}
