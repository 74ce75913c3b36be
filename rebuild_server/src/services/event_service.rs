//! Event and build state transitions.
//!
//! Every write to event or build state goes through here: transitions are
//! validated against the state machines, applied with compare-and-set, counted,
//! logged and published.

use std::sync::Arc;

use crate::error::RebuildError;
use crate::events::notification::StateChange;
use crate::models::build::{ArtifactBuild, BuildState, BuildTransition};
use crate::models::event::{Event, EventFilter, EventState, HandlerResult, NewEvent};
use crate::models::tree::EventTree;
use crate::services::publisher::Publisher;
use crate::store::Store;

/// Bound on compare-and-set retries against a single row.
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct EventService {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
}

impl EventService {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create an event, or return the one already recorded for the message id.
    pub async fn create(&self, new: NewEvent) -> Result<(Event, bool), RebuildError> {
        let (event, created) = self.store.create_event(new).await?;
        if created {
            crate::metrics::event_state_changed(event.state.as_str());
            tracing::info!(
                event_id = event.id,
                message_id = %event.message_id,
                event_type = %event.event_type,
                search_key = %event.search_key,
                dry_run = event.dry_run,
                "Event created"
            );
            self.publisher
                .publish(&StateChange::Event(event.clone()))
                .await;
        }
        Ok((event, created))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Event>, RebuildError> {
        Ok(self.store.get_event(id).await?)
    }

    pub async fn require(&self, id: i64) -> Result<Event, RebuildError> {
        self.get(id)
            .await?
            .ok_or(RebuildError::NotFound { entity: "event", id })
    }

    pub async fn find(&self, filter: &EventFilter) -> Result<Vec<Event>, RebuildError> {
        Ok(self.store.find_events(filter).await?)
    }

    pub async fn builds(&self, event_id: i64) -> Result<Vec<ArtifactBuild>, RebuildError> {
        Ok(self.store.builds_for_event(event_id).await?)
    }

    pub async fn get_build(&self, id: i64) -> Result<Option<ArtifactBuild>, RebuildError> {
        Ok(self.store.get_build(id).await?)
    }

    pub async fn tree(&self, id: i64) -> Result<Option<EventTree>, RebuildError> {
        let Some(event) = self.get(id).await? else {
            return Ok(None);
        };
        let builds = self.builds(id).await?;
        Ok(Some(EventTree::new(event, builds)))
    }

    /// Move an event forward. A terminal event is returned unchanged.
    pub async fn transition(
        &self,
        id: i64,
        state: EventState,
        reason: impl Into<String>,
    ) -> Result<Event, RebuildError> {
        let reason = reason.into();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.require(id).await?;
            if current.state.is_terminal() {
                tracing::debug!(
                    event_id = id,
                    state = %current.state,
                    requested = %state,
                    "Event already terminal, ignoring transition"
                );
                return Ok(current);
            }
            if !current.state.can_transition_to(state) {
                return Err(RebuildError::InvalidTransition {
                    entity: "event",
                    from: current.state.to_string(),
                    to: state.to_string(),
                });
            }

            let Some(updated) = self
                .store
                .update_event_state(id, current.state, state, &reason)
                .await?
            else {
                continue;
            };

            if updated.state != current.state {
                crate::metrics::event_state_changed(updated.state.as_str());
            }
            tracing::info!(
                event_id = id,
                from = %current.state,
                state = %updated.state,
                reason = %updated.state_reason,
                "Event state changed"
            );
            self.publisher
                .publish(&StateChange::Event(updated.clone()))
                .await;
            return Ok(updated);
        }
        Err(RebuildError::Contention { entity: "event", id })
    }

    /// Apply a build transition if the build is still in the state the caller
    /// observed. Returns `None` when another writer got there first.
    pub async fn transition_build(
        &self,
        build: &ArtifactBuild,
        transition: BuildTransition,
    ) -> Result<Option<ArtifactBuild>, RebuildError> {
        if !build.state.can_transition_to(transition.state) {
            return Err(RebuildError::InvalidTransition {
                entity: "build",
                from: build.state.to_string(),
                to: transition.state.to_string(),
            });
        }

        let Some(updated) = self
            .store
            .update_build(build.id, build.state, &transition)
            .await?
        else {
            tracing::debug!(
                build_id = build.id,
                expected = %build.state,
                requested = %transition.state,
                "Build changed concurrently, transition skipped"
            );
            return Ok(None);
        };

        if updated.state != build.state {
            crate::metrics::build_state_changed(updated.state.as_str());
        }
        tracing::info!(
            build_id = updated.id,
            event_id = updated.event_id,
            nvr = %updated.original_nvr,
            from = %build.state,
            state = %updated.state,
            task_id = updated.task_id.as_deref().unwrap_or(""),
            reason = %updated.state_reason,
            "Build state changed"
        );
        self.publisher
            .publish(&StateChange::Build(updated.clone()))
            .await;
        Ok(Some(updated))
    }

    pub async fn record_handler_result(
        &self,
        id: i64,
        result: HandlerResult,
    ) -> Result<(), RebuildError> {
        Ok(self.store.record_handler_result(id, result).await?)
    }

    /// Fold the states of an event's builds into the event state.
    ///
    /// Only BUILDING events are affected: COMPLETE once every build is
    /// terminal and at least one is DONE, FAILED when none is DONE, SKIPPED
    /// when the event owns no builds at all.
    pub async fn recompute_state(&self, id: i64) -> Result<Event, RebuildError> {
        let event = self.require(id).await?;
        if event.state != EventState::Building {
            return Ok(event);
        }

        let builds = self.builds(id).await?;
        match aggregate(&builds) {
            Some((state, reason)) => self.transition(id, state, reason).await,
            None => Ok(event),
        }
    }
}

/// Terminal state and reason for a set of builds, or `None` while any build
/// is still PLANNED or BUILD.
pub fn aggregate(builds: &[ArtifactBuild]) -> Option<(EventState, String)> {
    if builds.is_empty() {
        return Some((
            EventState::Skipped,
            "No artifacts need to be rebuilt.".to_string(),
        ));
    }
    if builds.iter().any(|b| !b.state.is_terminal()) {
        return None;
    }

    let total = builds.len();
    let done = builds
        .iter()
        .filter(|b| b.state == BuildState::Done)
        .count();
    let not_done = total - done;

    if done == 0 {
        Some((
            EventState::Failed,
            format!("All {total} artifact(s) failed to rebuild."),
        ))
    } else if not_done == 0 {
        Some((
            EventState::Complete,
            format!("All {total} artifact(s) have been rebuilt."),
        ))
    } else {
        Some((
            EventState::Complete,
            format!("{not_done} of {total} artifact(s) failed to rebuild."),
        ))
    }
}
