//! Persistence of events and builds.
//!
//! The store is the single source of truth shared by the bus loop, the
//! scheduler workers and the notification loop. State changes go through
//! compare-and-set updates keyed on the expected current state, so two
//! racing writers for the same row cannot both win.

pub mod memory;
pub mod migration;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::artifact::ArtifactType;
use crate::models::build::{ArtifactBuild, BuildState, BuildTransition, NewArtifactBuild};
use crate::models::event::{Event, EventFilter, EventState, HandlerResult, NewEvent};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Counts by state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub events: BTreeMap<String, i64>,
    pub builds: BTreeMap<String, i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Creates an INITIALIZED event, or returns the existing one carrying the
    /// same message id. The flag is `true` only when a new row was created.
    async fn create_event(&self, new: NewEvent) -> Result<(Event, bool), StoreError>;

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError>;

    /// Newest first.
    async fn find_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError>;

    /// Sets state and reason if the event is still in `expected`. Returns the
    /// updated event, or `None` if the state had moved on. `time_done` is
    /// stamped when the new state is terminal.
    async fn update_event_state(
        &self,
        id: i64,
        expected: EventState,
        state: EventState,
        reason: &str,
    ) -> Result<Option<Event>, StoreError>;

    async fn record_handler_result(
        &self,
        id: i64,
        result: HandlerResult,
    ) -> Result<(), StoreError>;

    async fn add_event_dependency(&self, event_id: i64, depends_on: i64)
        -> Result<(), StoreError>;

    /// Events that `event_id` waits for.
    async fn event_dependencies(&self, event_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Events waiting for `event_id`.
    async fn dependent_events(&self, event_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Inserts a planned forest in one transaction. `dep_on_index` entries
    /// must point at an earlier element of `builds`.
    async fn insert_builds(
        &self,
        event_id: i64,
        builds: Vec<NewArtifactBuild>,
    ) -> Result<Vec<ArtifactBuild>, StoreError>;

    async fn get_build(&self, id: i64) -> Result<Option<ArtifactBuild>, StoreError>;

    /// Ordered by id.
    async fn builds_for_event(&self, event_id: i64) -> Result<Vec<ArtifactBuild>, StoreError>;

    async fn children_of(&self, build_id: i64) -> Result<Vec<ArtifactBuild>, StoreError>;

    /// The newest build submitted to the `artifact_type` build system as
    /// `task_id`.
    async fn build_by_task_id(
        &self,
        artifact_type: ArtifactType,
        task_id: &str,
    ) -> Result<Option<ArtifactBuild>, StoreError>;

    /// Non-terminal builds of `original_nvr` across all events.
    async fn active_builds_by_nvr(
        &self,
        original_nvr: &str,
    ) -> Result<Vec<ArtifactBuild>, StoreError>;

    /// BUILD builds submitted before `cutoff`.
    async fn builds_submitted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArtifactBuild>, StoreError>;

    /// Compare-and-set on build state; see [`Store::update_event_state`].
    async fn update_build(
        &self,
        id: i64,
        expected: BuildState,
        transition: &BuildTransition,
    ) -> Result<Option<ArtifactBuild>, StoreError>;

    async fn stats(&self) -> Result<Stats, StoreError>;
}

/// Checks that every parent index points backwards into the batch.
pub(crate) fn validate_parents(builds: &[NewArtifactBuild]) -> Result<(), StoreError> {
    for (i, build) in builds.iter().enumerate() {
        if let Some(parent) = build.dep_on_index {
            if parent >= i {
                return Err(StoreError::InvalidParent(parent));
            }
        }
    }
    Ok(())
}
