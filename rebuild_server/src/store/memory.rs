//! In-memory store. Used when no database is configured and by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{validate_parents, Stats, Store};
use crate::error::StoreError;
use crate::models::artifact::ArtifactType;
use crate::models::build::{ArtifactBuild, BuildState, BuildTransition, NewArtifactBuild};
use crate::models::event::{Event, EventFilter, EventState, HandlerResult, NewEvent};

#[derive(Default)]
struct Inner {
    events: BTreeMap<i64, Event>,
    by_message: HashMap<String, i64>,
    builds: BTreeMap<i64, ArtifactBuild>,
    dependencies: BTreeSet<(i64, i64)>,
    next_event_id: i64,
    next_build_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_event(&self, new: NewEvent) -> Result<(Event, bool), StoreError> {
        let mut inner = self.lock();
        if let Some(id) = inner.by_message.get(&new.message_id) {
            let existing = inner
                .events
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("dangling message id {}", new.message_id)))?;
            return Ok((existing, false));
        }

        inner.next_event_id += 1;
        let event = Event {
            id: inner.next_event_id,
            message_id: new.message_id.clone(),
            event_type: new.event_type,
            search_key: new.search_key,
            state: EventState::Initialized,
            state_reason: String::new(),
            dry_run: new.dry_run,
            requester: new.requester,
            handler_results: Vec::new(),
            time_created: Utc::now(),
            time_done: None,
        };
        inner.by_message.insert(new.message_id, event.id);
        inner.events.insert(event.id, event.clone());
        Ok((event, true))
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        Ok(self.lock().events.get(&id).cloned())
    }

    async fn find_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let inner = self.lock();
        let touched: Option<BTreeSet<i64>> = filter.nvr.as_ref().map(|nvr| {
            inner
                .builds
                .values()
                .filter(|b| &b.original_nvr == nvr || b.rebuilt_nvr.as_ref() == Some(nvr))
                .map(|b| b.event_id)
                .collect()
        });

        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(inner
            .events
            .values()
            .rev()
            .filter(|e| filter.search_key.as_ref().map_or(true, |k| &e.search_key == k))
            .filter(|e| filter.state.map_or(true, |s| e.state == s))
            .filter(|e| filter.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| touched.as_ref().map_or(true, |ids| ids.contains(&e.id)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_event_state(
        &self,
        id: i64,
        expected: EventState,
        state: EventState,
        reason: &str,
    ) -> Result<Option<Event>, StoreError> {
        let mut inner = self.lock();
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(None);
        };
        if event.state != expected {
            return Ok(None);
        }
        event.state = state;
        event.state_reason = reason.to_string();
        if state.is_terminal() {
            event.time_done = Some(Utc::now());
        }
        Ok(Some(event.clone()))
    }

    async fn record_handler_result(
        &self,
        id: i64,
        result: HandlerResult,
    ) -> Result<(), StoreError> {
        if let Some(event) = self.lock().events.get_mut(&id) {
            event.handler_results.push(result);
        }
        Ok(())
    }

    async fn add_event_dependency(
        &self,
        event_id: i64,
        depends_on: i64,
    ) -> Result<(), StoreError> {
        self.lock().dependencies.insert((event_id, depends_on));
        Ok(())
    }

    async fn event_dependencies(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .lock()
            .dependencies
            .iter()
            .filter(|(e, _)| *e == event_id)
            .map(|(_, d)| *d)
            .collect())
    }

    async fn dependent_events(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .lock()
            .dependencies
            .iter()
            .filter(|(_, d)| *d == event_id)
            .map(|(e, _)| *e)
            .collect())
    }

    async fn insert_builds(
        &self,
        event_id: i64,
        builds: Vec<NewArtifactBuild>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        validate_parents(&builds)?;
        let mut inner = self.lock();
        let now = Utc::now();
        let mut ids: Vec<i64> = Vec::with_capacity(builds.len());
        let mut created = Vec::with_capacity(builds.len());
        for new in builds {
            inner.next_build_id += 1;
            let build = ArtifactBuild {
                id: inner.next_build_id,
                event_id,
                name: new.name,
                artifact_type: new.artifact_type,
                original_nvr: new.original_nvr,
                rebuilt_nvr: None,
                state: BuildState::Planned,
                state_reason: new.state_reason,
                rebuild_reason: new.rebuild_reason,
                dep_on: new.dep_on_index.map(|i| ids[i]),
                build_args: new.build_args,
                task_id: None,
                retry_count: 0,
                time_created: now,
                time_submitted: None,
                time_completed: None,
            };
            ids.push(build.id);
            created.push(build);
        }
        for build in &created {
            inner.builds.insert(build.id, build.clone());
        }
        Ok(created)
    }

    async fn get_build(&self, id: i64) -> Result<Option<ArtifactBuild>, StoreError> {
        Ok(self.lock().builds.get(&id).cloned())
    }

    async fn builds_for_event(&self, event_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|b| b.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn children_of(&self, build_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|b| b.dep_on == Some(build_id))
            .cloned()
            .collect())
    }

    async fn build_by_task_id(
        &self,
        artifact_type: ArtifactType,
        task_id: &str,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        Ok(self
            .lock()
            .builds
            .values()
            .rev()
            .find(|b| b.artifact_type == artifact_type && b.task_id.as_deref() == Some(task_id))
            .cloned())
    }

    async fn active_builds_by_nvr(
        &self,
        original_nvr: &str,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|b| b.original_nvr == original_nvr && !b.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn builds_submitted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|b| b.state == BuildState::Build)
            .filter(|b| b.time_submitted.is_some_and(|t| t < cutoff))
            .cloned()
            .collect())
    }

    async fn update_build(
        &self,
        id: i64,
        expected: BuildState,
        transition: &BuildTransition,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        let mut inner = self.lock();
        let Some(build) = inner.builds.get_mut(&id) else {
            return Ok(None);
        };
        if build.state != expected {
            return Ok(None);
        }
        transition.apply(build);
        Ok(Some(build.clone()))
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        let inner = self.lock();
        let mut stats = Stats::default();
        for event in inner.events.values() {
            *stats.events.entry(event.state.to_string()).or_default() += 1;
        }
        for build in inner.builds.values() {
            *stats.builds.entry(build.state.to_string()).or_default() += 1;
        }
        Ok(stats)
    }
}
