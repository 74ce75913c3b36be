//! In-process fakes for the external collaborators, and a harness wiring
//! them to an in-memory store. Used by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::clients::{BuildSystem, BuildSystems, MetadataService, SubmittedTask};
use crate::config::RebuildConfig;
use crate::error::{MetadataError, RebuildError, SubmitError};
use crate::events::notification::StateChange;
use crate::models::artifact::{ArtifactRef, ArtifactType};
use crate::models::build::{ArtifactBuild, BuildState};
use crate::models::event::EventState;
use crate::services::dispatcher::{DispatchReport, ManualRequest};
use crate::services::publisher::Publisher;
use crate::services::Services;
use crate::store::{MemoryStore, Store};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn artifact(name: &str, artifact_type: ArtifactType, nvr: &str) -> ArtifactRef {
    ArtifactRef::new(name, artifact_type, nvr)
}

pub fn image(nvr: &str) -> ArtifactRef {
    let name = nvr.split('-').next().unwrap_or(nvr);
    artifact(name, ArtifactType::Image, nvr)
}

// ── Build system ──

/// Scripted build system. Each NVR consumes its scripted outcomes in order
/// and succeeds once they run out.
#[derive(Default)]
pub struct FakeBuildSystem {
    script: Mutex<HashMap<String, VecDeque<SubmitError>>>,
    submissions: Mutex<Vec<String>>,
    cancels: Mutex<Vec<String>>,
    next_task: AtomicU64,
    gate: Mutex<Option<Arc<Notify>>>,
    started: Notify,
}

impl FakeBuildSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` submissions of `nvr` transiently.
    pub fn fail_transiently(&self, nvr: &str, times: usize) {
        let mut script = locked(&self.script);
        let queue = script.entry(nvr.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(SubmitError::Transient(format!("{nvr}: connection reset")));
        }
    }

    /// Reject the next submission of `nvr`.
    pub fn reject(&self, nvr: &str) {
        locked(&self.script)
            .entry(nvr.to_string())
            .or_default()
            .push_back(SubmitError::Permanent(format!("{nvr}: bad build arguments")));
    }

    /// Make every submission wait until [`FakeBuildSystem::open_gate`].
    pub fn close_gate(&self) {
        *locked(&self.gate) = Some(Arc::new(Notify::new()));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = locked(&self.gate).take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    /// Resolves once a submission reaches the build system.
    pub async fn submission_started(&self) {
        self.started.notified().await;
    }

    /// NVRs in submission order, one entry per attempt.
    pub fn submissions(&self) -> Vec<String> {
        locked(&self.submissions).clone()
    }

    pub fn attempts(&self, nvr: &str) -> usize {
        locked(&self.submissions)
            .iter()
            .filter(|s| s.as_str() == nvr)
            .count()
    }

    pub fn cancels(&self) -> Vec<String> {
        locked(&self.cancels).clone()
    }
}

#[async_trait]
impl BuildSystem for FakeBuildSystem {
    async fn submit_build(
        &self,
        build: &ArtifactBuild,
        _args: &serde_json::Value,
    ) -> Result<SubmittedTask, SubmitError> {
        locked(&self.submissions).push(build.original_nvr.clone());
        self.started.notify_one();

        let gate = locked(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripted = locked(&self.script)
            .get_mut(&build.original_nvr)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let n = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmittedTask {
            task_id: format!("task-{n}"),
            rebuilt_nvr: None,
        })
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), SubmitError> {
        locked(&self.cancels).push(task_id.to_string());
        Ok(())
    }
}

// ── Metadata ──

/// Fixed dependency graph.
#[derive(Default)]
pub struct StaticMetadata {
    direct: HashMap<String, Vec<ArtifactRef>>,
    dependents: HashMap<String, Vec<ArtifactRef>>,
    failures: AtomicU32,
    lookups: AtomicU32,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Artifacts directly affected by `search_key`.
    pub fn direct(mut self, search_key: &str, artifacts: Vec<ArtifactRef>) -> Self {
        self.direct.insert(search_key.to_string(), artifacts);
        self
    }

    /// Artifacts depending on `nvr`.
    pub fn dependents(mut self, nvr: &str, artifacts: Vec<ArtifactRef>) -> Self {
        self.dependents.insert(nvr.to_string(), artifacts);
        self
    }

    /// Fail the next `times` direct lookups transiently.
    pub fn fail_lookups(self, times: u32) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataService for StaticMetadata {
    async fn find_directly_affected(
        &self,
        search_key: &str,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MetadataError::Transient("metadata service timed out".into()));
        }
        Ok(self.direct.get(search_key).cloned().unwrap_or_default())
    }

    async fn find_affected_artifacts(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        Ok(self.dependents.get(&artifact.nvr).cloned().unwrap_or_default())
    }
}

// ── Publisher ──

#[derive(Default)]
pub struct RecordingPublisher {
    changes: Mutex<Vec<StateChange>>,
}

impl RecordingPublisher {
    pub fn changes(&self) -> Vec<StateChange> {
        locked(&self.changes).clone()
    }

    /// Published states of one event, in order.
    pub fn event_states(&self, event_id: i64) -> Vec<EventState> {
        locked(&self.changes)
            .iter()
            .filter_map(|c| match c {
                StateChange::Event(e) if e.id == event_id => Some(e.state),
                _ => None,
            })
            .collect()
    }

    /// Published states of one build, in order.
    pub fn build_states(&self, build_id: i64) -> Vec<BuildState> {
        locked(&self.changes)
            .iter()
            .filter_map(|c| match c {
                StateChange::Build(b) if b.id == build_id => Some(b.state),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, change: &StateChange) {
        locked(&self.changes).push(change.clone());
    }
}

// ── Harness ──

/// Configuration for tests: no delays.
pub fn test_config() -> RebuildConfig {
    RebuildConfig {
        retry_delay: Duration::ZERO,
        redelivery_delay: Duration::ZERO,
        ..RebuildConfig::default()
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub metadata: Arc<StaticMetadata>,
    pub build_system: Arc<FakeBuildSystem>,
    pub publisher: Arc<RecordingPublisher>,
    pub services: Services,
}

impl TestHarness {
    pub fn new(metadata: StaticMetadata) -> Self {
        Self::with_config(metadata, test_config())
    }

    pub fn with_config(metadata: StaticMetadata, config: RebuildConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let metadata = Arc::new(metadata);
        let build_system = Arc::new(FakeBuildSystem::new());
        let publisher = Arc::new(RecordingPublisher::default());

        let systems = ArtifactType::ALL.into_iter().fold(BuildSystems::new(), |s, t| {
            s.register(t, build_system.clone() as Arc<dyn BuildSystem>)
        });
        let services = Services::new(
            Arc::new(config),
            store.clone() as Arc<dyn Store>,
            publisher.clone() as Arc<dyn Publisher>,
            metadata.clone() as Arc<dyn MetadataService>,
            systems,
        );

        Self {
            store,
            metadata,
            build_system,
            publisher,
            services,
        }
    }

    /// Accept a manual request and dispatch its message, as the bus consumer
    /// would once the message comes off the queue.
    pub async fn trigger(&self, request: ManualRequest) -> Result<DispatchReport, RebuildError> {
        let (_, message) = self.services.dispatcher.accept_manual(request).await?;
        self.services.dispatcher.dispatch(&message).await
    }

    /// Builds of an event keyed by original NVR.
    pub async fn builds_by_nvr(&self, event_id: i64) -> HashMap<String, ArtifactBuild> {
        self.store
            .builds_for_event(event_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|b| (b.original_nvr.clone(), b))
            .collect()
    }
}
