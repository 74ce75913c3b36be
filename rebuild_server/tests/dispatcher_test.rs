//! Dispatcher: idempotent event creation, handler ordering and outcomes,
//! redelivery and follow-up events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use centrix_rebuild::clients::{BuildSystem, BuildSystems, MetadataService};
use centrix_rebuild::error::StoreError;
use centrix_rebuild::events::{EventPayload, EventType, InboundMessage, ModuleBuildState};
use centrix_rebuild::models::{
    ArtifactBuild, ArtifactType, BuildState, BuildTransition, Event, EventFilter, EventState,
    HandlerOutcomeKind, HandlerResult, NewArtifactBuild, NewEvent,
};
use centrix_rebuild::services::dispatcher::ManualRequest;
use centrix_rebuild::services::publisher::Publisher;
use centrix_rebuild::services::Services;
use centrix_rebuild::store::{MemoryStore, Stats, Store};
use centrix_rebuild::testing::{
    image, test_config, FakeBuildSystem, RecordingPublisher, StaticMetadata, TestHarness,
};

/// Memory store whose first task-id lookup fails.
#[derive(Default)]
struct FlakyTaskLookup {
    inner: MemoryStore,
    failed: AtomicBool,
}

#[async_trait]
impl Store for FlakyTaskLookup {
    async fn create_event(&self, new: NewEvent) -> Result<(Event, bool), StoreError> {
        self.inner.create_event(new).await
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        self.inner.get_event(id).await
    }

    async fn find_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        self.inner.find_events(filter).await
    }

    async fn update_event_state(
        &self,
        id: i64,
        expected: EventState,
        state: EventState,
        reason: &str,
    ) -> Result<Option<Event>, StoreError> {
        self.inner.update_event_state(id, expected, state, reason).await
    }

    async fn record_handler_result(
        &self,
        id: i64,
        result: HandlerResult,
    ) -> Result<(), StoreError> {
        self.inner.record_handler_result(id, result).await
    }

    async fn add_event_dependency(&self, event_id: i64, depends_on: i64)
        -> Result<(), StoreError> {
        self.inner.add_event_dependency(event_id, depends_on).await
    }

    async fn event_dependencies(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        self.inner.event_dependencies(event_id).await
    }

    async fn dependent_events(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        self.inner.dependent_events(event_id).await
    }

    async fn insert_builds(
        &self,
        event_id: i64,
        builds: Vec<NewArtifactBuild>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        self.inner.insert_builds(event_id, builds).await
    }

    async fn get_build(&self, id: i64) -> Result<Option<ArtifactBuild>, StoreError> {
        self.inner.get_build(id).await
    }

    async fn builds_for_event(&self, event_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        self.inner.builds_for_event(event_id).await
    }

    async fn children_of(&self, build_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        self.inner.children_of(build_id).await
    }

    async fn build_by_task_id(
        &self,
        artifact_type: ArtifactType,
        task_id: &str,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Pool("connection reset".to_string()));
        }
        self.inner.build_by_task_id(artifact_type, task_id).await
    }

    async fn active_builds_by_nvr(
        &self,
        original_nvr: &str,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        self.inner.active_builds_by_nvr(original_nvr).await
    }

    async fn builds_submitted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        self.inner.builds_submitted_before(cutoff).await
    }

    async fn update_build(
        &self,
        id: i64,
        expected: BuildState,
        transition: &BuildTransition,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        self.inner.update_build(id, expected, transition).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats().await
    }
}

fn module_ready(msg_id: &str) -> InboundMessage {
    InboundMessage::new(
        msg_id,
        EventPayload::ModuleStateChanged {
            name: "nodejs".to_string(),
            stream: "18".to_string(),
            version: "8080".to_string(),
            build_id: 4242,
            state: ModuleBuildState::Ready,
        },
    )
}

fn advisory(msg_id: &str, advisory_id: &str, content: &str) -> InboundMessage {
    InboundMessage::new(
        msg_id,
        EventPayload::AdvisorySigned {
            advisory_id: advisory_id.to_string(),
            advisory_name: Some("Important: httpd security update".to_string()),
            content_types: vec![content.to_string()],
        },
    )
}

#[tokio::test]
async fn redelivered_message_does_not_create_a_second_event() {
    let metadata = StaticMetadata::new().direct("RHSA-2024:1", vec![image("httpd-2.4-1")]);
    let harness = TestHarness::new(metadata);
    let dispatcher = &harness.services.dispatcher;

    let first = dispatcher
        .dispatch(&advisory("m1", "RHSA-2024:1", "rpm"))
        .await
        .expect("first delivery");
    let second = dispatcher
        .dispatch(&advisory("m1", "RHSA-2024:1", "rpm"))
        .await
        .expect("redelivery");

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.event.id, second.event.id);
    assert!(second.results.is_empty());
    assert_eq!(harness.build_system.attempts("httpd-2.4-1"), 1);

    let stats = harness.store.stats().await.expect("stats");
    assert_eq!(stats.events.values().sum::<i64>(), 1);
}

#[tokio::test]
async fn event_no_handler_can_process_is_skipped() {
    let harness = TestHarness::new(StaticMetadata::new());

    let report = harness
        .services
        .dispatcher
        .dispatch(&advisory("m1", "RHBA-2024:5", "docker"))
        .await
        .expect("dispatch");

    assert_eq!(report.event.state, EventState::Skipped);
    assert_eq!(
        report.event.state_reason,
        "No handler is able to process advisory_signed events."
    );
    assert!(report.results.is_empty());
}

#[tokio::test]
async fn advisory_affecting_nothing_is_skipped_with_the_handler_reason() {
    let harness = TestHarness::new(StaticMetadata::new());

    let report = harness
        .services
        .dispatcher
        .dispatch(&advisory("m1", "RHBA-2024:5", "rpm"))
        .await
        .expect("dispatch");

    assert_eq!(report.event.state, EventState::Skipped);
    assert_eq!(
        report.event.state_reason,
        "Advisory RHBA-2024:5 does not affect any artifact."
    );
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].handler, "rebuild_images_on_advisory");
    assert_eq!(report.results[0].outcome, HandlerOutcomeKind::Declined);
}

#[tokio::test]
async fn transient_metadata_failure_keeps_the_event_for_redelivery() {
    let metadata = StaticMetadata::new()
        .direct("RHSA-2024:1", vec![image("httpd-2.4-1")])
        .fail_lookups(1);
    let harness = TestHarness::new(metadata);
    let dispatcher = &harness.services.dispatcher;

    let first = dispatcher
        .dispatch(&advisory("m1", "RHSA-2024:1", "rpm"))
        .await
        .expect("first delivery");
    assert!(first.retryable);
    assert_eq!(first.event.state, EventState::Initialized);
    assert_eq!(first.results[0].outcome, HandlerOutcomeKind::Retryable);
    assert!(harness.builds_by_nvr(first.event.id).await.is_empty());

    let second = dispatcher
        .dispatch(&advisory("m1", "RHSA-2024:1", "rpm"))
        .await
        .expect("redelivery");
    assert!(!second.retryable);
    assert_eq!(second.event.id, first.event.id);
    assert_eq!(second.event.state, EventState::Building);
    assert_eq!(harness.metadata.lookups(), 2);

    let ledger = &second.event.handler_results;
    let outcomes: Vec<HandlerOutcomeKind> = ledger.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![HandlerOutcomeKind::Retryable, HandlerOutcomeKind::Planned]
    );
}

#[tokio::test]
async fn giving_up_on_redelivery_fails_the_event() {
    let metadata = StaticMetadata::new().fail_lookups(10);
    let harness = TestHarness::new(metadata);
    let dispatcher = &harness.services.dispatcher;

    let report = dispatcher
        .dispatch(&advisory("m1", "RHSA-2024:1", "rpm"))
        .await
        .expect("dispatch");
    assert!(report.retryable);

    let failed = dispatcher.give_up(report.event.id, 6).await.expect("give up");
    assert_eq!(failed.state, EventState::Failed);
    assert!(failed.state_reason.starts_with("Gave up after 6 deliveries."));
}

#[tokio::test]
async fn structural_planning_error_fails_the_event() {
    let metadata = StaticMetadata::new()
        .dependents("a-1-1", vec![image("b-1-1")])
        .dependents("b-1-1", vec![image("a-1-1")]);
    let harness = TestHarness::new(metadata);

    let report = harness
        .trigger(ManualRequest {
            artifacts: vec![image("a-1-1")],
            ..ManualRequest::default()
        })
        .await
        .expect("dispatch");

    assert_eq!(report.event.state, EventState::Failed);
    assert!(report.event.state_reason.starts_with("manual_rebuild:"));
    assert_eq!(report.results[0].outcome, HandlerOutcomeKind::Failed);
    assert!(harness.build_system.submissions().is_empty());
}

#[tokio::test]
async fn manual_trigger_records_requester_and_dry_run() {
    let harness = TestHarness::new(StaticMetadata::new());

    let report = harness
        .trigger(ManualRequest {
            artifacts: vec![image("nginx-1.20-3")],
            dry_run: true,
            requester: Some("release-bot".to_string()),
            ..ManualRequest::default()
        })
        .await
        .expect("trigger");

    let event = &report.event;
    assert!(event.message_id.starts_with("manual-"));
    assert_eq!(event.event_type, EventType::ManualRebuild);
    assert_eq!(event.search_key, "nginx-1.20-3");
    assert_eq!(event.requester.as_deref(), Some("release-bot"));
    assert!(event.dry_run);
    assert_eq!(event.state, EventState::Complete);
}

#[tokio::test]
async fn ready_module_forwards_a_content_change() {
    let metadata = StaticMetadata::new()
        .dependents("nodejs-18-8080", vec![image("webapp-1-1")]);
    let harness = TestHarness::new(metadata);

    let reports = harness
        .services
        .dispatcher
        .dispatch_all(module_ready("m1"))
        .await
        .expect("dispatch");
    assert_eq!(reports.len(), 2);

    let module = &reports[0];
    assert_eq!(module.event.state, EventState::Skipped);
    let handlers: Vec<&str> = module.results.iter().map(|r| r.handler.as_str()).collect();
    assert_eq!(
        handlers,
        vec!["track_module_build_state", "rebuild_on_module_ready"]
    );
    assert_eq!(module.results[0].outcome, HandlerOutcomeKind::Declined);
    assert_eq!(module.results[1].outcome, HandlerOutcomeKind::Forwarded);

    let content = &reports[1];
    assert_eq!(content.event.message_id, "m1.content_changed");
    assert_eq!(content.event.event_type, EventType::ContentChanged);
    assert_eq!(content.event.search_key, "nodejs-18-8080");
    assert_eq!(content.event.state, EventState::Building);
    assert_eq!(harness.build_system.submissions(), vec!["webapp-1-1".to_string()]);
}

#[tokio::test]
async fn failed_module_build_matches_only_the_tracker() {
    let harness = TestHarness::new(StaticMetadata::new());
    let message = InboundMessage::new(
        "m1",
        EventPayload::ModuleStateChanged {
            name: "nodejs".to_string(),
            stream: "18".to_string(),
            version: "8080".to_string(),
            build_id: 4242,
            state: ModuleBuildState::Failed,
        },
    );

    let report = harness
        .services
        .dispatcher
        .dispatch(&message)
        .await
        .expect("dispatch");
    assert!(report.follow_ups.is_empty());
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.event.state, EventState::Skipped);
    assert_eq!(
        report.event.state_reason,
        "Module build 4242 was not submitted by this service."
    );
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_next_one() {
    let store = Arc::new(FlakyTaskLookup::default());
    let build_system = Arc::new(FakeBuildSystem::new());
    let systems = BuildSystems::new()
        .register(ArtifactType::Module, build_system as Arc<dyn BuildSystem>);
    let services = Services::new(
        Arc::new(test_config()),
        store.clone() as Arc<dyn Store>,
        Arc::new(RecordingPublisher::default()) as Arc<dyn Publisher>,
        Arc::new(StaticMetadata::new()) as Arc<dyn MetadataService>,
        systems,
    );

    let report = services
        .dispatcher
        .dispatch(&module_ready("m1"))
        .await
        .expect("dispatch");

    let outcomes: Vec<(&str, HandlerOutcomeKind)> = report
        .results
        .iter()
        .map(|r| (r.handler.as_str(), r.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("track_module_build_state", HandlerOutcomeKind::Failed),
            ("rebuild_on_module_ready", HandlerOutcomeKind::Forwarded),
        ]
    );
    assert!(report.results[0].detail.contains("connection reset"));
    assert_eq!(report.follow_ups.len(), 1);
    assert_eq!(report.follow_ups[0].msg_id, "m1.content_changed");

    let event = store
        .get_event(report.event.id)
        .await
        .expect("get")
        .expect("event");
    assert_eq!(event.handler_results, report.results);
    assert_eq!(event.state, EventState::Failed);
    assert!(event.state_reason.starts_with("track_module_build_state:"));
}
