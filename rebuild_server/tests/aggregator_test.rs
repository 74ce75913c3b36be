//! State aggregator: task notifications, duplicates and timeouts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use centrix_rebuild::config::RebuildConfig;
use centrix_rebuild::events::notification::{TaskNotification, TaskOutcome};
use centrix_rebuild::events::{EventPayload, InboundMessage};
use centrix_rebuild::models::artifact::ArtifactType;
use centrix_rebuild::models::build::BuildState;
use centrix_rebuild::models::event::{Event, EventState};
use centrix_rebuild::services::aggregator::NotificationResult;
use centrix_rebuild::testing::{image, test_config, StaticMetadata, TestHarness};

async fn single_build_event(harness: &TestHarness) -> (Event, String) {
    let message = InboundMessage::new(
        "m1",
        EventPayload::ManualRebuild {
            search_key: None,
            artifacts: vec![image("httpd-2.4-1")],
        },
    );
    let report = harness
        .services
        .dispatcher
        .dispatch(&message)
        .await
        .expect("dispatch");
    let task_id = harness.builds_by_nvr(report.event.id).await["httpd-2.4-1"]
        .task_id
        .clone()
        .expect("submitted");
    (report.event, task_id)
}

#[tokio::test]
async fn success_notification_completes_the_build_and_event() {
    let harness = TestHarness::new(StaticMetadata::new());
    let (event, task_id) = single_build_event(&harness).await;

    let result = harness
        .services
        .aggregator
        .apply(&TaskNotification::new(ArtifactType::Image, task_id, TaskOutcome::Succeeded))
        .await
        .expect("apply");

    let NotificationResult::Applied(build) = result else {
        panic!("expected the notification to apply, got {result:?}");
    };
    assert_eq!(build.state, BuildState::Done);
    assert_eq!(build.state_reason, "Built successfully.");
    assert!(build.time_completed.is_some());

    let event = harness.services.events.require(event.id).await.expect("event");
    assert_eq!(event.state, EventState::Complete);
    assert!(event.time_done.is_some());
    assert_eq!(
        harness.publisher.event_states(event.id),
        vec![
            EventState::Initialized,
            EventState::Building,
            EventState::Complete
        ]
    );
}

#[tokio::test]
async fn duplicate_terminal_notification_changes_nothing() {
    let harness = TestHarness::new(StaticMetadata::new());
    let (event, task_id) = single_build_event(&harness).await;
    let aggregator = &harness.services.aggregator;

    aggregator
        .apply(&TaskNotification::new(
            ArtifactType::Image,
            task_id.clone(),
            TaskOutcome::Succeeded,
        ))
        .await
        .expect("first");
    let before = harness.builds_by_nvr(event.id).await["httpd-2.4-1"].clone();

    let again = aggregator
        .apply(&TaskNotification::new(
            ArtifactType::Image,
            task_id.clone(),
            TaskOutcome::Succeeded,
        ))
        .await
        .expect("second");
    assert!(matches!(again, NotificationResult::Duplicate(_)));

    let late_failure = aggregator
        .apply(&TaskNotification::new(ArtifactType::Image, task_id, TaskOutcome::Failed))
        .await
        .expect("late failure");
    assert!(matches!(late_failure, NotificationResult::Duplicate(_)));

    let after = harness.builds_by_nvr(event.id).await["httpd-2.4-1"].clone();
    assert_eq!(after.state, BuildState::Done);
    assert_eq!(after.time_completed, before.time_completed);
    assert_eq!(after, before);
}

#[tokio::test]
async fn unknown_task_is_dropped_without_a_hold_window() {
    let config = RebuildConfig {
        notification_hold: Duration::ZERO,
        ..test_config()
    };
    let harness = TestHarness::with_config(StaticMetadata::new(), config);
    let (event, _) = single_build_event(&harness).await;

    let result = harness
        .services
        .aggregator
        .apply(&TaskNotification::new(ArtifactType::Image, "task-999", TaskOutcome::Succeeded))
        .await
        .expect("apply");
    assert_eq!(result, NotificationResult::Unknown);

    let builds = harness.builds_by_nvr(event.id).await;
    assert_eq!(builds.len(), 1);
    assert_eq!(builds["httpd-2.4-1"].state, BuildState::Build);
}

#[tokio::test]
async fn unknown_task_is_held_and_creates_no_build() {
    let harness = TestHarness::new(StaticMetadata::new());
    let (event, _) = single_build_event(&harness).await;

    let result = harness
        .services
        .aggregator
        .apply(&TaskNotification::new(ArtifactType::Image, "task-999", TaskOutcome::Succeeded))
        .await
        .expect("apply");
    assert_eq!(result, NotificationResult::Held);

    let builds = harness.builds_by_nvr(event.id).await;
    assert_eq!(builds.len(), 1);
    assert_eq!(builds["httpd-2.4-1"].state, BuildState::Build);
}

#[tokio::test]
async fn task_ids_are_scoped_to_their_build_system() {
    let harness = TestHarness::new(StaticMetadata::new());
    let (event, task_id) = single_build_event(&harness).await;

    let result = harness
        .services
        .aggregator
        .apply(&TaskNotification::new(ArtifactType::Module, task_id, TaskOutcome::Succeeded))
        .await
        .expect("apply");
    assert!(
        !matches!(result, NotificationResult::Applied(_)),
        "a module notification must not finish an image build, got {result:?}"
    );

    let build = &harness.builds_by_nvr(event.id).await["httpd-2.4-1"];
    assert_eq!(build.state, BuildState::Build);
    let event = harness.services.events.require(event.id).await.expect("event");
    assert_eq!(event.state, EventState::Building);
}

#[tokio::test]
async fn notification_arriving_before_the_submission_is_recorded_still_applies() {
    let harness = Arc::new(TestHarness::new(StaticMetadata::new()));
    harness.build_system.close_gate();

    let message = InboundMessage::new(
        "m1",
        EventPayload::ManualRebuild {
            search_key: None,
            artifacts: vec![image("httpd-2.4-1")],
        },
    );
    let dispatching = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.services.dispatcher.dispatch(&message).await })
    };
    harness.build_system.submission_started().await;

    // The build system finished task-1 before its submission call returned.
    let early = harness
        .services
        .aggregator
        .apply(&TaskNotification::new(ArtifactType::Image, "task-1", TaskOutcome::Succeeded))
        .await
        .expect("apply");
    assert_eq!(early, NotificationResult::Held);

    harness.build_system.open_gate();
    let report = dispatching
        .await
        .expect("dispatch task")
        .expect("dispatch");

    let build = &harness.builds_by_nvr(report.event.id).await["httpd-2.4-1"];
    assert_eq!(build.state, BuildState::Done);
    assert_eq!(build.task_id.as_deref(), Some("task-1"));
    assert!(build.time_completed.is_some());
    assert_eq!(report.event.state, EventState::Complete);
}

#[tokio::test]
async fn failure_reason_from_the_build_system_is_kept() {
    let harness = TestHarness::new(StaticMetadata::new());
    let (event, task_id) = single_build_event(&harness).await;

    harness
        .services
        .aggregator
        .apply(
            &TaskNotification::new(ArtifactType::Image, task_id, TaskOutcome::Failed)
                .with_reason("Compilation failed on s390x."),
        )
        .await
        .expect("apply");

    let build = &harness.builds_by_nvr(event.id).await["httpd-2.4-1"];
    assert_eq!(build.state, BuildState::Failed);
    assert_eq!(build.state_reason, "Compilation failed on s390x.");
    let event = harness.services.events.require(event.id).await.expect("event");
    assert_eq!(event.state, EventState::Failed);
}

#[tokio::test]
async fn builds_past_the_timeout_horizon_fail() {
    let config = RebuildConfig {
        build_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let harness = TestHarness::with_config(StaticMetadata::new(), config);
    let (event, _) = single_build_event(&harness).await;
    let aggregator = &harness.services.aggregator;

    assert_eq!(aggregator.sweep_timeouts(Utc::now()).await.expect("sweep"), 0);

    let later = Utc::now() + chrono::Duration::minutes(2);
    assert_eq!(aggregator.sweep_timeouts(later).await.expect("sweep"), 1);

    let build = &harness.builds_by_nvr(event.id).await["httpd-2.4-1"];
    assert_eq!(build.state, BuildState::Failed);
    assert_eq!(build.state_reason, "Build timed out after 60 seconds.");
    let event = harness.services.events.require(event.id).await.expect("event");
    assert_eq!(event.state, EventState::Failed);

    assert_eq!(aggregator.sweep_timeouts(later).await.expect("sweep"), 0);
}
