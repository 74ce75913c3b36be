//! HTTP surface: signed bus ingress, manual trigger, cancel and read model.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use centrix_rebuild::config::RebuildConfig;
use centrix_rebuild::events::notification::{TaskNotification, TaskOutcome};
use centrix_rebuild::models::artifact::ArtifactType;
use centrix_rebuild::models::event::EventState;
use centrix_rebuild::routes::{rebuild_router, RebuildRouterState};
use centrix_rebuild::services::dispatcher::ManualRequest;
use centrix_rebuild::services::executor::Delivery;
use centrix_rebuild::services::signature::{sign, SIGNATURE_HEADER};
use centrix_rebuild::testing::{image, test_config, StaticMetadata, TestHarness};

const SECRET: &str = "bus-secret";

struct App {
    harness: TestHarness,
    router: axum::Router,
    bus: mpsc::Receiver<Delivery>,
    tasks: mpsc::Receiver<TaskNotification>,
}

fn app(metadata: StaticMetadata) -> App {
    let config = RebuildConfig {
        bus_secret: SECRET.to_string(),
        ..test_config()
    };
    let harness = TestHarness::with_config(metadata, config);
    let (bus_tx, bus) = mpsc::channel(16);
    let (task_tx, tasks) = mpsc::channel(16);
    let router = rebuild_router(RebuildRouterState {
        services: harness.services.clone(),
        bus: bus_tx,
        tasks: task_tx,
    });
    App {
        harness,
        router,
        bus,
        tasks,
    }
}

fn signed_post(uri: &str, body: &Value) -> Request<Body> {
    let payload = serde_json::to_vec(body).expect("serialize");
    let signature = sign(SECRET, &payload).expect("signature");
    Request::post(uri)
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(payload))
        .expect("request")
}

fn json_post(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("serialize")))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn advisory_message() -> Value {
    json!({
        "msg_id": "ID:broker-1-1",
        "event": {
            "type": "advisory_signed",
            "advisory_id": "RHSA-2024:1",
            "advisory_name": null,
            "content_types": ["rpm"]
        }
    })
}

#[tokio::test]
async fn signed_bus_message_is_queued() {
    let mut app = app(StaticMetadata::new());

    let response = app
        .router
        .clone()
        .oneshot(signed_post("/bus/messages", &advisory_message()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let delivery = app.bus.try_recv().expect("queued delivery");
    assert_eq!(delivery.message.msg_id, "ID:broker-1-1");
    assert_eq!(delivery.attempt, 1);
}

#[tokio::test]
async fn unsigned_bus_message_is_rejected() {
    let mut app = app(StaticMetadata::new());

    let response = app
        .router
        .clone()
        .oneshot(json_post("/bus/messages", &advisory_message()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.bus.try_recv().is_err());
}

#[tokio::test]
async fn malformed_bus_message_is_a_bad_request() {
    let app = app(StaticMetadata::new());

    let response = app
        .router
        .clone()
        .oneshot(signed_post("/bus/messages", &json!({"msg_id": "x"})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn task_notification_is_queued() {
    let mut app = app(StaticMetadata::new());

    let response = app
        .router
        .clone()
        .oneshot(signed_post(
            "/bus/tasks",
            &json!({"artifact_type": "image", "task_id": "task-7", "outcome": "succeeded"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let notification = app.tasks.try_recv().expect("queued notification");
    assert_eq!(
        notification,
        TaskNotification::new(ArtifactType::Image, "task-7", TaskOutcome::Succeeded)
    );
}

#[tokio::test]
async fn manual_trigger_then_read_the_tree() {
    let metadata = StaticMetadata::new().dependents("a-1-1", vec![image("b-1-1")]);
    let mut app = app(metadata);

    let response = app
        .router
        .clone()
        .oneshot(json_post(
            "/api/events",
            &json!({
                "artifacts": [{"name": "a", "artifact_type": "image", "nvr": "a-1-1"}],
                "requester": "jdoe"
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["event"]["state"], "initialized");
    assert_eq!(accepted["event"]["requester"], "jdoe");
    let event_id = accepted["event"]["id"].as_i64().expect("event id");
    assert!(app.harness.build_system.submissions().is_empty());

    // The bus consumer picks the queued message up and finds the same event.
    let delivery = app.bus.try_recv().expect("queued delivery");
    let report = app
        .harness
        .services
        .dispatcher
        .dispatch(&delivery.message)
        .await
        .expect("dispatch");
    assert!(!report.created);
    assert_eq!(report.event.id, event_id);
    assert_eq!(report.event.state, EventState::Building);
    assert_eq!(report.results[0].handler, "manual_rebuild");

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/events/{event_id}")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let tree = body_json(response).await;
    assert_eq!(tree["builds"].as_object().expect("builds").len(), 2);
    assert_eq!(tree["waves"].as_array().expect("waves").len(), 2);
    let root = tree["roots"][0].as_i64().expect("root id");
    assert_eq!(tree["builds"][root.to_string()]["original_nvr"], "a-1-1");
    assert_eq!(tree["builds"][root.to_string()]["state"], "build");

    let response = app
        .router
        .clone()
        .oneshot(get("/api/events?nvr=b-1-1"))
        .await
        .expect("response");
    let events = body_json(response).await;
    assert_eq!(events.as_array().expect("events").len(), 1);

    let response = app
        .router
        .clone()
        .oneshot(get("/api/events?state=complete"))
        .await
        .expect("response");
    assert!(body_json(response).await.as_array().expect("events").is_empty());

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/builds/{root}")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["rebuild_reason"], "directly_affected");
}

#[tokio::test]
async fn manual_trigger_needs_artifacts_or_a_search_key() {
    let app = app(StaticMetadata::new());

    let response = app
        .router
        .clone()
        .oneshot(json_post("/api/events", &json!({"dry_run": true})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn manual_trigger_without_a_bus_consumer_is_unavailable() {
    let app = app(StaticMetadata::new());
    drop(app.bus);

    let response = app
        .router
        .clone()
        .oneshot(json_post(
            "/api/events",
            &json!({"artifacts": [{"name": "a", "artifact_type": "image", "nvr": "a-1-1"}]}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.harness.build_system.submissions().is_empty());
}

#[tokio::test]
async fn cancel_over_http() {
    let app = app(StaticMetadata::new());
    let report = app
        .harness
        .trigger(ManualRequest {
            artifacts: vec![image("a-1-1")],
            ..Default::default()
        })
        .await
        .expect("trigger");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post(format!(
                "/api/events/{}/cancel?reason=Superseded",
                report.event.id
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let event = body_json(response).await;
    assert_eq!(event["state"], "canceled");
    assert_eq!(event["state_reason"], "Superseded");
    assert_eq!(app.harness.build_system.cancels(), vec!["task-1".to_string()]);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let app = app(StaticMetadata::new());

    for uri in ["/api/events/404", "/api/builds/404"] {
        let response = app.router.clone().oneshot(get(uri)).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/api/events/404/cancel")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_count_events_and_builds_by_state() {
    let app = app(StaticMetadata::new());
    app.harness
        .trigger(ManualRequest {
            artifacts: vec![image("a-1-1"), image("c-1-1")],
            dry_run: true,
            ..Default::default()
        })
        .await
        .expect("trigger");

    let response = app
        .router
        .clone()
        .oneshot(get("/api/stats"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["events"]["complete"], 1);
    assert_eq!(stats["builds"]["done"], 2);
}
