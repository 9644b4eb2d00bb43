//! Integration tests for the worker API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_test::assert_ok;
use tower::ServiceExt;
use triage_lib::{
    decision::{Decision, DecisionUpdate},
    health::components,
    pubsub::{InMemoryPubSub, Notifier},
    registry::StaticModelRegistry,
    store::TicketStore,
    NewTicket, TicketStatus, TICKET_UPDATES_CHANNEL,
};
use triage_worker::{
    api::{create_router, AppState},
    app::{App, Storage},
    config::WorkerConfig,
};
use uuid::Uuid;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let app = App::assemble(
        &WorkerConfig::default(),
        Storage::in_memory(),
        Arc::new(StaticModelRegistry::new()),
    )
    .unwrap();
    app.state.health_registry.register(components::PIPELINE).await;
    app.state.health_registry.register(components::QUEUE).await;

    let state = Arc::clone(&app.state);
    (create_router(state.clone()), state)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = assert_ok!(app.oneshot(request).await);
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn seed_ticket(state: &AppState, decision: Decision, confidence: f64) -> Uuid {
    let ticket_id = Uuid::new_v4();
    state
        .store
        .insert_processing_ticket(NewTicket {
            ticket_id,
            subject: "Cannot connect to VPN".into(),
            description: "timeout error".into(),
            category_model_id: 1,
            priority_model_id: 2,
        })
        .await
        .unwrap();
    state
        .store
        .record_decision(
            ticket_id,
            &DecisionUpdate {
                predicted_category: "Network".into(),
                predicted_priority: "High".into(),
                category_confidence: confidence,
                priority_confidence: confidence,
                decision,
            },
        )
        .await
        .unwrap();
    ticket_id
}

#[tokio::test]
async fn test_create_ticket_returns_accepted() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = send(
        app,
        post_json(
            "/tickets",
            json!({"subject": "Cannot connect to VPN", "description": "timeout error"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "Ticket received for processing");
    assert!(Uuid::parse_str(body["ticket_id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_create_ticket_rejects_blank_subject() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = send(
        app,
        post_json("/tickets", json!({"subject": "  ", "description": "x"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("subject"));
}

#[tokio::test]
async fn test_create_ticket_rejects_missing_fields() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = send(app, post_json("/tickets", json!({"subject": "only"}))).await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_get_ticket_returns_result_subset() {
    let (app, state) = setup_test_app().await;
    let ticket_id = seed_ticket(&state, Decision::AutoComplete, 0.95).await;

    let (status, body) = send(app, get(&format!("/tickets/{ticket_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ticket_id"], ticket_id.to_string());
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["final_category"], "Network");
    assert!(body.get("subject").is_none());
}

#[tokio::test]
async fn test_get_unknown_ticket_returns_404() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = send(app, get(&format!("/tickets/{}", Uuid::new_v4()))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_recent_tickets_respects_limit() {
    let (app, state) = setup_test_app().await;
    for _ in 0..3 {
        seed_ticket(&state, Decision::AutoComplete, 0.9).await;
    }

    let (status, body) = send(app, get("/tickets/recent?limit=2")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_review_flow() {
    let (app, state) = setup_test_app().await;
    let pending = seed_ticket(&state, Decision::HumanReview, 0.4).await;
    seed_ticket(&state, Decision::AutoComplete, 0.9).await;

    let (status, queue) = send(app.clone(), get("/review-queue")).await;
    assert_eq!(status, StatusCode::OK);
    let queue = queue.as_array().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0]["ticket_id"], pending.to_string());

    let (status, reviewed) = send(
        app.clone(),
        post_json(
            &format!("/review/{pending}"),
            json!({"final_category": "Network", "final_priority": "Critical"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviewed["status"], "COMPLETED");
    assert_eq!(reviewed["final_priority"], "Critical");
    assert!(reviewed["reviewed_at"].is_string());

    let (status, _) = send(
        app,
        post_json(
            &format!("/review/{pending}"),
            json!({"final_category": "Network", "final_priority": "Low"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let ticket = state.store.get_ticket(pending).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Completed);
    assert_eq!(ticket.final_priority.as_deref(), Some("Critical"));
}

#[tokio::test]
async fn test_review_updates_go_through_the_storage_notifier() {
    let notifier = Arc::new(InMemoryPubSub::default());
    let mut updates = notifier.subscribe(TICKET_UPDATES_CHANNEL).await.unwrap();
    let storage = Storage {
        notifier: notifier.clone(),
        ..Storage::in_memory()
    };
    let app = App::assemble(
        &WorkerConfig::default(),
        storage,
        Arc::new(StaticModelRegistry::new()),
    )
    .unwrap();
    assert!(Arc::ptr_eq(
        &app.notifier,
        &(notifier.clone() as Arc<dyn Notifier>)
    ));

    let state = Arc::clone(&app.state);
    let pending = seed_ticket(&state, Decision::HumanReview, 0.4).await;
    let (status, _) = send(
        create_router(state),
        post_json(
            &format!("/review/{pending}"),
            json!({"final_category": "Network", "final_priority": "High"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let update: Value = serde_json::from_str(&updates.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(update["ticket_id"], pending.to_string());
    assert_eq!(update["status"], "COMPLETED");
}

#[tokio::test]
async fn test_review_unknown_ticket_returns_404() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = send(
        app,
        post_json(
            &format!("/review/{}", Uuid::new_v4()),
            json!({"final_category": "A", "final_priority": "B"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_breakdown() {
    let (app, state) = setup_test_app().await;
    seed_ticket(&state, Decision::AutoComplete, 0.9).await;
    seed_ticket(&state, Decision::HumanReview, 0.3).await;

    let (status, body) = send(app, get("/stats")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_breakdown"]["completed"], 1);
    assert_eq!(body["status_breakdown"]["pending_review"], 1);
    assert_eq!(body["status_breakdown"]["processing"], 0);
    assert_eq!(body["category_breakdown"]["Network"], 2);
    assert_eq!(body["total"], 2);
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::PIPELINE, "no priority model available")
        .await;

    let (status, body) = send(app, get("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::QUEUE, "connection refused")
        .await;

    let (status, _) = send(app, get("/healthz")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_follows_startup() {
    let (app, state) = setup_test_app().await;

    let (status, _) = send(app.clone(), get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_started(true).await;
    let (status, _) = send(app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_triage_metrics() {
    let (app, state) = setup_test_app().await;
    state.metrics.inc_processed("completed_auto");

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("tickets_processed_total"));
}
