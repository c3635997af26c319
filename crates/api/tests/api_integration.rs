//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain::ValidationLimits;
use event_store::InMemoryEventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal_macros::dec;
use saga::{
    InMemoryFundsService, InMemoryMatchingService, Operation, RetryPolicy, SagaConfig,
    SagaCoordinator, SagaRunner, ScriptedFailure,
};
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

type TestRunner = SagaRunner<InMemoryEventStore, InMemoryFundsService, InMemoryMatchingService>;

struct TestApp {
    router: axum::Router,
    runner: Arc<TestRunner>,
    funds: InMemoryFundsService,
    matching: InMemoryMatchingService,
}

fn setup() -> TestApp {
    let funds = InMemoryFundsService::new();
    let matching = InMemoryMatchingService::new();
    let fast = RetryPolicy {
        initial_interval: Duration::from_millis(1),
        backoff_coefficient: 2.0,
        max_interval: Duration::from_millis(4),
        max_attempts: 3,
    };
    let config = SagaConfig {
        limits: ValidationLimits::default(),
        call_timeout: Duration::from_secs(1),
        forward_retry: fast.clone(),
        compensation_retry: RetryPolicy {
            max_attempts: 2,
            ..fast
        },
        max_concurrent_sagas: 4,
    };
    let coordinator = Arc::new(SagaCoordinator::from_config(
        InMemoryEventStore::new(),
        funds.clone(),
        matching.clone(),
        &config,
    ));
    let runner = Arc::new(SagaRunner::new(coordinator, config.max_concurrent_sagas));
    let router = api::create_app(AppState::new(Arc::clone(&runner)), get_metrics_handle());

    TestApp {
        router,
        runner,
        funds,
        matching,
    }
}

fn order_body() -> Value {
    json!({
        "user_id": "user-1",
        "event_id": "event-1",
        "market_id": "market-1",
        "selection_id": "selection-1",
        "side": "BACK",
        "odds": "2.50",
        "stake": "100.00",
        "currency": "GBP",
        "idempotency_key": "client-key-1"
    })
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body)
        }
        None => Body::empty(),
    };

    let response = app
        .router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn place(app: &TestApp, body: Value) -> String {
    let (status, json) = send(app, "POST", "/orders", Some(body.to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{json}");
    assert_eq!(json["status"], "PROCESSING");
    json["saga_id"].as_str().unwrap().to_string()
}

/// Polls the status endpoint until the saga reaches a terminal state.
async fn wait_for_terminal(app: &TestApp, saga_id: &str) -> Value {
    for _ in 0..500 {
        let (status, json) = send(app, "GET", &format!("/orders/{saga_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(
            json["state"].as_str(),
            Some("SETTLED" | "FAILED" | "CANCELLED")
        ) {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saga {saga_id} did not finish");
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_health_reports_shutdown() {
    let app = setup();
    app.runner.shutdown().await;

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "shutting_down");
}

#[tokio::test]
async fn test_place_order_settles() {
    let app = setup();

    let saga_id = place(&app, order_body()).await;
    let json = wait_for_terminal(&app, &saga_id).await;

    assert_eq!(json["state"], "SETTLED");
    assert_eq!(json["saga_id"], saga_id);
    assert_eq!(json["stake"], "100.00");
    let winnings: rust_decimal::Decimal =
        json["potential_winnings"].as_str().unwrap().parse().unwrap();
    assert_eq!(winnings, dec!(150));
    assert_eq!(json["reserved_amount"], "100.00");
    assert!(json["reservation_id"].as_str().is_some());
    assert!(json["order_id"].as_str().is_some());
    assert_eq!(json["order_status"], "MATCHED");
    assert_eq!(json["compensation_status"], "NOT_REQUIRED");
    assert!(json["settled_at"].as_str().is_some());
    assert_eq!(json["failure_reason"], Value::Null);
    assert_eq!(app.funds.held_count(), 0);
}

#[tokio::test]
async fn test_place_order_with_caller_saga_id() {
    let app = setup();
    let saga_id = "5f0c6f38-6a4b-4a53-9d3c-4d1f3b2a9e10";
    let mut body = order_body();
    body["saga_id"] = json!(saga_id);

    let returned = place(&app, body.clone()).await;
    assert_eq!(returned, saga_id);

    let (status, _) = send(&app, "POST", "/orders", Some(body.to_string())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    wait_for_terminal(&app, saga_id).await;
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = setup();

    let (status, json) = send(&app, "POST", "/orders", Some("{not json".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().is_some());

    let mut body = order_body();
    body["stake"] = json!("a lot");
    let (status, _) = send(&app, "POST", "/orders", Some(body.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut body = order_body();
    body.as_object_mut().unwrap().remove("odds");
    let (status, _) = send(&app, "POST", "/orders", Some(body.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_validation_failure_is_reported_on_status() {
    let app = setup();
    let mut body = order_body();
    body["stake"] = json!("50000");

    let saga_id = place(&app, body).await;
    let json = wait_for_terminal(&app, &saga_id).await;

    assert_eq!(json["state"], "FAILED");
    assert_eq!(json["failure_kind"], "VALIDATION");
    assert!(
        json["failure_reason"]
            .as_str()
            .unwrap()
            .contains("stake too high")
    );
    assert_eq!(app.funds.call_log().count(Operation::ReserveFunds), 0);
}

#[tokio::test]
async fn test_downstream_rejection_compensates() {
    let app = setup();
    app.matching.fail_always(
        Operation::PlaceOrder,
        ScriptedFailure::Fatal("market closed".to_string()),
    );

    let saga_id = place(&app, order_body()).await;
    let json = wait_for_terminal(&app, &saga_id).await;

    assert_eq!(json["state"], "FAILED");
    assert_eq!(json["failure_kind"], "FATAL_DOWNSTREAM");
    assert!(json["failure_reason"].as_str().unwrap().contains("market closed"));
    assert_eq!(json["compensation_status"], "COMPLETED");
    assert_eq!(json["compensated_steps"], json!(["cancel-reservation"]));
    assert_eq!(json["requires_attention"], false);
    assert_eq!(app.funds.held_count(), 0);
}

#[tokio::test]
async fn test_get_unknown_saga() {
    let app = setup();

    let (status, _) = send(
        &app,
        "GET",
        "/orders/5f0c6f38-6a4b-4a53-9d3c-4d1f3b2a9e10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        "GET",
        "/orders/5f0c6f38-6a4b-4a53-9d3c-4d1f3b2a9e10/events",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_saga_id_format() {
    let app = setup();

    let (status, json) = send(&app, "GET", "/orders/not-a-uuid", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid saga ID"));
}

#[tokio::test]
async fn test_events_list_the_saga_log() {
    let app = setup();
    let saga_id = place(&app, order_body()).await;
    wait_for_terminal(&app, &saga_id).await;

    let (status, json) = send(&app, "GET", &format!("/orders/{saga_id}/events"), None).await;

    assert_eq!(status, StatusCode::OK);
    let events = json.as_array().unwrap();
    let types: Vec<&str> = events
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types.first(), Some(&"SagaStarted"));
    assert_eq!(types.last(), Some(&"ReservationCommitted"));
    assert!(types.contains(&"FundsReserved"));
    assert!(types.contains(&"OrderPlaced"));

    let versions: Vec<i64> = events
        .iter()
        .map(|e| e["version"].as_i64().unwrap())
        .collect();
    assert!(versions.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(events.iter().all(|e| e["saga_id"] == saga_id));
}

#[tokio::test]
async fn test_cancel_running_saga() {
    let app = setup();
    app.funds.set_latency(Duration::from_millis(200));

    let saga_id = place(&app, order_body()).await;
    let (status, json) = send(&app, "POST", &format!("/orders/{saga_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{json}");
    assert_eq!(json["status"], "CANCELLING");

    let json = wait_for_terminal(&app, &saga_id).await;
    assert_eq!(json["state"], "CANCELLED");
    assert_eq!(json["failure_kind"], "CANCELLED");
    assert_eq!(app.matching.order_count(), 0);
    assert_eq!(app.funds.held_count(), 0);
}

#[tokio::test]
async fn test_cancel_finished_saga_conflicts() {
    let app = setup();
    let saga_id = place(&app, order_body()).await;
    wait_for_terminal(&app, &saga_id).await;

    let (status, _) = send(&app, "POST", &format!("/orders/{saga_id}/cancel"), None).await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_unknown_saga() {
    let app = setup();

    let (status, _) = send(
        &app,
        "POST",
        "/orders/5f0c6f38-6a4b-4a53-9d3c-4d1f3b2a9e10/cancel",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_orders_rejected_after_shutdown() {
    let app = setup();
    app.runner.shutdown().await;

    let (status, _) = send(&app, "POST", "/orders", Some(order_body().to_string())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();
    let saga_id = place(&app, order_body()).await;
    wait_for_terminal(&app, &saga_id).await;

    let (status, _) = send(&app, "GET", "/metrics", None).await;

    assert_eq!(status, StatusCode::OK);
}
