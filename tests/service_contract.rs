//! drives the http client against real axum servers on ephemeral ports

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use thermo_bridge::client::{DataService, HttpDataService};
use thermo_bridge::error::{ServiceError, StatusClass};
use thermo_bridge::service::{self, Store};
use thermo_bridge::{SensorReading, DEFAULT_MIN_TEMPERATURE};

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_data_service() -> String {
    spawn(service::router(Arc::new(RwLock::new(Store::default())))).await
}

fn client(base: &str, timeout_ms: u64) -> HttpDataService {
    HttpDataService::new(base, Duration::from_millis(timeout_ms)).unwrap()
}

fn dht11() -> SensorReading {
    SensorReading { sensor: "DHT11".into(), temperature: 25.5, humidity: 60.0 }
}

#[tokio::test]
async fn fresh_service_serves_default_threshold() {
    let base = spawn_data_service().await;
    let config = client(&base, 2000).current_config().await.unwrap();
    assert_eq!(config.min_temperature, DEFAULT_MIN_TEMPERATURE);
}

#[tokio::test]
async fn latest_is_empty_until_a_reading_is_recorded() {
    let base = spawn_data_service().await;
    let client = client(&base, 2000);

    let empty = client.latest().await.unwrap();
    assert!(empty.reading.is_none());
    assert_eq!(empty.config.min_temperature, DEFAULT_MIN_TEMPERATURE);

    client.record_reading(&dht11()).await.unwrap();

    let latest = client.latest().await.unwrap();
    assert_eq!(latest.reading, Some(dht11()));
    assert!(latest.recorded_at.is_some());
}

#[tokio::test]
async fn updated_threshold_is_served_afterwards() {
    let base = spawn_data_service().await;
    let client = client(&base, 2000);

    let updated = client.update_config(35.5).await.unwrap();
    assert_eq!(updated.min_temperature, 35.5);

    assert_eq!(client.current_config().await.unwrap().min_temperature, 35.5);
    assert_eq!(client.latest().await.unwrap().config.min_temperature, 35.5);
}

#[tokio::test]
async fn incomplete_reading_is_rejected_with_detail() {
    let base = spawn_data_service().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/sensor-data", base))
        .json(&json!({"sensor": "DHT11", "temperature": 25.5}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("humidity"));

    let latest = client(&base, 2000).latest().await.unwrap();
    assert!(latest.reading.is_none());
}

#[tokio::test]
async fn update_config_requires_a_number() {
    let base = spawn_data_service().await;
    let http = reqwest::Client::new();

    let missing = http
        .post(format!("{}/api/update-config", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

    let text = http
        .post(format!("{}/api/update-config", base))
        .json(&json!({"min_temperature": "cold"}))
        .send()
        .await
        .unwrap();
    assert_eq!(text.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_json_bodies_get_a_detail_error() {
    let base = spawn_data_service().await;
    let http = reqwest::Client::new();

    let garbage = http
        .post(format!("{}/api/sensor-data", base))
        .header("content-type", "application/json")
        .body("temp=25.5")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = garbage.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().starts_with("incorrect json format"));

    let untyped = http
        .post(format!("{}/api/update-config", base))
        .body(r#"{"min_temperature": 30.0}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(untyped.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = untyped.json().await.unwrap();
    assert!(body["detail"].is_string());

    assert_eq!(client(&base, 2000).current_config().await.unwrap().min_temperature, DEFAULT_MIN_TEMPERATURE);
}

// ==============================================================================
// retry behaviour
// ==============================================================================

#[derive(Clone)]
struct Flaky {
    hits: Arc<AtomicUsize>,
    /// requests with index below this are answered too late
    slow_until: usize,
}

async fn slow_config(State(flaky): State<Flaky>) -> Json<Value> {
    let hit = flaky.hits.fetch_add(1, Ordering::SeqCst);
    if hit < flaky.slow_until {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Json(json!({"min_temperature": 30.0, "last_update": "2024-01-01T00:00:00"}))
}

async fn broken_config(State(flaky): State<Flaky>) -> (StatusCode, Json<Value>) {
    flaky.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "database unavailable"})))
}

#[tokio::test]
async fn timeout_is_retried_exactly_once() {
    let flaky = Flaky { hits: Arc::new(AtomicUsize::new(0)), slow_until: usize::MAX };
    let app = Router::new().route("/api/current-config", get(slow_config)).with_state(flaky.clone());
    let base = spawn(app).await;

    let err = client(&base, 100).current_config().await.unwrap_err();

    assert!(matches!(err, ServiceError::Timeout { attempts: 2 }));
    assert_eq!(flaky.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_after_timeout_can_succeed() {
    let flaky = Flaky { hits: Arc::new(AtomicUsize::new(0)), slow_until: 1 };
    let app = Router::new().route("/api/current-config", get(slow_config)).with_state(flaky.clone());
    let base = spawn(app).await;

    let config = client(&base, 100).current_config().await.unwrap();

    assert_eq!(config.min_temperature, 30.0);
    assert_eq!(flaky.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn error_status_is_not_retried() {
    let flaky = Flaky { hits: Arc::new(AtomicUsize::new(0)), slow_until: 0 };
    let app = Router::new().route("/api/current-config", get(broken_config)).with_state(flaky.clone());
    let base = spawn(app).await;

    let err = client(&base, 1000).current_config().await.unwrap_err();

    match &err {
        ServiceError::Status { status, message } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "database unavailable");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(err.class(), StatusClass::ServerError);
    assert_eq!(flaky.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}", addr), 1000)
        .record_reading(&dht11())
        .await
        .unwrap_err();

    assert_eq!(err.class(), StatusClass::Network);
}
