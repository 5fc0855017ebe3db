//! ==============================================================================
//! service.rs - reference data service
//! ==============================================================================
//!
//! purpose:
//!     implements the data-service contract the bridge depends on, backed by an
//!     in-memory store. the bridge records readings and fetches the threshold;
//!     the operator reads the latest reading and edits the threshold.
//!
//! routes:
//!     POST /api/sensor-data      {sensor, temperature, humidity}
//!     GET  /api/current-config   -> {min_temperature, last_update}
//!     POST /api/update-config    {min_temperature}
//!     GET  /api/latest-data      -> {sensor_data | null, current_config}
//!     GET  /health
//!
//! errors are answered as {"detail": "..."} with a 4xx status, including
//! bodies that are not json at all.
//!
//! ==============================================================================

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domain::{SensorReading, ThresholdConfig};

/// threshold served when no configuration has ever been written
pub const DEFAULT_MIN_TEMPERATURE: f64 = 40.0;

// ==============================================================================
// store
// ==============================================================================

#[derive(Debug, Clone)]
pub struct StoredReading {
    pub reading: SensorReading,
    pub recorded_at: NaiveDateTime,
}

#[derive(Debug, Default)]
pub struct Store {
    latest: Option<StoredReading>,
    config: Option<ThresholdConfig>,
    readings_recorded: u64,
}

impl Store {
    pub fn record(&mut self, reading: SensorReading) -> &StoredReading {
        self.readings_recorded += 1;
        self.latest.insert(StoredReading { reading, recorded_at: now() })
    }

    pub fn set_threshold(&mut self, min_temperature: f64) -> ThresholdConfig {
        let config = ThresholdConfig { min_temperature, last_update: now() };
        self.config = Some(config.clone());
        config
    }

    /// configured threshold, or the default stamped with the current time
    pub fn current_config(&self) -> ThresholdConfig {
        self.config.clone().unwrap_or_else(|| ThresholdConfig {
            min_temperature: DEFAULT_MIN_TEMPERATURE,
            last_update: now(),
        })
    }

    pub fn latest(&self) -> Option<&StoredReading> {
        self.latest.as_ref()
    }

    pub fn readings_recorded(&self) -> u64 {
        self.readings_recorded
    }
}

pub type SharedStore = Arc<RwLock<Store>>;

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        tracing::warn!(status = status.as_u16(), error = %self, "Rejected request");
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("incorrect json format: {}", rejection.body_text()))
    }
}

// ==============================================================================
// router
// ==============================================================================

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sensor-data", post(record_handler))
        .route("/api/current-config", get(current_config_handler))
        .route("/api/update-config", post(update_config_handler))
        .route("/api/latest-data", get(latest_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(store)
}

/// serve until `shutdown` resolves
pub async fn run_server(
    listener: tokio::net::TcpListener,
    store: SharedStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Data service listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(store): State<SharedStore>) -> Json<Value> {
    let store = store.read().await;
    Json(json!({ "status": "ok", "readings_recorded": store.readings_recorded() }))
}

/// POST /api/sensor-data
async fn record_handler(
    State(store): State<SharedStore>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let reading = SensorReading::from_frame(body.clone())
        .map_err(|e| ApiError::BadRequest(format!("incorrect json format: {}", e.0)))?;

    tracing::debug!(sensor = %reading.sensor, temperature = reading.temperature, humidity = reading.humidity, "Reading recorded");
    store.write().await.record(reading);

    Ok(Json(json!({
        "status": "success",
        "message": "reading recorded",
        "received_data": body,
    })))
}

/// GET /api/current-config
async fn current_config_handler(State(store): State<SharedStore>) -> Json<ThresholdConfig> {
    Json(store.read().await.current_config())
}

/// POST /api/update-config
async fn update_config_handler(
    State(store): State<SharedStore>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let min_temperature = match body.get("min_temperature") {
        None => return Err(ApiError::BadRequest("min_temperature is required".into())),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| ApiError::BadRequest("min_temperature must be a number".into()))?,
    };

    let config = store.write().await.set_threshold(min_temperature);
    tracing::info!(min_temperature, "Threshold updated");

    Ok(Json(json!({
        "status": "success",
        "message": "configuration updated",
        "new_config": {
            "min_temperature": config.min_temperature,
            "update_time": config.last_update,
        },
    })))
}

/// GET /api/latest-data
async fn latest_handler(State(store): State<SharedStore>) -> Json<Value> {
    let store = store.read().await;
    let config = store.current_config();

    let sensor_data = store.latest().map(|stored| {
        json!({
            "sensor": stored.reading.sensor,
            "temperature": stored.reading.temperature,
            "humidity": stored.reading.humidity,
            "timestamp": stored.recorded_at,
        })
    });

    Json(json!({
        "sensor_data": sensor_data,
        "current_config": {
            "min_temperature": config.min_temperature,
            "last_update": config.last_update,
        },
    }))
}
