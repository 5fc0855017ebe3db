//! ==============================================================================
//! client.rs - typed client for the data service
//! ==============================================================================
//!
//! purpose:
//!     the bridge loop and the operator commands talk to the data service only
//!     through `DataService`. the http implementation adds a per-request timeout
//!     and a single retry when (and only when) that timeout fires.
//!
//! relationships:
//!     - used by: bridge.rs (record + fetch config), main.rs (latest, update)
//!     - talks to: service.rs routes (or any server honouring the same contract)
//!
//! ==============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;

use crate::domain::{LatestData, SensorReading, ThresholdConfig};
use crate::error::ServiceError;
use crate::service::DEFAULT_MIN_TEMPERATURE;

/// retries allowed after a request timeout
pub const TIMEOUT_RETRIES: u32 = 1;

/// the data-service contract as the rest of the crate sees it
#[async_trait]
pub trait DataService: Send + Sync {
    async fn record_reading(&self, reading: &SensorReading) -> Result<(), ServiceError>;

    /// current threshold; the contract default when nothing was ever configured
    async fn current_config(&self) -> Result<ThresholdConfig, ServiceError>;

    async fn latest(&self) -> Result<LatestData, ServiceError>;

    async fn update_config(&self, min_temperature: f64) -> Result<ThresholdConfig, ServiceError>;
}

// ==============================================================================
// wire types
// ==============================================================================

#[derive(Deserialize)]
struct ConfigBody {
    min_temperature: Option<f64>,
    last_update: Option<NaiveDateTime>,
}

impl ConfigBody {
    fn into_config(self) -> ThresholdConfig {
        ThresholdConfig {
            min_temperature: self.min_temperature.unwrap_or(DEFAULT_MIN_TEMPERATURE),
            last_update: self.last_update.unwrap_or_else(now),
        }
    }
}

#[derive(Deserialize)]
struct UpdateBody {
    new_config: UpdatedConfig,
}

#[derive(Deserialize)]
struct UpdatedConfig {
    min_temperature: f64,
    update_time: Option<NaiveDateTime>,
}

#[derive(Deserialize)]
struct LatestBody {
    sensor_data: Option<LatestReading>,
    current_config: Option<ConfigBody>,
}

#[derive(Deserialize)]
struct LatestReading {
    #[serde(default)]
    sensor: String,
    temperature: f64,
    humidity: f64,
    timestamp: Option<NaiveDateTime>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ==============================================================================
// http implementation
// ==============================================================================

#[derive(Clone)]
pub struct HttpDataService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDataService {
    /// * `base_url` - e.g. `http://localhost:8000` (no trailing `/api`)
    /// * `timeout`  - bound on each individual attempt
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// send a request, retrying once if the attempt timed out
    ///
    /// definitive answers (any http status, connection refused, bad body) are
    /// never retried.
    async fn send<F>(&self, make: F) -> Result<reqwest::Response, ServiceError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match make().send().await {
                Ok(response) => return check_status(response).await,
                Err(e) if e.is_timeout() => {
                    if attempts > TIMEOUT_RETRIES {
                        return Err(ServiceError::Timeout { attempts });
                    }
                    tracing::warn!(url = ?e.url().map(|u| u.as_str()), attempts, "Request timed out, retrying");
                }
                Err(e) => return Err(ServiceError::Network(e.to_string())),
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.detail.or(b.error).or(b.message))
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.canonical_reason().unwrap_or("no reason").to_string()
            } else {
                text
            }
        });

    Err(ServiceError::Status { status: status.as_u16(), message })
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ServiceError> {
    response.json::<T>().await.map_err(|e| ServiceError::Decode(e.to_string()))
}

#[async_trait]
impl DataService for HttpDataService {
    async fn record_reading(&self, reading: &SensorReading) -> Result<(), ServiceError> {
        let url = self.url("/api/sensor-data");
        self.send(|| self.http.post(&url).json(reading)).await?;
        Ok(())
    }

    async fn current_config(&self) -> Result<ThresholdConfig, ServiceError> {
        let url = self.url("/api/current-config");
        let response = self.send(|| self.http.get(&url)).await?;
        let body: ConfigBody = read_json(response).await?;
        Ok(body.into_config())
    }

    async fn latest(&self) -> Result<LatestData, ServiceError> {
        let url = self.url("/api/latest-data");
        let response = self.send(|| self.http.get(&url)).await?;
        let body: LatestBody = read_json(response).await?;

        let (reading, recorded_at) = match body.sensor_data {
            Some(r) => (
                Some(SensorReading {
                    sensor: r.sensor,
                    temperature: r.temperature,
                    humidity: r.humidity,
                }),
                r.timestamp,
            ),
            None => (None, None),
        };

        let config = body
            .current_config
            .map(ConfigBody::into_config)
            .unwrap_or_else(|| ThresholdConfig {
                min_temperature: DEFAULT_MIN_TEMPERATURE,
                last_update: now(),
            });

        Ok(LatestData { reading, recorded_at, config })
    }

    async fn update_config(&self, min_temperature: f64) -> Result<ThresholdConfig, ServiceError> {
        let url = self.url("/api/update-config");
        let payload = json!({ "min_temperature": min_temperature });
        let response = self.send(|| self.http.post(&url).json(&payload)).await?;
        let body: UpdateBody = read_json(response).await?;

        Ok(ThresholdConfig {
            min_temperature: body.new_config.min_temperature,
            last_update: body.new_config.update_time.unwrap_or_else(now),
        })
    }
}
