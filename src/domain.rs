use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// one reading as sent by the microcontroller
/// e.g. {"sensor": "DHT11", "temperature": 25.5, "humidity": 60.0}
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SensorReading {
    /// sensor tag reported by the firmware (e.g., "DHT11")
    pub sensor: String,
    /// temperature in celsius
    pub temperature: f64,
    /// relative humidity (0-100%)
    pub humidity: f64,
}

impl SensorReading {
    /// validate a decoded device frame
    ///
    /// all three fields must be present, `sensor` a string and the other two
    /// json numbers. extra fields are ignored.
    pub fn from_frame(frame: serde_json::Value) -> Result<Self, ValidationError> {
        if !frame.is_object() {
            return Err(ValidationError(format!("expected a json object, got {}", frame)));
        }
        serde_json::from_value(frame).map_err(|e| ValidationError(e.to_string()))
    }
}

/// minimum-temperature threshold as held by the data service
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ThresholdConfig {
    pub min_temperature: f64,
    pub last_update: NaiveDateTime,
}

/// downstream frame written to the device: {"min_temperature": 40.0}
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct ThresholdFrame {
    pub min_temperature: f64,
}

impl From<&ThresholdConfig> for ThresholdFrame {
    fn from(config: &ThresholdConfig) -> Self {
        Self { min_temperature: config.min_temperature }
    }
}

/// latest reading plus current threshold, as the presentation layer sees it
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct LatestData {
    /// `None` until the first reading has been recorded
    pub reading: Option<SensorReading>,
    pub recorded_at: Option<NaiveDateTime>,
    pub config: ThresholdConfig,
}
