//! ==============================================================================
//! thermo-bridge
//! ==============================================================================
//!
//! relays readings from a temperature/humidity microcontroller to a data
//! service and pushes the configured minimum temperature back down.
//!
//!     device ──serial──► session ──► bridge ──http──► data service
//!        ▲                              │
//!        └──────── {"min_temperature"} ─┘
//!
//! modules:
//!     - codec:      newline-delimited json frames
//!     - session:    one open serial connection (read/write frames, close)
//!     - bridge:     the polling loop and its status
//!     - client:     typed data-service client (timeout + one retry)
//!     - controller: connect / disconnect lifecycle
//!     - service:    reference data service (axum, in-memory)
//!     - config:     bridge.toml
//!
//! ==============================================================================

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod logging;
pub mod service;
pub mod session;

pub use bridge::{BridgeSettings, BridgeState, BridgeStatus};
pub use client::{DataService, HttpDataService};
pub use controller::BridgeController;
pub use domain::{LatestData, SensorReading, ThresholdConfig};
pub use service::DEFAULT_MIN_TEMPERATURE;
