//! ==============================================================================
//! bridge.rs - the device bridge loop
//! ==============================================================================
//!
//! purpose:
//!     relays readings from the microcontroller to the data service and pushes
//!     the current minimum-temperature threshold back down.
//!
//! per iteration:
//!
//!     ┌────────────┐   frame    ┌──────────────┐  record   ┌──────────────┐
//!     │   device   │ ─────────► │ bridge loop  │ ────────► │ data service │
//!     │  (serial)  │ ◄───────── │ (this file)  │ ◄──────── │   (http)     │
//!     └────────────┘  threshold └──────────────┘  config   └──────────────┘
//!
//!     1. read a frame (bounded wait, a timeout just means "no reading")
//!     2. validate + record it (bad frames are dropped, never forwarded)
//!     3. fetch the current threshold (failure abandons the iteration)
//!     4. write {"min_temperature": x} to the device
//!     5. sleep poll_interval
//!
//! states: Idle -> Polling -> Stopping -> Idle
//!
//! Stopping is published as soon as cancellation is seen, while the in-flight
//! service call is still allowed to finish.
//!
//! nothing here ends the process. service errors are logged and the loop
//! carries on; a closed device ends the loop. every fault is published on the
//! status channel for the lifecycle controller.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::DataService;
use crate::domain::{SensorReading, ThresholdConfig, ThresholdFrame};
use crate::session::{DeviceLink, ReadOutcome, WriteOutcome};

// ==============================================================================
// status
// ==============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    #[default]
    Idle,
    Polling,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Connect,
    Frame,
    Validation,
    Service,
    Device,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeFault {
    pub kind: FaultKind,
    pub message: String,
}

/// snapshot published by the loop after every state change or fault
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub port: Option<String>,
    pub frames_received: u64,
    pub readings_forwarded: u64,
    pub frames_rejected: u64,
    pub service_errors: u64,
    pub thresholds_sent: u64,
    pub last_threshold: Option<f64>,
    pub last_error: Option<BridgeFault>,
}

pub type StatusSender = Arc<watch::Sender<BridgeStatus>>;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// bound on each read_frame wait
    pub read_timeout: Duration,
    /// sleep between iterations
    pub poll_interval: Duration,
    /// log every reading at info instead of debug
    pub show_sensor_data: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_secs(1),
            show_sensor_data: true,
        }
    }
}

/// whether the loop should keep going after an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

// ==============================================================================
// the loop
// ==============================================================================

pub struct BridgeLoop {
    device: Box<dyn DeviceLink>,
    service: Arc<dyn DataService>,
    settings: BridgeSettings,
    status: StatusSender,
    /// last threshold fetched; replaced wholesale on every poll
    threshold: Option<ThresholdConfig>,
}

impl BridgeLoop {
    pub fn new(
        device: Box<dyn DeviceLink>,
        service: Arc<dyn DataService>,
        settings: BridgeSettings,
        status: StatusSender,
    ) -> Self {
        Self { device, service, settings, status, threshold: None }
    }

    /// run until `cancel` fires or the device closes; always closes the device
    pub async fn run(mut self, cancel: CancellationToken) {
        self.status.send_modify(|s| s.state = BridgeState::Polling);
        tracing::info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            read_timeout_ms = self.settings.read_timeout.as_millis() as u64,
            "Bridge loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // a cancel mid-iteration lets the in-flight call drain, but says so right away
            let status = self.status.clone();
            let flow = {
                let work = self.iterate(&cancel);
                tokio::pin!(work);
                tokio::select! {
                    flow = &mut work => flow,
                    _ = cancel.cancelled() => {
                        status.send_modify(|s| s.state = BridgeState::Stopping);
                        tracing::info!("Shutdown requested, draining in-flight call");
                        work.await
                    }
                }
            };
            if flow == Flow::Stop {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.status.send_modify(|s| s.state = BridgeState::Stopping);
        self.device.close();
        self.status.send_modify(|s| s.state = BridgeState::Idle);
        tracing::info!("Bridge loop stopped");
    }

    /// one read -> record -> fetch -> write pass
    pub(crate) async fn iterate(&mut self, cancel: &CancellationToken) -> Flow {
        // 1. read (interruptible; a pending read holds no half-consumed state)
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Flow::Stop,
            outcome = self.device.read_frame(self.settings.read_timeout) => outcome,
        };

        // 2. validate + record
        match outcome {
            ReadOutcome::Frame(value) => {
                self.status.send_modify(|s| s.frames_received += 1);
                self.forward(value).await;
            }
            ReadOutcome::Timeout => {
                tracing::trace!("No frame within read timeout");
            }
            ReadOutcome::Invalid(e) => {
                tracing::warn!(error = %e, "Dropped undecodable frame");
                self.fault(FaultKind::Frame, e.to_string(), |s| s.frames_rejected += 1);
            }
            ReadOutcome::Closed => {
                tracing::warn!("Device closed, stopping bridge");
                self.fault(FaultKind::Device, "device closed".to_string(), |_| {});
                return Flow::Stop;
            }
        }

        // 3. fetch threshold
        let config = match self.service.current_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(class = %e.class(), error = %e, "Could not fetch threshold, skipping write");
                self.fault(FaultKind::Service, e.to_string(), |s| s.service_errors += 1);
                return Flow::Continue;
            }
        };

        if self.threshold.as_ref().map(|t| t.min_temperature) != Some(config.min_temperature) {
            tracing::info!(min_temperature = config.min_temperature, last_update = %config.last_update, "Threshold changed");
        }
        let frame = ThresholdFrame::from(&config);
        self.threshold = Some(config);

        // 4. push threshold to device
        match self.device.write_frame(&frame).await {
            Ok(WriteOutcome::Sent) => {}
            Ok(WriteOutcome::Stalled) => {
                self.fault(FaultKind::Device, "threshold write stalled".to_string(), |_| {});
                return Flow::Continue;
            }
            Err(_) => {
                tracing::warn!("Device closed during write, stopping bridge");
                self.fault(FaultKind::Device, "device closed during write".to_string(), |_| {});
                return Flow::Stop;
            }
        }

        self.status.send_modify(|s| {
            s.thresholds_sent += 1;
            s.last_threshold = Some(frame.min_temperature);
        });
        Flow::Continue
    }

    async fn forward(&mut self, value: Value) {
        let reading = match SensorReading::from_frame(value) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(error = %e, "Dropped invalid reading");
                self.fault(FaultKind::Validation, e.to_string(), |s| s.frames_rejected += 1);
                return;
            }
        };

        if self.settings.show_sensor_data {
            tracing::info!(sensor = %reading.sensor, "Temp: {:.1}°C | Humidity: {:.1}%", reading.temperature, reading.humidity);
        } else {
            tracing::debug!(sensor = %reading.sensor, temperature = reading.temperature, humidity = reading.humidity, "Reading");
        }

        match self.service.record_reading(&reading).await {
            Ok(()) => self.status.send_modify(|s| s.readings_forwarded += 1),
            Err(e) => {
                tracing::warn!(class = %e.class(), error = %e, "Could not record reading");
                self.fault(FaultKind::Service, e.to_string(), |s| s.service_errors += 1);
            }
        }
    }

    fn fault(&self, kind: FaultKind, message: String, bump: impl FnOnce(&mut BridgeStatus)) {
        self.status.send_modify(|s| {
            bump(s);
            s.last_error = Some(BridgeFault { kind, message });
        });
    }
}

// ==============================================================================
// tests
// ==============================================================================
