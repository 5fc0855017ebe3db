//! ==============================================================================
//! controller.rs - connect / disconnect lifecycle
//! ==============================================================================
//!
//! purpose:
//!     the only thing allowed to start or stop the bridge loop. the operator
//!     (cli, or any front end) sends commands here and watches the status
//!     channel; it never touches the device session directly.
//!
//! guarantees:
//!     - at most one bridge loop (and so one device session) at a time
//!     - disconnect cancels the loop and joins its task before returning, so
//!       the session is closed by the loop itself, after its last iteration
//!     - disconnect is idempotent and fine after the loop stopped on its own
//!
//! ==============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeFault, BridgeLoop, BridgeSettings, BridgeState, BridgeStatus, FaultKind, StatusSender};
use crate::client::DataService;
use crate::error::ControllerError;
use crate::session::DeviceOpener;

struct ActiveBridge {
    port: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BridgeController {
    opener: Arc<dyn DeviceOpener>,
    service: Arc<dyn DataService>,
    settings: BridgeSettings,
    status: StatusSender,
    active: Option<ActiveBridge>,
}

impl BridgeController {
    pub fn new(
        opener: Arc<dyn DeviceOpener>,
        service: Arc<dyn DataService>,
        settings: BridgeSettings,
    ) -> Self {
        let (tx, _rx) = watch::channel(BridgeStatus::default());
        Self {
            opener,
            service,
            settings,
            status: Arc::new(tx),
            active: None,
        }
    }

    /// open `port` and start the bridge loop on its own task
    pub async fn connect(&mut self, port: &str) -> Result<(), ControllerError> {
        if let Some(active) = &self.active {
            if self.loop_running(active) {
                return Err(ControllerError::AlreadyConnected(active.port.clone()));
            }
            // loop ended on its own (device unplugged); reap it before reconnecting
            self.disconnect().await;
        }

        tracing::info!(port, "Connecting");
        let device = match self.opener.open(port).await {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(port, error = %e, "Connect failed");
                self.status.send_modify(|s| {
                    s.state = BridgeState::Idle;
                    s.last_error = Some(BridgeFault { kind: FaultKind::Connect, message: e.to_string() });
                });
                return Err(e.into());
            }
        };

        self.status.send_replace(BridgeStatus {
            state: BridgeState::Polling,
            port: Some(port.to_string()),
            ..BridgeStatus::default()
        });

        let cancel = CancellationToken::new();
        let bridge = BridgeLoop::new(device, self.service.clone(), self.settings.clone(), self.status.clone());
        let handle = tokio::spawn(bridge.run(cancel.clone()));

        self.active = Some(ActiveBridge { port: port.to_string(), cancel, handle });
        tracing::info!(port, "Connected");
        Ok(())
    }

    /// stop the loop, wait for it, release the device
    pub async fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            tracing::error!(port = %active.port, error = %e, "Bridge task ended abnormally");
        }
        self.status.send_modify(|s| s.state = BridgeState::Idle);
        tracing::info!(port = %active.port, "Disconnected");
    }

    /// true while a loop is running (not merely after it stopped itself)
    pub fn is_connected(&self) -> bool {
        self.active.as_ref().is_some_and(|a| self.loop_running(a))
    }

    /// the loop publishes Idle as its last act, a moment before its task
    /// finishes; either one means it is done
    fn loop_running(&self, active: &ActiveBridge) -> bool {
        !active.handle.is_finished() && self.status.borrow().state != BridgeState::Idle
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    /// read-only status feed for a front end
    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{FakeDevice, FakeService};
    use crate::error::ConnectError;
    use crate::session::{DeviceLink, ReadOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// hands out FakeDevices; keeps a handle to each so tests can inspect them
    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<FakeDevice>>,
        refuse: Mutex<bool>,
    }

    impl FakeOpener {
        fn device(&self, index: usize) -> FakeDevice {
            self.opened.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl DeviceOpener for FakeOpener {
        async fn open(&self, port: &str) -> Result<Box<dyn DeviceLink>, ConnectError> {
            if *self.refuse.lock().unwrap() {
                return Err(ConnectError::Open { port: port.to_string(), reason: "no such device".into() });
            }
            let device = FakeDevice::new();
            self.opened.lock().unwrap().push(device.clone());
            Ok(Box::new(device))
        }
    }

    fn controller(opener: &Arc<FakeOpener>) -> BridgeController {
        let settings = BridgeSettings {
            read_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
            show_sensor_data: false,
        };
        let opener: Arc<dyn DeviceOpener> = opener.clone();
        BridgeController::new(opener, Arc::new(FakeService::default()), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_is_rejected() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);

        controller.connect("/dev/ttyACM0").await.unwrap();
        let err = controller.connect("/dev/ttyACM1").await.unwrap_err();

        assert!(matches!(err, ControllerError::AlreadyConnected(ref p) if p == "/dev/ttyACM0"));
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        controller.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_joins_loop_and_closes_device() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);

        controller.connect("/dev/ttyACM0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(controller.status().state, BridgeState::Polling);

        controller.disconnect().await;

        let device = opener.device(0);
        assert!(!device.is_open());
        assert_eq!(*device.closes.lock().unwrap(), 1);
        assert!(!controller.is_connected());
        assert_eq!(controller.status().state, BridgeState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_twice_is_same_as_once() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);
        controller.connect("/dev/ttyACM0").await.unwrap();

        controller.disconnect().await;
        let after_first = controller.status();
        controller.disconnect().await;

        assert_eq!(controller.status(), after_first);
        assert_eq!(*opener.device(0).closes.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_after_device_went_away() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);
        let mut status = controller.subscribe();

        controller.connect("/dev/ttyACM0").await.unwrap();
        opener.device(0).queue(ReadOutcome::Closed);
        status.wait_for(|s| s.state == BridgeState::Idle).await.unwrap();

        assert!(!controller.is_connected());
        controller.disconnect().await;
        assert_eq!(controller.status().last_error.unwrap().kind, FaultKind::Device);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_allowed_after_loop_stopped_itself() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);
        let mut status = controller.subscribe();

        controller.connect("/dev/ttyACM0").await.unwrap();
        opener.device(0).queue(ReadOutcome::Closed);
        status.wait_for(|s| s.state == BridgeState::Idle).await.unwrap();

        controller.connect("/dev/ttyACM0").await.unwrap();
        assert!(controller.is_connected());
        assert_eq!(opener.opened.lock().unwrap().len(), 2);
        controller.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_right_after_idle_is_not_rejected() {
        let opener = Arc::new(FakeOpener::default());
        let mut controller = controller(&opener);
        let mut status = controller.subscribe();

        for round in 0..3 {
            controller.connect("/dev/ttyACM0").await.unwrap();
            opener.device(round).queue(ReadOutcome::Closed);
            status.wait_for(|s| s.state == BridgeState::Idle).await.unwrap();
            assert!(!controller.is_connected());
        }

        assert_eq!(opener.opened.lock().unwrap().len(), 3);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn failed_open_is_reported_and_leaves_controller_idle() {
        let opener = Arc::new(FakeOpener::default());
        *opener.refuse.lock().unwrap() = true;
        let mut controller = controller(&opener);

        let err = controller.connect("/dev/nothing").await.unwrap_err();

        assert!(matches!(err, ControllerError::Connect(_)));
        assert!(!controller.is_connected());
        let status = controller.status();
        assert_eq!(status.state, BridgeState::Idle);
        assert_eq!(status.last_error.unwrap().kind, FaultKind::Connect);
    }
}
