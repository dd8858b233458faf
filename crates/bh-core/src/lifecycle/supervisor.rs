//! Supervisor event loop.
//!
//! Owns the [`LifecycleController`] and serializes its operations: control
//! messages (from the bridge, the CLI or OS signals) are drained one at a
//! time, so start/stop/reload handlers never overlap. Lifecycle signals
//! (stop, reload, device-idle) are only forwarded while the controller has
//! its signal listener bound, mirroring a receiver that is registered at
//! start and unregistered at stop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bh_engine::Engine;
use bh_types::{Capabilities, CapabilitySnapshot, ServiceStatus};

use crate::logbuf::LogBuffer;

use super::{LifecycleController, ServiceEvent};

const CONTROL_QUEUE: usize = 32;

/// Messages understood by the supervisor event loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlMsg {
    Start,
    Stop,
    Reload,
    DeviceIdle(bool),
}

/// Cloneable handle for driving and observing a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<ControlMsg>,
    status_rx: watch::Receiver<ServiceStatus>,
    events: broadcast::Sender<ServiceEvent>,
    logs: Arc<Mutex<LogBuffer>>,
    capabilities: Arc<Capabilities>,
    terminated: CancellationToken,
}

impl SupervisorHandle {
    pub fn status(&self) -> ServiceStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.logs.lock().snapshot()
    }

    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.capabilities.snapshot()
    }

    pub async fn send(&self, msg: ControlMsg) {
        if self.tx.send(msg).await.is_err() {
            debug!(target: "bh_core::lifecycle", ?msg, "supervisor gone, control message dropped");
        }
    }

    pub async fn start(&self) {
        self.send(ControlMsg::Start).await;
    }

    pub async fn stop(&self) {
        self.send(ControlMsg::Stop).await;
    }

    pub async fn reload(&self) {
        self.send(ControlMsg::Reload).await;
    }

    pub async fn device_idle(&self, idle: bool) {
        self.send(ControlMsg::DeviceIdle(idle)).await;
    }

    /// Resolves once the controller has stopped and the host process may
    /// terminate itself.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }
}

/// The running event loop around one [`LifecycleController`].
pub struct Supervisor {
    handle: SupervisorHandle,
    join: JoinHandle<()>,
}

impl Supervisor {
    pub fn start<E: Engine>(mut controller: LifecycleController<E>) -> Self {
        let (tx, mut rx) = mpsc::channel(CONTROL_QUEUE);
        let handle = SupervisorHandle {
            tx,
            status_rx: controller.status_receiver(),
            events: controller.events_sender(),
            logs: controller.logs(),
            capabilities: controller.capabilities(),
            terminated: CancellationToken::new(),
        };
        let terminated = handle.terminated.clone();

        let join = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    ControlMsg::Start => controller.on_start_requested().await,
                    ControlMsg::Stop => {
                        if !controller.signals_bound() {
                            debug!(target: "bh_core::lifecycle", "stop signal while unbound, dropped");
                            continue;
                        }
                        if controller.on_stop_requested().await {
                            terminated.cancel();
                        }
                    }
                    ControlMsg::Reload => {
                        if !controller.signals_bound() {
                            debug!(target: "bh_core::lifecycle", "reload signal while unbound, dropped");
                            continue;
                        }
                        controller.on_reload_requested().await;
                    }
                    ControlMsg::DeviceIdle(idle) => {
                        if controller.signals_bound() {
                            controller.on_device_idle_changed(idle);
                        }
                    }
                }
            }
        });

        Self { handle, join }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Tear the event loop down without draining; used on host shutdown.
    pub fn abort(&self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ServiceSettings, SharedSettings};
    use bh_engine::loopback::LoopbackEngine;
    use std::time::Duration;

    fn spawn_supervisor(engine: &LoopbackEngine) -> Supervisor {
        let dir = tempfile::tempdir().unwrap().into_path();
        let profile = dir.join("profile.json");
        std::fs::write(&profile, "{}").unwrap();
        let settings = SharedSettings::new(ServiceSettings {
            active_config_path: profile.display().to_string(),
            config_options: r#"{"mode":"rule"}"#.to_string(),
            active_profile_name: "sup".to_string(),
            ..ServiceSettings::default()
        });
        let controller =
            LifecycleController::new(Arc::new(engine.clone()), settings, dir)
                .with_reload_settle(Duration::ZERO);
        Supervisor::start(controller)
    }

    async fn wait_status(handle: &SupervisorHandle, expected: ServiceStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.status() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status never became {expected}"));
    }

    #[tokio::test]
    async fn start_then_stop_terminates() {
        let engine = LoopbackEngine::new();
        let sup = spawn_supervisor(&engine);
        let handle = sup.handle();

        handle.start().await;
        wait_status(&handle, ServiceStatus::Started).await;
        assert!(!handle.is_terminated());

        handle.stop().await;
        wait_status(&handle, ServiceStatus::Stopped).await;
        tokio::time::timeout(Duration::from_secs(1), handle.terminated())
            .await
            .expect("terminated token");
    }

    #[tokio::test]
    async fn signals_before_start_are_dropped() {
        let engine = LoopbackEngine::new();
        let sup = spawn_supervisor(&engine);
        let handle = sup.handle();

        handle.reload().await;
        handle.stop().await;
        handle.start().await;
        wait_status(&handle, ServiceStatus::Started).await;

        // Only the one start produced a handle; the earlier signals did not
        // bounce the service.
        assert_eq!(engine.handles().len(), 1);
        assert!(!handle.is_terminated());
    }

    #[tokio::test]
    async fn operations_are_serialized_in_arrival_order() {
        let engine = LoopbackEngine::new();
        let sup = spawn_supervisor(&engine);
        let handle = sup.handle();
        let mut events = handle.subscribe();

        handle.start().await;
        handle.reload().await;
        handle.stop().await;
        wait_status(&handle, ServiceStatus::Stopped).await;
        handle.terminated().await;

        let mut statuses = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let ServiceEvent::StatusChanged(s) = ev {
                statuses.push(s);
            }
        }
        assert_eq!(
            statuses,
            vec![
                ServiceStatus::Starting,
                ServiceStatus::Started,
                ServiceStatus::Starting,
                ServiceStatus::Started,
                ServiceStatus::Stopping,
                ServiceStatus::Stopped,
            ]
        );
        assert_eq!(engine.handles().len(), 2);
    }
}
