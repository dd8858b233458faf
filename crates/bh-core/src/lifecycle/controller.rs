//! The engine lifecycle state machine.
//!
//! One controller per engine-host process. It is the only writer of the
//! authoritative [`ServiceStatus`] cell and the single owner of the engine
//! handle and the optional command endpoint. Operations are not re-entrant;
//! the [`super::Supervisor`] serializes them through its event loop.
//!
//! Failure policy: every error during start/reload is converted into an
//! [`Alert`], partially acquired resources are released, and the status is
//! forced back to `Stopped` — the controller never leaves the state machine
//! stuck in `Starting` or `Stopping`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use bh_engine::{CommandServer, Engine, EngineHandle};
use bh_types::{Alert, AlertKind, Capabilities, ServiceStatus};

use crate::bootstrap;
use crate::logbuf::LogBuffer;
use crate::settings::SharedSettings;

use super::{Notifier, ServiceEvent, TracingNotifier};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settle delay between reload teardown and restart, giving OS-level
/// teardown (routes, sockets) time to land.
const DEFAULT_RELOAD_SETTLE: Duration = Duration::from_millis(1000);

pub struct LifecycleController<E: Engine> {
    engine: Arc<E>,
    settings: SharedSettings,
    base_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    capabilities: Arc<Capabilities>,
    logs: Arc<Mutex<LogBuffer>>,
    status_tx: watch::Sender<ServiceStatus>,
    events_tx: broadcast::Sender<ServiceEvent>,
    handle: Option<E::Handle>,
    command_server: Option<E::CommandServer>,
    signals_bound: bool,
    reload_settle: Duration,
}

impl<E: Engine> LifecycleController<E> {
    pub fn new(engine: Arc<E>, settings: SharedSettings, base_dir: PathBuf) -> Self {
        Self::with_notifier(engine, settings, base_dir, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        engine: Arc<E>,
        settings: SharedSettings,
        base_dir: PathBuf,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::Stopped);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            settings,
            base_dir,
            notifier,
            capabilities: Arc::new(Capabilities::new()),
            logs: Arc::new(Mutex::new(LogBuffer::new())),
            status_tx,
            events_tx,
            handle: None,
            command_server: None,
            signals_bound: false,
            reload_settle: DEFAULT_RELOAD_SETTLE,
        }
    }

    /// Shrink the reload settle delay (tests).
    pub fn with_reload_settle(mut self, settle: Duration) -> Self {
        self.reload_settle = settle;
        self
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status_tx.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn events_sender(&self) -> broadcast::Sender<ServiceEvent> {
        self.events_tx.clone()
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        Arc::clone(&self.capabilities)
    }

    pub fn logs(&self) -> Arc<Mutex<LogBuffer>> {
        Arc::clone(&self.logs)
    }

    /// Whether the lifecycle-signal listener is currently bound; signals are
    /// only delivered between a start request and the matching stop.
    pub fn signals_bound(&self) -> bool {
        self.signals_bound
    }

    /// Append a line to the service log and push it to listeners.
    pub fn write_log(&self, message: impl Into<String>) {
        let message = message.into();
        self.logs.lock().push(message.clone());
        let _ = self.events_tx.send(ServiceEvent::WriteLog(message));
    }

    fn set_status(&self, status: ServiceStatus) {
        let changed = self.status_tx.send_replace(status) != status;
        if changed {
            metrics::counter!("bh_lifecycle_transitions_total", "to" => status.as_str())
                .increment(1);
            let _ = self.events_tx.send(ServiceEvent::StatusChanged(status));
        }
    }

    fn reset_logs(&self) {
        self.logs.lock().clear();
        let _ = self.events_tx.send(ServiceEvent::ResetLogs(Vec::new()));
    }

    /// Start the engine. Valid only from `Stopped`; a start request while
    /// already `Starting`/`Started` is a successful no-op.
    pub async fn on_start_requested(&mut self) {
        if self.status() != ServiceStatus::Stopped {
            debug!(target: "bh_core::lifecycle", status = %self.status(), "start ignored");
            return;
        }
        self.set_status(ServiceStatus::Starting);

        if let Err(e) = self.prepare() {
            warn!(target: "bh_core::lifecycle", error = %e, "bootstrap failed");
            self.stop_and_alert(AlertKind::StartCommandServer, Some(e.to_string()))
                .await;
            return;
        }

        self.start_service(false).await;
    }

    /// Steps (a)–(c): directory/env bootstrap, signal listener binding and
    /// the optional command endpoint.
    fn prepare(&mut self) -> std::io::Result<()> {
        bootstrap::ensure(self.engine.as_ref(), &self.base_dir)?;
        self.signals_bound = true;
        self.start_command_server();
        Ok(())
    }

    /// Command endpoint creation is a soft degrade: without it the engine
    /// still routes, only node switching is unavailable. The outcome is
    /// surfaced through the capability flag.
    fn start_command_server(&mut self) {
        if self.command_server.is_some() {
            return;
        }
        let started = self
            .engine
            .new_command_server()
            .and_then(|server| server.start().map(|()| server));
        match started {
            Ok(server) => {
                info!(target: "bh_core::lifecycle", "command endpoint started");
                self.command_server = Some(server);
                self.capabilities.set_command_endpoint(true);
            }
            Err(e) => {
                warn!(
                    target: "bh_core::lifecycle",
                    error = %e,
                    "command endpoint unavailable, node switching disabled"
                );
                self.command_server = None;
                self.capabilities.set_command_endpoint(false);
            }
        }
    }

    async fn start_service(&mut self, delay_start: bool) {
        if let Err(alert) = self.try_start(delay_start).await {
            self.stop_and_alert(alert.kind, alert.message).await;
        }
    }

    /// Steps (d)–(g). Any error reverts through [`Self::stop_and_alert`],
    /// which also releases whatever was acquired up to that point.
    async fn try_start(&mut self, delay_start: bool) -> Result<(), Alert> {
        let settings = self.settings.get();
        self.notifier.show_starting(&settings.active_profile_name);

        if settings.active_config_path.trim().is_empty() {
            return Err(Alert::new(AlertKind::EmptyConfiguration, None));
        }
        if settings.config_options.trim().is_empty() {
            return Err(Alert::new(AlertKind::EmptyConfiguration, None));
        }

        let engine = Arc::clone(&self.engine);
        let path = PathBuf::from(&settings.active_config_path);
        let options = settings.config_options.clone();
        let content = match spawn_blocking(move || engine.build_config(&path, &options)).await {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!(target: "bh_core::lifecycle", error = %e, "config build failed");
                return Err(Alert::new(AlertKind::EmptyConfiguration, Some(e.to_string())));
            }
            Err(e) => {
                return Err(Alert::new(AlertKind::StartService, Some(e.to_string())));
            }
        };

        if settings.debug_mode {
            if let Some(dirs) = bootstrap::dirs() {
                if let Err(e) = std::fs::write(dirs.config_snapshot(), &content) {
                    warn!(target: "bh_core::lifecycle", error = %e, "config snapshot write failed");
                }
            }
        }

        self.reset_logs();

        self.engine.register_local_dns(true);
        self.engine.set_memory_limit(!settings.disable_memory_limit);

        let engine = Arc::clone(&self.engine);
        let new_handle = match spawn_blocking(move || engine.new_service(&content)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(Alert::new(AlertKind::CreateService, Some(e.to_string())));
            }
            Err(e) => {
                return Err(Alert::new(AlertKind::CreateService, Some(e.to_string())));
            }
        };

        if delay_start {
            tokio::time::sleep(self.reload_settle).await;
        }

        let starting = new_handle.clone();
        let started = spawn_blocking(move || starting.start()).await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                Self::close_handle_quietly(&new_handle).await;
                return Err(Alert::new(AlertKind::StartService, Some(e.to_string())));
            }
            Err(e) => {
                Self::close_handle_quietly(&new_handle).await;
                return Err(Alert::new(AlertKind::StartService, Some(e.to_string())));
            }
        }

        if let Some(server) = &self.command_server {
            server.set_service(Some(new_handle.clone()));
        }
        self.handle = Some(new_handle);
        self.set_status(ServiceStatus::Started);
        self.notifier.show_started(&settings.active_profile_name);
        info!(
            target: "bh_core::lifecycle",
            profile = %settings.active_profile_name,
            "service started"
        );
        Ok(())
    }

    /// Reload the engine: tear the handle down (keeping the command endpoint
    /// alive) and re-run the start tail. Valid from `Started` or `Starting`;
    /// also used when connectivity-mode settings change.
    pub async fn on_reload_requested(&mut self) {
        if !matches!(
            self.status(),
            ServiceStatus::Started | ServiceStatus::Starting
        ) {
            debug!(target: "bh_core::lifecycle", status = %self.status(), "reload ignored");
            return;
        }
        self.notifier.close();
        self.set_status(ServiceStatus::Starting);

        if let Some(server) = &self.command_server {
            server.set_service(None);
        }
        self.detach_and_close_handle().await;

        self.start_service(true).await;
    }

    /// Stop the engine. Valid only from `Started`. Returns `true` when the
    /// host process may terminate itself.
    pub async fn on_stop_requested(&mut self) -> bool {
        if self.status() != ServiceStatus::Started {
            debug!(target: "bh_core::lifecycle", status = %self.status(), "stop ignored");
            return false;
        }
        self.set_status(ServiceStatus::Stopping);
        self.signals_bound = false;
        self.notifier.close();

        if let Some(server) = &self.command_server {
            server.set_service(None);
        }
        self.detach_and_close_handle().await;

        self.engine.register_local_dns(false);

        if let Some(server) = self.command_server.take() {
            if let Err(e) = server.close() {
                warn!(target: "bh_core::lifecycle", error = %e, "command endpoint close failed");
            }
            self.capabilities.set_command_endpoint(false);
        }

        self.set_status(ServiceStatus::Stopped);
        info!(target: "bh_core::lifecycle", "service stopped");
        true
    }

    /// Bridge the device power-saving signal into the engine. Only
    /// meaningful while `Started`; never changes the status.
    pub fn on_device_idle_changed(&self, idle: bool) {
        if self.status() != ServiceStatus::Started {
            return;
        }
        if let Some(handle) = &self.handle {
            if idle {
                handle.pause();
            } else {
                handle.wake();
            }
            debug!(target: "bh_core::lifecycle", idle, "device idle mode applied");
        }
    }

    /// Detach the current handle and close it defensively. Close failures go
    /// to the service log, never to the caller.
    async fn detach_and_close_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            let closing = handle.clone();
            match spawn_blocking(move || closing.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.write_log(format!("service: error when closing: {e}")),
                Err(e) => self.write_log(format!("service: error when closing: {e}")),
            }
        }
    }

    async fn close_handle_quietly(handle: &E::Handle) {
        let closing = handle.clone();
        if let Ok(Err(e)) = spawn_blocking(move || closing.close()).await {
            warn!(target: "bh_core::lifecycle", error = %e, "close after failed start");
        }
    }

    /// Convert a failure into an alert, release partially acquired resources
    /// and force the state machine back to `Stopped`.
    async fn stop_and_alert(&mut self, kind: AlertKind, message: Option<String>) {
        warn!(
            target: "bh_core::lifecycle",
            kind = %kind,
            message = message.as_deref().unwrap_or(""),
            "startup failed"
        );
        metrics::counter!("bh_lifecycle_alerts_total", "kind" => kind.as_str()).increment(1);

        self.signals_bound = false;
        self.notifier.close();

        if let Some(server) = &self.command_server {
            server.set_service(None);
        }
        self.detach_and_close_handle().await;
        if let Some(server) = self.command_server.take() {
            if let Err(e) = server.close() {
                warn!(target: "bh_core::lifecycle", error = %e, "command endpoint close failed");
            }
            self.capabilities.set_command_endpoint(false);
        }

        let _ = self
            .events_tx
            .send(ServiceEvent::Alert(Alert::new(kind, message)));
        self.set_status(ServiceStatus::Stopped);
    }
}
