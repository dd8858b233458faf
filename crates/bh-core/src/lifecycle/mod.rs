//! Engine lifecycle: state machine, supervisor event loop and the events
//! pushed to registered listeners.

mod controller;
mod supervisor;

pub use controller::LifecycleController;
pub use supervisor::{ControlMsg, Supervisor, SupervisorHandle};

use bh_types::{Alert, ServiceStatus};

/// Events published by the lifecycle controller and fanned out to every
/// registered listener by the bridge. Alerts are delivered at most once per
/// failure; listeners that register later do not see them.
#[derive(Clone, Debug)]
pub enum ServiceEvent {
    StatusChanged(ServiceStatus),
    Alert(Alert),
    WriteLog(String),
    ResetLogs(Vec<String>),
}

/// Seam for the foreground/status notification owned by the controller.
/// Rendering is a platform concern; the default implementation just traces.
pub trait Notifier: Send + Sync + 'static {
    fn show_starting(&self, _profile: &str) {}
    fn show_started(&self, _profile: &str) {}
    fn close(&self) {}
}

/// Default notifier: structured log lines instead of OS notifications.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_starting(&self, profile: &str) {
        tracing::info!(target: "bh_core::lifecycle", profile = %profile, "status: starting");
    }

    fn show_started(&self, profile: &str) {
        tracing::info!(target: "bh_core::lifecycle", profile = %profile, "status: started");
    }

    fn close(&self) {
        tracing::debug!(target: "bh_core::lifecycle", "notification closed");
    }
}
