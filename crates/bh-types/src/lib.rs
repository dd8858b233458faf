//! bh-types: cross-crate stable contracts for the boxhost supervisor.
//!
//! Everything on the wire between the engine-host process and front-end
//! processes is defined here: the service status ordinals, alert kinds,
//! command feed kinds and the capability flags. Keep this crate dependency
//! light; `bh-core` and front-ends both build against it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Lifecycle state of the supervised engine, one authoritative cell per
/// engine-host process. Written only by the lifecycle controller.
///
/// Transitions are monotonic within one cycle:
/// `Stopped → Starting → Started → Stopping → Stopped`, with the single
/// shortcut `Starting → Stopped` when startup fails.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceStatus {
    /// Wire ordinal, matching the IPC contract (`status: u8`).
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Started => 2,
            Self::Stopping => 3,
        }
    }

    /// Defensive decode: out-of-range ordinals yield `None`, callers degrade
    /// to [`ServiceStatus::Stopped`] instead of failing.
    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Stopped),
            1 => Some(Self::Starting),
            2 => Some(Self::Started),
            3 => Some(Self::Stopping),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure categories raised by the lifecycle controller and pushed to every
/// currently registered listener, at most once per failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Active configuration path or options blob missing/blank.
    EmptyConfiguration,
    /// Engine construction (`new_service`) failed.
    CreateService,
    /// OS-level privilege or launch failure while starting the handle.
    StartService,
    /// Bootstrap or command-endpoint wrapper failure.
    StartCommandServer,
    /// Tunnel privilege not yet granted; recoverable by user action.
    RequestVpnPermission,
    /// Notification privilege not yet granted; recoverable by user action.
    RequestNotificationPermission,
}

impl AlertKind {
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::EmptyConfiguration => 0,
            Self::CreateService => 1,
            Self::StartService => 2,
            Self::StartCommandServer => 3,
            Self::RequestVpnPermission => 4,
            Self::RequestNotificationPermission => 5,
        }
    }

    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::EmptyConfiguration),
            1 => Some(Self::CreateService),
            2 => Some(Self::StartService),
            3 => Some(Self::StartCommandServer),
            4 => Some(Self::RequestVpnPermission),
            5 => Some(Self::RequestNotificationPermission),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyConfiguration => "empty_configuration",
            Self::CreateService => "create_service",
            Self::StartService => "start_service",
            Self::StartCommandServer => "start_command_server",
            Self::RequestVpnPermission => "request_vpn_permission",
            Self::RequestNotificationPermission => "request_notification_permission",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A startup/reload failure event. Not persisted; late-joining listeners do
/// not see it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: Option<String>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<Option<String>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Subscription category of a command channel client instance. Exactly one
/// per client; a process wanting several feeds instantiates several clients.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Status,
    Groups,
    Log,
    ClashMode,
    GroupOnly,
}

impl FeedKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Groups => "groups",
            Self::Log => "log",
            Self::ClashMode => "clash_mode",
            Self::GroupOnly => "group_only",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queryable capability flags of a running engine host.
///
/// Command-endpoint creation failure is a soft degrade; rather than only a
/// log line, the degradation is surfaced here so front-ends can disable
/// node-switching features deliberately.
#[derive(Debug, Default)]
pub struct Capabilities {
    command_endpoint: AtomicBool,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_endpoint(&self) -> bool {
        self.command_endpoint.load(Ordering::Relaxed)
    }

    pub fn set_command_endpoint(&self, available: bool) {
        self.command_endpoint.store(available, Ordering::Relaxed);
    }
}

/// Snapshot form of [`Capabilities`] for wire transfer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub command_endpoint: bool,
}

impl Capabilities {
    pub fn snapshot(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            command_endpoint: self.command_endpoint(),
        }
    }
}

/// Bounded linear backoff for the command channel client: attempt `i`
/// (1-based) sleeps `base + i * step` before dialing.
///
/// The constants are empirically chosen defaults, kept configurable instead
/// of hard-coded at call sites.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub base: Duration,
    pub step: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base: Duration::from_millis(100),
            step: Duration::from_millis(50),
        }
    }
}

impl RetrySchedule {
    /// Delay to wait before attempt `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base + self.step * attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordinals_round_trip() {
        for s in [
            ServiceStatus::Stopped,
            ServiceStatus::Starting,
            ServiceStatus::Started,
            ServiceStatus::Stopping,
        ] {
            assert_eq!(ServiceStatus::from_ordinal(s.ordinal()), Some(s));
        }
        assert_eq!(ServiceStatus::from_ordinal(4), None);
        assert_eq!(ServiceStatus::from_ordinal(255), None);
    }

    #[test]
    fn alert_ordinals_round_trip() {
        for k in [
            AlertKind::EmptyConfiguration,
            AlertKind::CreateService,
            AlertKind::StartService,
            AlertKind::StartCommandServer,
            AlertKind::RequestVpnPermission,
            AlertKind::RequestNotificationPermission,
        ] {
            assert_eq!(AlertKind::from_ordinal(k.ordinal()), Some(k));
        }
        assert_eq!(AlertKind::from_ordinal(6), None);
    }

    #[test]
    fn retry_schedule_is_linear() {
        let sched = RetrySchedule::default();
        assert_eq!(sched.delay_before(1), Duration::from_millis(150));
        assert_eq!(sched.delay_before(2), Duration::from_millis(200));
        assert_eq!(sched.delay_before(20), Duration::from_millis(1100));
    }

    #[test]
    fn capabilities_flag_toggles() {
        let caps = Capabilities::new();
        assert!(!caps.command_endpoint());
        caps.set_command_endpoint(true);
        assert!(caps.snapshot().command_endpoint);
    }
}
