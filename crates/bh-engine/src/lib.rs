//! bh-engine: the boundary to the supervised packet-routing engine.
//!
//! The engine itself is an external, opaque library (typically FFI into a
//! native core). This crate pins down the exact surface the supervisor
//! consumes — config parsing/building, service handles, the optional command
//! server and the typed command feeds — as traits, so the lifecycle layer is
//! testable against a deterministic in-process implementation
//! ([`loopback`]) and swappable for the production bindings.
//!
//! All trait methods are blocking, FFI-style; callers hop them onto
//! background workers (`spawn_blocking`) rather than expecting async here.

use std::fmt;
use std::path::{Path, PathBuf};

use bh_types::FeedKind;
use thiserror::Error;

pub mod loopback;

/// Errors surfaced by the engine library.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be parsed or built.
    #[error("config: {0}")]
    Config(String),

    /// Service construction or start/close failed.
    #[error("service: {0}")]
    Service(String),

    /// Command server / command connection failure.
    #[error("command endpoint: {0}")]
    CommandEndpoint(String),

    /// A streaming command connection ended, with an optional reason from
    /// the transport.
    #[error("disconnected{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Disconnected(Option<String>),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Directories the engine runs against, established once per process by the
/// supervisor's bootstrap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineDirs {
    pub base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl EngineDirs {
    /// Target file for the engine's stderr redirection.
    pub fn stderr_log(&self) -> PathBuf {
        self.working_dir.join("stderr.log")
    }

    /// Debug snapshot of the fully built config, written when debug mode is
    /// on.
    pub fn config_snapshot(&self) -> PathBuf {
        self.working_dir.join("current-config.json")
    }
}

/// A running engine instance. Reference-typed (cheap to clone, FFI-handle
/// semantics); the lifecycle controller is the single logical owner.
pub trait EngineHandle: Clone + Send + Sync + 'static {
    fn start(&self) -> Result<(), EngineError>;
    fn close(&self) -> Result<(), EngineError>;

    /// Power-saving hooks; no-op bridges into the engine.
    fn pause(&self);
    fn wake(&self);
}

/// The optional command/control endpoint bound to a running handle.
/// Its absence degrades control features but never the primary lifecycle.
pub trait CommandServer: Send + Sync + 'static {
    type Handle: EngineHandle;

    fn start(&self) -> Result<(), EngineError>;

    /// Attach or detach the running service. Detach (`None`) before closing
    /// the handle.
    fn set_service(&self, handle: Option<Self::Handle>);

    fn close(&self) -> Result<(), EngineError>;
}

/// The engine library surface consumed by the supervisor.
pub trait Engine: Send + Sync + 'static {
    type Handle: EngineHandle;
    type CommandServer: CommandServer<Handle = Self::Handle>;

    /// One-time process setup (allocators, globals). Best-effort; failures
    /// are logged by the caller, not fatal.
    fn setup(&self, dirs: &EngineDirs) -> Result<(), EngineError>;

    /// Redirect the engine's stderr into the working directory.
    fn redirect_stderr(&self, path: &Path) -> Result<(), EngineError>;

    /// Validate a config file. Returns the engine's error text, empty when
    /// the config is valid (engine-surface convention).
    fn parse_config(&self, path: &Path, temp_path: &Path, debug: bool) -> String;

    /// Resolve the final engine config from the active profile path and the
    /// options blob.
    fn build_config(&self, path: &Path, options_json: &str) -> Result<String, EngineError>;

    fn new_service(&self, config: &str) -> Result<Self::Handle, EngineError>;

    fn new_command_server(&self) -> Result<Self::CommandServer, EngineError>;

    fn set_memory_limit(&self, enabled: bool);

    /// Register/unregister the local DNS transport side-effect.
    fn register_local_dns(&self, enabled: bool);
}

/// Periodic status snapshot carried on the `Status` feed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub memory_bytes: u64,
    pub tasks: u32,
    pub connections_in: u32,
    pub connections_out: u32,
    pub uplink: u64,
    pub downlink: u64,
    pub uplink_total: u64,
    pub downlink_total: u64,
}

/// One selectable outbound inside a group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundGroupItem {
    pub tag: String,
    pub kind: String,
    pub url_test_time_ms: u64,
    pub url_test_delay_ms: u16,
}

/// An outbound group snapshot carried on the `Groups`/`GroupOnly` feeds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundGroup {
    pub tag: String,
    pub kind: String,
    pub selectable: bool,
    pub selected: String,
    pub items: Vec<OutboundGroupItem>,
}

/// Lazy cursor over group snapshots; consumers drain it into an ordered list
/// before handing it to callbacks.
pub type GroupCursor = Box<dyn Iterator<Item = OutboundGroup> + Send>;

/// One message from a streaming command connection. Payloads are optional at
/// this layer; the client swallows absent payloads instead of forwarding
/// empty-but-present data.
pub enum CommandEvent {
    Status(Option<StatusSnapshot>),
    Groups(Option<GroupCursor>),
    Log(Option<String>),
    ClearLog,
    ClashModeInit { modes: Vec<String>, current: String },
    ClashMode(String),
}

impl fmt::Debug for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => f.debug_tuple("Status").field(s).finish(),
            Self::Groups(g) => f
                .debug_tuple("Groups")
                .field(&g.as_ref().map(|_| "<cursor>"))
                .finish(),
            Self::Log(m) => f.debug_tuple("Log").field(m).finish(),
            Self::ClearLog => f.write_str("ClearLog"),
            Self::ClashModeInit { modes, current } => f
                .debug_struct("ClashModeInit")
                .field("modes", modes)
                .field("current", current)
                .finish(),
            Self::ClashMode(m) => f.debug_tuple("ClashMode").field(m).finish(),
        }
    }
}

/// One live streaming connection to the engine's command endpoint.
/// Reference-typed like [`EngineHandle`]; `next_event` blocks until a message
/// arrives or the connection ends with [`EngineError::Disconnected`].
pub trait CommandConnection: Clone + Send + Sync + 'static {
    fn next_event(&self) -> Result<CommandEvent, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

/// Factory for streaming command connections, one per feed kind.
pub trait CommandTransport: Send + Sync + 'static {
    type Conn: CommandConnection;

    fn connect(&self, kind: FeedKind) -> Result<Self::Conn, EngineError>;
}
