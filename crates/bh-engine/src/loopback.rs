//! Deterministic in-process engine for offline testing and demos.
//!
//! No real packets are routed: handles, the command server and the command
//! feeds are all backed by in-memory state with configurable failure
//! injection, so lifecycle and reconnect behavior can be exercised without a
//! native engine build. All tests run in memory; no external network
//! dependencies.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::{
    CommandConnection, CommandEvent, CommandServer, CommandTransport, Engine, EngineDirs,
    EngineError, EngineHandle,
};
use bh_types::FeedKind;

/// Failure injection knobs. Default: everything succeeds.
#[derive(Clone, Debug, Default)]
pub struct LoopbackBehavior {
    pub fail_setup: bool,
    pub fail_command_server: bool,
    pub fail_build_config: Option<String>,
    pub fail_new_service: Option<String>,
    pub fail_start: Option<String>,
    pub fail_close: Option<String>,
}

#[derive(Default)]
struct EngineState {
    behavior: LoopbackBehavior,
    memory_limit: AtomicBool,
    local_dns: AtomicBool,
    command_servers: Mutex<Vec<LoopbackCommandServer>>,
    handles: Mutex<Vec<LoopbackHandle>>,
}

/// The in-process engine library.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    state: Arc<EngineState>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: LoopbackBehavior) -> Self {
        Self {
            state: Arc::new(EngineState {
                behavior,
                ..EngineState::default()
            }),
        }
    }

    pub fn memory_limit_enabled(&self) -> bool {
        self.state.memory_limit.load(Ordering::Relaxed)
    }

    pub fn local_dns_registered(&self) -> bool {
        self.state.local_dns.load(Ordering::Relaxed)
    }

    /// Command servers created so far, oldest first.
    pub fn command_servers(&self) -> Vec<LoopbackCommandServer> {
        self.state.command_servers.lock().clone()
    }

    /// Handles created so far, oldest first.
    pub fn handles(&self) -> Vec<LoopbackHandle> {
        self.state.handles.lock().clone()
    }
}

impl Engine for LoopbackEngine {
    type Handle = LoopbackHandle;
    type CommandServer = LoopbackCommandServer;

    fn setup(&self, dirs: &EngineDirs) -> Result<(), EngineError> {
        if self.state.behavior.fail_setup {
            return Err(EngineError::Service("loopback setup refused".into()));
        }
        tracing::debug!(
            target: "bh_engine::loopback",
            base = %dirs.base_dir.display(),
            working = %dirs.working_dir.display(),
            cache = %dirs.cache_dir.display(),
            "engine setup"
        );
        Ok(())
    }

    fn redirect_stderr(&self, path: &Path) -> Result<(), EngineError> {
        std::fs::File::create(path)?;
        Ok(())
    }

    fn parse_config(&self, path: &Path, _temp_path: &Path, _debug: bool) -> String {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => return format!("read {}: {e}", path.display()),
        };
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(_) => String::new(),
            Err(e) => format!("invalid config: {e}"),
        }
    }

    fn build_config(&self, path: &Path, options_json: &str) -> Result<String, EngineError> {
        if let Some(msg) = &self.state.behavior.fail_build_config {
            return Err(EngineError::Config(msg.clone()));
        }
        let options: serde_json::Value = serde_json::from_str(options_json)
            .map_err(|e| EngineError::Config(format!("invalid options: {e}")))?;
        Ok(json!({
            "profile": path.display().to_string(),
            "options": options,
        })
        .to_string())
    }

    fn new_service(&self, config: &str) -> Result<Self::Handle, EngineError> {
        if let Some(msg) = &self.state.behavior.fail_new_service {
            return Err(EngineError::Service(msg.clone()));
        }
        if config.is_empty() {
            return Err(EngineError::Service("empty config".into()));
        }
        let handle = LoopbackHandle {
            inner: Arc::new(HandleState {
                fail_start: self.state.behavior.fail_start.clone(),
                fail_close: self.state.behavior.fail_close.clone(),
                ..HandleState::default()
            }),
        };
        self.state.handles.lock().push(handle.clone());
        Ok(handle)
    }

    fn new_command_server(&self) -> Result<Self::CommandServer, EngineError> {
        if self.state.behavior.fail_command_server {
            return Err(EngineError::CommandEndpoint(
                "local socket creation blocked by platform sandbox".into(),
            ));
        }
        let server = LoopbackCommandServer {
            inner: Arc::new(CommandServerState::default()),
        };
        self.state.command_servers.lock().push(server.clone());
        Ok(server)
    }

    fn set_memory_limit(&self, enabled: bool) {
        self.state.memory_limit.store(enabled, Ordering::Relaxed);
    }

    fn register_local_dns(&self, enabled: bool) {
        self.state.local_dns.store(enabled, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct HandleState {
    running: AtomicBool,
    closed: AtomicBool,
    paused: AtomicBool,
    fail_start: Option<String>,
    fail_close: Option<String>,
}

/// Reference-typed running service instance.
#[derive(Clone)]
pub struct LoopbackHandle {
    inner: Arc<HandleState>,
}

impl LoopbackHandle {
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }
}

impl EngineHandle for LoopbackHandle {
    fn start(&self) -> Result<(), EngineError> {
        if let Some(msg) = &self.inner.fail_start {
            return Err(EngineError::Service(msg.clone()));
        }
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Service("handle already closed".into()));
        }
        self.inner.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.closed.store(true, Ordering::Relaxed);
        if let Some(msg) = &self.inner.fail_close {
            return Err(EngineError::Service(msg.clone()));
        }
        Ok(())
    }

    fn pause(&self) {
        self.inner.paused.store(true, Ordering::Relaxed);
    }

    fn wake(&self) {
        self.inner.paused.store(false, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CommandServerState {
    started: AtomicBool,
    closed: AtomicBool,
    service: Mutex<Option<LoopbackHandle>>,
}

/// In-memory command/control endpoint.
#[derive(Clone)]
pub struct LoopbackCommandServer {
    inner: Arc<CommandServerState>,
}

impl LoopbackCommandServer {
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    pub fn has_service(&self) -> bool {
        self.inner.service.lock().is_some()
    }
}

impl CommandServer for LoopbackCommandServer {
    type Handle = LoopbackHandle;

    fn start(&self) -> Result<(), EngineError> {
        self.inner.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn set_service(&self, handle: Option<Self::Handle>) {
        *self.inner.service.lock() = handle;
    }

    fn close(&self) -> Result<(), EngineError> {
        self.inner.started.store(false, Ordering::Relaxed);
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

struct ConnInner {
    queue: VecDeque<CommandEvent>,
    closed: bool,
    reason: Option<String>,
}

struct ConnState {
    state: Mutex<ConnInner>,
    cond: Condvar,
    kind: FeedKind,
}

/// One live in-memory command feed connection.
#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Arc<ConnState>,
}

impl LoopbackConnection {
    fn new(kind: FeedKind) -> Self {
        Self {
            inner: Arc::new(ConnState {
                state: Mutex::new(ConnInner {
                    queue: VecDeque::new(),
                    closed: false,
                    reason: None,
                }),
                cond: Condvar::new(),
                kind,
            }),
        }
    }

    pub fn kind(&self) -> FeedKind {
        self.inner.kind
    }

    /// Queue an event for the reader. Returns false once closed.
    pub fn push(&self, event: CommandEvent) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(event);
        self.inner.cond.notify_one();
        true
    }

    /// End the stream with a transport-supplied reason.
    pub fn close_with_reason(&self, reason: impl Into<String>) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.reason = Some(reason.into());
        self.inner.cond.notify_all();
    }
}

impl CommandConnection for LoopbackConnection {
    fn next_event(&self) -> Result<CommandEvent, EngineError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(EngineError::Disconnected(state.reason.clone()));
            }
            self.inner.cond.wait(&mut state);
        }
    }

    fn close(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.cond.notify_all();
        Ok(())
    }
}

struct TransportState {
    dial_failures: u32,
    attempts: AtomicU32,
    conns: Mutex<Vec<LoopbackConnection>>,
}

/// Command connection factory with configurable dial failures: the first
/// `dial_failures` connect calls are refused, every later one succeeds.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<TransportState>,
}

impl LoopbackTransport {
    pub fn new(dial_failures: u32) -> Self {
        Self {
            state: Arc::new(TransportState {
                dial_failures,
                attempts: AtomicU32::new(0),
                conns: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::Relaxed)
    }

    pub fn last_connection(&self) -> Option<LoopbackConnection> {
        self.state.conns.lock().last().cloned()
    }
}

impl CommandTransport for LoopbackTransport {
    type Conn = LoopbackConnection;

    fn connect(&self, kind: FeedKind) -> Result<Self::Conn, EngineError> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.state.dial_failures {
            return Err(EngineError::CommandEndpoint(format!(
                "dial refused (attempt {attempt})"
            )));
        }
        let conn = LoopbackConnection::new(kind);
        self.state.conns.lock().push(conn.clone());
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_embeds_options() {
        let engine = LoopbackEngine::new();
        let out = engine
            .build_config(Path::new("/tmp/profile.json"), r#"{"mode":"rule"}"#)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["options"]["mode"], "rule");
    }

    #[test]
    fn build_config_rejects_bad_options() {
        let engine = LoopbackEngine::new();
        let err = engine
            .build_config(Path::new("/tmp/profile.json"), "not json")
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn parse_config_reports_engine_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"inbounds":[]}"#).unwrap();
        let engine = LoopbackEngine::new();
        assert_eq!(engine.parse_config(&good, dir.path(), false), "");

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{nope").unwrap();
        assert!(engine
            .parse_config(&bad, dir.path(), false)
            .contains("invalid config"));
    }

    #[test]
    fn handle_lifecycle_flags() {
        let engine = LoopbackEngine::new();
        let handle = engine.new_service("{}").unwrap();
        handle.start().unwrap();
        assert!(handle.is_running());
        handle.pause();
        assert!(handle.is_paused());
        handle.wake();
        assert!(!handle.is_paused());
        handle.close().unwrap();
        assert!(handle.is_closed());
        assert!(!handle.is_running());
    }

    #[test]
    fn transport_refuses_then_accepts() {
        let transport = LoopbackTransport::new(2);
        assert!(transport.connect(FeedKind::Status).is_err());
        assert!(transport.connect(FeedKind::Status).is_err());
        let conn = transport.connect(FeedKind::Status).unwrap();
        assert_eq!(transport.attempts(), 3);

        conn.push(CommandEvent::Log(Some("hello".into())));
        match conn.next_event().unwrap() {
            CommandEvent::Log(Some(m)) => assert_eq!(m, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        conn.close_with_reason("done");
        match conn.next_event() {
            Err(EngineError::Disconnected(Some(reason))) => assert_eq!(reason, "done"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
