//! Typed, retrying client for one streaming command feed.
//!
//! Each instance owns at most one live connection to the engine's command
//! endpoint. `connect` runs a bounded, sequential retry loop (linear backoff,
//! cancellable); once every attempt is spent the client stays disconnected
//! until the caller asks again — it never self-schedules a future retry.
//! Failures in one feed never affect another: every client carries its own
//! retry state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use bh_engine::{
    CommandConnection, CommandEvent, CommandTransport, EngineError, OutboundGroup, StatusSnapshot,
};
use bh_types::{FeedKind, RetrySchedule};

/// Receiver side of a command feed. Kind-specific callbacks default to
/// no-ops so a handler only implements what its feed carries.
pub trait CommandHandler: Send + Sync + 'static {
    fn on_connected(&self) {}
    fn on_disconnected(&self, _reason: Option<&str>) {}
    fn update_status(&self, _status: StatusSnapshot) {}
    fn update_groups(&self, _groups: Vec<OutboundGroup>) {}
    fn clear_log(&self) {}
    fn append_log(&self, _message: &str) {}
    fn initialize_clash_mode(&self, _modes: Vec<String>, _current: &str) {}
    fn update_clash_mode(&self, _mode: &str) {}
}

enum SessionState<C: CommandConnection> {
    Connecting(CancellationToken),
    Connected {
        conn: C,
        cancel: CancellationToken,
        pump: JoinHandle<()>,
    },
}

struct Session<C: CommandConnection> {
    generation: u64,
    state: SessionState<C>,
}

pub struct CommandClient<T: CommandTransport> {
    transport: Arc<T>,
    kind: FeedKind,
    handler: Arc<dyn CommandHandler>,
    schedule: RetrySchedule,
    generation: AtomicU64,
    session: Mutex<Option<Session<T::Conn>>>,
}

impl<T: CommandTransport> CommandClient<T> {
    pub fn new(transport: Arc<T>, kind: FeedKind, handler: Arc<dyn CommandHandler>) -> Self {
        Self::with_schedule(transport, kind, handler, RetrySchedule::default())
    }

    pub fn with_schedule(
        transport: Arc<T>,
        kind: FeedKind,
        handler: Arc<dyn CommandHandler>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            transport,
            kind,
            handler,
            schedule,
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.session.lock().as_ref().map(|s| &s.state),
            Some(SessionState::Connected { .. })
        )
    }

    /// Open the feed. Any existing session is torn down first. Returns true
    /// once connected; false when cancelled or after the schedule is
    /// exhausted (the caller decides whether to try again).
    pub async fn connect(&self) -> bool {
        self.disconnect();

        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.session.lock() = Some(Session {
            generation,
            state: SessionState::Connecting(cancel.clone()),
        });

        for attempt in 1..=self.schedule.max_attempts {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(target: "bh_core::command", feed = %self.kind, "connect cancelled mid-retry");
                    self.clear_generation(generation);
                    return false;
                }
                () = tokio::time::sleep(self.schedule.delay_before(attempt)) => {}
            }

            metrics::counter!("bh_command_connect_attempts_total", "feed" => self.kind.as_str())
                .increment(1);
            let transport = Arc::clone(&self.transport);
            let kind = self.kind;
            match spawn_blocking(move || transport.connect(kind)).await {
                Ok(Ok(conn)) => {
                    if cancel.is_cancelled() {
                        // Cancelled between dial and commit: tear the fresh
                        // connection down, retain nothing.
                        let _ = conn.close();
                        self.clear_generation(generation);
                        return false;
                    }
                    debug!(
                        target: "bh_core::command",
                        feed = %self.kind,
                        attempt,
                        "command feed connected"
                    );
                    self.handler.on_connected();
                    let pump = spawn_pump(
                        conn.clone(),
                        Arc::clone(&self.handler),
                        cancel.clone(),
                        self.kind,
                    );
                    *self.session.lock() = Some(Session {
                        generation,
                        state: SessionState::Connected { conn, cancel, pump },
                    });
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "bh_core::command",
                        feed = %self.kind,
                        attempt,
                        error = %e,
                        "command feed connect attempt failed"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "bh_core::command",
                        feed = %self.kind,
                        attempt,
                        error = %e,
                        "command feed dial task failed"
                    );
                }
            }
        }

        error!(
            target: "bh_core::command",
            feed = %self.kind,
            attempts = self.schedule.max_attempts,
            "command feed failed to connect, giving up"
        );
        self.clear_generation(generation);
        false
    }

    /// Best-effort close. The local handle is cleared even when the close
    /// call itself errors, so no stale reference survives.
    pub fn disconnect(&self) {
        let taken = self.session.lock().take();
        let Some(session) = taken else { return };
        match session.state {
            SessionState::Connecting(cancel) => cancel.cancel(),
            SessionState::Connected { conn, cancel, pump } => {
                cancel.cancel();
                if let Err(e) = conn.close() {
                    debug!(
                        target: "bh_core::command",
                        feed = %self.kind,
                        error = %e,
                        "close failed, handle cleared anyway"
                    );
                }
                pump.abort();
            }
        }
    }

    /// Drop our session entry unless a newer connect already replaced it.
    fn clear_generation(&self, generation: u64) {
        let mut guard = self.session.lock();
        if guard.as_ref().is_some_and(|s| s.generation == generation) {
            *guard = None;
        }
    }
}

/// Blocking reader loop: drains the connection and redelivers to the
/// handler. A cancelled token marks a deliberate disconnect, which is not
/// reported back through `on_disconnected`.
fn spawn_pump<C: CommandConnection>(
    conn: C,
    handler: Arc<dyn CommandHandler>,
    cancel: CancellationToken,
    kind: FeedKind,
) -> JoinHandle<()> {
    spawn_blocking(move || loop {
        match conn.next_event() {
            Ok(event) => {
                if cancel.is_cancelled() {
                    break;
                }
                dispatch(handler.as_ref(), event);
            }
            Err(EngineError::Disconnected(reason)) => {
                if !cancel.is_cancelled() {
                    warn!(
                        target: "bh_core::command",
                        feed = %kind,
                        reason = reason.as_deref().unwrap_or(""),
                        "command feed disconnected"
                    );
                    handler.on_disconnected(reason.as_deref());
                }
                break;
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!(target: "bh_core::command", feed = %kind, error = %e, "command feed read failed");
                    handler.on_disconnected(Some(&e.to_string()));
                }
                break;
            }
        }
    })
}

/// Absent payloads from the transport are swallowed, never forwarded as
/// empty-but-present data. Group cursors are drained into an ordered list
/// before delivery.
fn dispatch(handler: &dyn CommandHandler, event: CommandEvent) {
    match event {
        CommandEvent::Status(Some(status)) => handler.update_status(status),
        CommandEvent::Status(None) => {}
        CommandEvent::Groups(Some(cursor)) => handler.update_groups(cursor.collect()),
        CommandEvent::Groups(None) => {}
        CommandEvent::Log(Some(message)) if !message.is_empty() => handler.append_log(&message),
        CommandEvent::Log(_) => {}
        CommandEvent::ClearLog => handler.clear_log(),
        CommandEvent::ClashModeInit { modes, current } => {
            handler.initialize_clash_mode(modes, &current)
        }
        CommandEvent::ClashMode(mode) => handler.update_clash_mode(&mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bh_engine::loopback::LoopbackTransport;
    use bh_engine::OutboundGroupItem;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
        connected: AtomicU32,
        disconnected: AtomicU32,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn record(&self, line: String) {
            self.events.lock().push(line);
        }
    }

    impl CommandHandler for RecordingHandler {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }

        fn on_disconnected(&self, reason: Option<&str>) {
            self.disconnected.fetch_add(1, Ordering::Relaxed);
            self.record(format!("disconnected:{}", reason.unwrap_or("-")));
        }

        fn update_status(&self, status: StatusSnapshot) {
            self.record(format!("status:{}", status.connections_in));
        }

        fn update_groups(&self, groups: Vec<OutboundGroup>) {
            let tags: Vec<_> = groups.iter().map(|g| g.tag.as_str()).collect();
            self.record(format!("groups:{}", tags.join(",")));
        }

        fn clear_log(&self) {
            self.record("clear_log".into());
        }

        fn append_log(&self, message: &str) {
            self.record(format!("log:{message}"));
        }

        fn initialize_clash_mode(&self, modes: Vec<String>, current: &str) {
            self.record(format!("clash_init:{}:{current}", modes.join(",")));
        }

        fn update_clash_mode(&self, mode: &str) {
            self.record(format!("clash:{mode}"));
        }
    }

    fn fast_schedule(max_attempts: u32) -> RetrySchedule {
        RetrySchedule {
            max_attempts,
            base: Duration::from_millis(1),
            step: Duration::ZERO,
        }
    }

    fn client_with(
        transport: &LoopbackTransport,
        handler: Arc<RecordingHandler>,
        schedule: RetrySchedule,
    ) -> CommandClient<LoopbackTransport> {
        CommandClient::with_schedule(
            Arc::new(transport.clone()),
            FeedKind::Status,
            handler,
            schedule,
        )
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn connects_on_sixth_attempt_after_five_failures() {
        let transport = LoopbackTransport::new(5);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));

        assert!(client.connect().await);
        assert_eq!(transport.attempts(), 6);
        assert!(client.is_connected());
        assert_eq!(handler.connected.load(Ordering::Relaxed), 1);

        client.disconnect();
    }

    #[tokio::test]
    async fn gives_up_after_schedule_exhausted() {
        let transport = LoopbackTransport::new(u32::MAX);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));

        assert!(!client.connect().await);
        assert_eq!(transport.attempts(), 20);
        assert!(!client.is_connected());
        // Exhaustion is not a transport disconnect; no terminal callback.
        assert_eq!(handler.disconnected.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn disconnect_mid_retry_cancels_the_loop() {
        let transport = LoopbackTransport::new(u32::MAX);
        let handler = Arc::new(RecordingHandler::default());
        let client = Arc::new(CommandClient::with_schedule(
            Arc::new(transport.clone()),
            FeedKind::Status,
            handler as Arc<dyn CommandHandler>,
            RetrySchedule {
                max_attempts: 20,
                base: Duration::from_millis(40),
                step: Duration::from_millis(10),
            },
        ));

        let connecting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        client.disconnect();

        assert!(!connecting.await.unwrap());
        assert!(transport.attempts() < 20);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn delivers_events_and_swallows_empty_payloads() {
        let transport = LoopbackTransport::new(0);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));
        assert!(client.connect().await);

        let conn = transport.last_connection().unwrap();
        conn.push(CommandEvent::Log(None));
        conn.push(CommandEvent::Log(Some(String::new())));
        conn.push(CommandEvent::Log(Some("started".into())));
        conn.push(CommandEvent::Status(None));
        conn.push(CommandEvent::Status(Some(StatusSnapshot {
            connections_in: 7,
            ..StatusSnapshot::default()
        })));
        conn.push(CommandEvent::Groups(None));
        conn.push(CommandEvent::Groups(Some(Box::new(
            vec![
                OutboundGroup {
                    tag: "select".into(),
                    kind: "selector".into(),
                    selectable: true,
                    selected: "auto".into(),
                    items: vec![OutboundGroupItem::default()],
                },
                OutboundGroup {
                    tag: "auto".into(),
                    kind: "urltest".into(),
                    ..OutboundGroup::default()
                },
            ]
            .into_iter(),
        ))));
        conn.push(CommandEvent::ClearLog);
        conn.push(CommandEvent::ClashModeInit {
            modes: vec!["rule".into(), "global".into()],
            current: "rule".into(),
        });
        conn.push(CommandEvent::ClashMode("global".into()));

        wait_for(|| handler.events().len() >= 6).await;
        assert_eq!(
            handler.events(),
            vec![
                "log:started".to_string(),
                "status:7".to_string(),
                "groups:select,auto".to_string(),
                "clear_log".to_string(),
                "clash_init:rule,global:rule".to_string(),
                "clash:global".to_string(),
            ]
        );

        client.disconnect();
    }

    #[tokio::test]
    async fn transport_disconnect_reports_reason() {
        let transport = LoopbackTransport::new(0);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));
        assert!(client.connect().await);

        transport
            .last_connection()
            .unwrap()
            .close_with_reason("engine shutting down");

        wait_for(|| handler.disconnected.load(Ordering::Relaxed) == 1).await;
        assert_eq!(
            handler.events(),
            vec!["disconnected:engine shutting down".to_string()]
        );
    }

    #[tokio::test]
    async fn deliberate_disconnect_suppresses_callback() {
        let transport = LoopbackTransport::new(0);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));
        assert!(client.connect().await);

        client.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.disconnected.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn reconnect_tears_down_previous_session_first() {
        let transport = LoopbackTransport::new(0);
        let handler = Arc::new(RecordingHandler::default());
        let client = client_with(&transport, handler.clone(), fast_schedule(20));

        assert!(client.connect().await);
        let first = transport.last_connection().unwrap();
        assert!(client.connect().await);

        assert_eq!(transport.attempts(), 2);
        // The first connection no longer accepts events.
        assert!(!first.push(CommandEvent::ClearLog));
        assert!(client.is_connected());
        client.disconnect();
    }
}
