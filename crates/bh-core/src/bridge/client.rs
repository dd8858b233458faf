//! Front-end side of the bridge.
//!
//! `connect` is idempotent (an existing session is unbound first, "not
//! connected" being ignored), `disconnect` tolerates an already-unbound
//! client, and a binding death — the host process dying mid-session — turns
//! into an automatic bounded reconnect instead of a fatal error.
//!
//! All callback delivery happens on one dedicated dispatch task, so a
//! listener observes events in order for any single connection session. No
//! ordering is promised across a reconnect: after a rebind the current
//! status is re-queried and re-delivered.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bh_types::{AlertKind, CapabilitySnapshot, RetrySchedule, ServiceStatus};

use super::proto::{self, Frame, Push, Reply, Request, RequestFrame};

const OUTBOUND_QUEUE: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,
    #[error("bridge connection closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Observer callbacks, invoked in order on the client's dispatch task.
pub trait ServiceCallback: Send + Sync + 'static {
    fn on_status_changed(&self, status: ServiceStatus);
    fn on_alert(&self, _kind: AlertKind, _message: Option<String>) {}
    fn on_write_log(&self, _message: String) {}
    fn on_reset_logs(&self, _messages: Vec<String>) {}
}

enum DispatchMsg {
    Status(ServiceStatus),
    Push(Push),
}

struct ClientSession {
    out_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    generation: u64,
}

struct ClientInner {
    addr: SocketAddr,
    register: bool,
    reconnect: RetrySchedule,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    session: Mutex<Option<ClientSession>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchMsg>,
}

/// Cheap-to-clone bridge client bound to one remote endpoint.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    pub fn new(addr: SocketAddr, callback: Arc<dyn ServiceCallback>) -> Self {
        Self::with_options(addr, callback, true, RetrySchedule::default())
    }

    /// `register: false` builds a query-only client that receives no pushes.
    pub fn with_options(
        addr: SocketAddr,
        callback: Arc<dyn ServiceCallback>,
        register: bool,
        reconnect: RetrySchedule,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(dispatch_rx, callback));
        Self {
            inner: Arc::new(ClientInner {
                addr,
                register,
                reconnect,
                next_id: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                pending: DashMap::new(),
                session: Mutex::new(None),
                dispatch_tx,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Bind to the remote controller. Idempotent: any current session is
    /// unbound first.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.disconnect();
        self.establish().await
    }

    /// Unbind and release the session. A client that is not connected is
    /// left as-is.
    pub fn disconnect(&self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.cancel.cancel();
        }
        self.fail_pending();
    }

    /// Re-bind after a binding death: unbind (ignoring "not connected") and
    /// connect again, under the bounded reconnect schedule.
    pub async fn reconnect(&self) {
        for attempt in 1..=self.inner.reconnect.max_attempts {
            tokio::time::sleep(self.inner.reconnect.delay_before(attempt)).await;
            self.disconnect();
            match self.establish().await {
                Ok(()) => {
                    info!(target: "bh_core::bridge", attempt, "bridge rebound");
                    return;
                }
                Err(e) => {
                    debug!(target: "bh_core::bridge", attempt, error = %e, "rebind attempt failed");
                }
            }
        }
        error!(
            target: "bh_core::bridge",
            attempts = self.inner.reconnect.max_attempts,
            "bridge rebind failed, giving up"
        );
    }

    async fn establish(&self) -> Result<(), BridgeError> {
        let stream = TcpStream::connect(self.inner.addr).await?;
        let (read_half, write_half) = stream.into_split();

        let cancel = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        tokio::spawn(write_loop(write_half, out_rx, cancel.clone()));
        *self.inner.session.lock() = Some(ClientSession {
            out_tx,
            cancel: cancel.clone(),
            generation,
        });
        tokio::spawn(read_loop(self.clone(), read_half, cancel, generation));

        self.expect_ok(Request::Hello {
            register: self.inner.register,
        })
        .await?;

        // Deliver the live status to observers right away; a rebind may
        // replay the current status even if nothing changed.
        let status = self.status().await;
        let _ = self.inner.dispatch_tx.send(DispatchMsg::Status(status));
        Ok(())
    }

    /// Last known remote status. Unreachable remotes and malformed ordinals
    /// both degrade to `Stopped` instead of failing.
    pub async fn status(&self) -> ServiceStatus {
        match self.request(Request::Status).await {
            Ok(Reply::Status { status }) => {
                ServiceStatus::from_ordinal(status).unwrap_or(ServiceStatus::Stopped)
            }
            _ => ServiceStatus::Stopped,
        }
    }

    pub async fn capabilities(&self) -> Result<CapabilitySnapshot, BridgeError> {
        match self.request(Request::Capabilities).await? {
            Reply::Capabilities { command_endpoint } => {
                Ok(CapabilitySnapshot { command_endpoint })
            }
            Reply::Error { message } => Err(BridgeError::Remote(message)),
            _ => Err(BridgeError::Remote("unexpected reply".into())),
        }
    }

    pub async fn recent_logs(&self) -> Result<Vec<String>, BridgeError> {
        match self.request(Request::RecentLogs).await? {
            Reply::Logs { messages } => Ok(messages),
            Reply::Error { message } => Err(BridgeError::Remote(message)),
            _ => Err(BridgeError::Remote("unexpected reply".into())),
        }
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.expect_ok(Request::Start).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.expect_ok(Request::Stop).await
    }

    pub async fn reload(&self) -> Result<(), BridgeError> {
        self.expect_ok(Request::Reload).await
    }

    pub async fn device_idle(&self, idle: bool) -> Result<(), BridgeError> {
        self.expect_ok(Request::DeviceIdle { idle }).await
    }

    async fn expect_ok(&self, request: Request) -> Result<(), BridgeError> {
        match self.request(request).await? {
            Reply::Ok => Ok(()),
            Reply::Error { message } => Err(BridgeError::Remote(message)),
            _ => Err(BridgeError::Remote("unexpected reply".into())),
        }
    }

    async fn request(&self, request: Request) -> Result<Reply, BridgeError> {
        let out_tx = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.out_tx.clone())
            .ok_or(BridgeError::NotConnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let line = proto::encode_line(&RequestFrame { id, request })?;
        if out_tx.send(line).await.is_err() {
            self.inner.pending.remove(&id);
            return Err(BridgeError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(BridgeError::Timeout)
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let frame: Frame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "bh_core::bridge", error = %e, "malformed frame from host");
                return;
            }
        };
        match frame {
            Frame::Reply { id, reply } => {
                if let Some((_, tx)) = self.inner.pending.remove(&id) {
                    let _ = tx.send(reply);
                }
            }
            Frame::Push { push } => {
                let _ = self.inner.dispatch_tx.send(DispatchMsg::Push(push));
            }
        }
    }

    /// Drop the session entry if it still belongs to `generation`.
    fn clear_generation(&self, generation: u64) {
        let mut guard = self.inner.session.lock();
        if guard.as_ref().is_some_and(|s| s.generation == generation) {
            *guard = None;
        }
    }

    fn fail_pending(&self) {
        // Dropping the reply senders wakes every in-flight request with
        // `Closed`.
        self.inner.pending.clear();
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = out_rx.recv() => match line {
                Some(line) => {
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

fn read_loop(
    client: BridgeClient,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
    generation: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut lines = BufReader::new(read_half).lines();
        let deliberate = loop {
            tokio::select! {
                () = cancel.cancelled() => break true,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => client.handle_line(&line),
                    Ok(None) | Err(_) => break cancel.is_cancelled(),
                }
            }
        };

        if !deliberate {
            warn!(target: "bh_core::bridge", "bridge binding died, attempting rebind");
            client.clear_generation(generation);
            client.fail_pending();
            client.reconnect().await;
        }
    })
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<DispatchMsg>,
    callback: Arc<dyn ServiceCallback>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            DispatchMsg::Status(status) => callback.on_status_changed(status),
            DispatchMsg::Push(Push::StatusChanged { status }) => callback.on_status_changed(
                ServiceStatus::from_ordinal(status).unwrap_or(ServiceStatus::Stopped),
            ),
            DispatchMsg::Push(Push::Alert { kind, message }) => {
                match AlertKind::from_ordinal(kind) {
                    Some(kind) => callback.on_alert(kind, message),
                    None => {
                        warn!(target: "bh_core::bridge", kind, "unknown alert kind dropped");
                    }
                }
            }
            DispatchMsg::Push(Push::WriteLog { message }) => callback.on_write_log(message),
            DispatchMsg::Push(Push::ResetLogs { messages }) => callback.on_reset_logs(messages),
        }
    }
}
