//! Engine-host side of the bridge.
//!
//! Loopback-only TCP listener. Each connection may register as a listener
//! (push callbacks) and issue request/reply commands; registrations are
//! back-references only and die with the connection, so a remote process
//! crash cleans its listener entry up without cooperation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::SupervisorHandle;

use super::proto::{self, Frame, Push, Reply, Request, RequestFrame};

const OUTBOUND_QUEUE: usize = 64;

/// Remote callback registrations, keyed by connection.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    next: AtomicU64,
    active: DashMap<u64, SocketAddr>,
}

impl ListenerRegistry {
    fn add(&self, peer: SocketAddr) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.insert(id, peer);
        id
    }

    fn remove(&self, id: u64) {
        self.active.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// The bridge endpoint owned by the engine-host process.
pub struct BridgeServer {
    supervisor: SupervisorHandle,
    registry: Arc<ListenerRegistry>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl BridgeServer {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self {
            supervisor,
            registry: Arc::new(ListenerRegistry::default()),
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<ListenerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Count of currently registered remote listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind and start accepting. Loopback addresses only.
    pub async fn bind(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        if !addr.ip().is_loopback() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bridge endpoint must bind a loopback address",
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(target: "bh_core::bridge", listen = %local, "bridge endpoint bound");

        let supervisor = self.supervisor.clone();
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if !peer.ip().is_loopback() {
                                warn!(target: "bh_core::bridge", %peer, "non-loopback peer rejected");
                                continue;
                            }
                            let supervisor = supervisor.clone();
                            let registry = Arc::clone(&registry);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                handle_conn(stream, peer, supervisor, registry, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "bh_core::bridge", error = %e, "accept failed");
                        }
                    }
                }
            }
            debug!(target: "bh_core::bridge", "bridge accept loop ended");
        });

        Ok(local)
    }

    /// Stop accepting and tear down every connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    supervisor: SupervisorHandle,
    registry: Arc<ListenerRegistry>,
    shutdown: CancellationToken,
) {
    debug!(target: "bh_core::bridge", %peer, "connection opened");
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut events = supervisor.subscribe();
    let mut registered: Option<u64> = None;

    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(write_half, out_rx));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let frame = answer(&line, peer, &supervisor, &registry, &mut registered).await;
                        let Ok(encoded) = proto::encode_line(&frame) else { continue };
                        if out_tx.send(encoded).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            event = events.recv(), if registered.is_some() => {
                match event {
                    Ok(event) => {
                        let frame = Frame::Push { push: Push::from(event) };
                        let Ok(encoded) = proto::encode_line(&frame) else { continue };
                        if out_tx.send(encoded).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "bh_core::bridge", %peer, missed, "listener lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let Some(id) = registered.take() {
        registry.remove(id);
    }
    drop(out_tx);
    let _ = writer.await;
    debug!(target: "bh_core::bridge", %peer, "connection closed");
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::Receiver<String>) {
    while let Some(line) = out_rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn answer(
    line: &str,
    peer: SocketAddr,
    supervisor: &SupervisorHandle,
    registry: &Arc<ListenerRegistry>,
    registered: &mut Option<u64>,
) -> Frame {
    let frame: RequestFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "bh_core::bridge", %peer, error = %e, "malformed request");
            return Frame::Reply {
                id: 0,
                reply: Reply::Error {
                    message: format!("malformed request: {e}"),
                },
            };
        }
    };

    let reply = match frame.request {
        Request::Hello { register } => {
            if register && registered.is_none() {
                *registered = Some(registry.add(peer));
                debug!(target: "bh_core::bridge", %peer, "listener registered");
            }
            Reply::Ok
        }
        Request::Status => Reply::Status {
            status: supervisor.status().ordinal(),
        },
        Request::Capabilities => {
            let caps = supervisor.capabilities();
            Reply::Capabilities {
                command_endpoint: caps.command_endpoint,
            }
        }
        Request::RecentLogs => Reply::Logs {
            messages: supervisor.recent_logs(),
        },
        Request::Start => {
            supervisor.start().await;
            Reply::Ok
        }
        Request::Stop => {
            supervisor.stop().await;
            Reply::Ok
        }
        Request::Reload => {
            supervisor.reload().await;
            Reply::Ok
        }
        Request::DeviceIdle { idle } => {
            supervisor.device_idle(idle).await;
            Reply::Ok
        }
    };

    Frame::Reply {
        id: frame.id,
        reply,
    }
}
