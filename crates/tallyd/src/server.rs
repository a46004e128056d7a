//! The datagram server: socket setup, the event loop, and task wiring.
//!
//! Tasks:
//! - event loop: one `recv_from` per wake, decode, update the session, ack,
//!   hand complete messages to the dispatcher
//! - reaper: periodic sweep, see [`crate::reaper`]
//! - workers: see [`crate::dispatch`]

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tally_core::config::TallyConfig;
use tally_core::message::Message;
use tally_core::wire::{self, Packet};
use tally_services::{MessageRouter, ReceiveOutcome, SeriesStore, SessionRegistry};

use crate::dispatch::{self, deliver_response, DispatchError, Dispatcher, WorkerContext, WorkerPool};
use crate::reaper;

/// Receive buffer. Holds the largest possible UDP payload, so no datagram is
/// truncated. Inbound chunks are not held to the configured MTU, which only
/// sizes outbound chunks.
const RECV_BUFFER: usize = 65_536;

/// Bytes of an undecodable datagram included in the log line.
const PREVIEW_LEN: usize = 16;

pub struct Server {
    socket: Arc<UdpSocket>,
    config: TallyConfig,
    registry: SessionRegistry,
    store: Arc<dyn SeriesStore>,
}

impl Server {
    /// Bind the configured address. Port 0 picks a free port.
    pub async fn bind(config: TallyConfig, store: Arc<dyn SeriesStore>) -> Result<Self> {
        config.validate()?;
        let addr = config.network.socket_addr();
        let socket = UdpSocket::from_std(make_socket(addr)?).context("register socket")?;
        tracing::info!(addr = %socket.local_addr()?, "socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            config,
            registry: SessionRegistry::new(),
            store,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Start the event loop, reaper, and workers.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let chunk_size = wire::max_chunk_size(self.config.network.mtu);

        let (dispatcher, rx) = dispatch::channel(self.config.dispatch.queue_depth);
        let workers = WorkerPool::spawn(
            self.config.dispatch.workers,
            rx,
            Arc::new(WorkerContext {
                router: MessageRouter::new(self.store.clone(), self.registry.clone()),
                registry: self.registry.clone(),
                socket: self.socket.clone(),
                chunk_size,
            }),
        );

        let event_loop = tokio::spawn(
            EventLoop {
                socket: self.socket.clone(),
                registry: self.registry.clone(),
                dispatcher,
                chunk_size,
                recv_timeout: self.config.protocol.recv_timeout(),
                shutdown: shutdown_tx.subscribe(),
                shutdown_tx: shutdown_tx.clone(),
            }
            .run(),
        );

        let reaper = tokio::spawn(reaper::reaper_loop(
            self.registry.clone(),
            self.socket.clone(),
            self.config.protocol.clone(),
            shutdown_tx.subscribe(),
        ));

        tracing::info!(
            %local_addr,
            workers = workers.len(),
            queue_depth = self.config.dispatch.queue_depth,
            mtu = self.config.network.mtu,
            "server running"
        );

        Ok(ServerHandle {
            local_addr,
            registry: self.registry,
            shutdown_tx,
            event_loop,
            reaper,
            workers,
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
    event_loop: JoinHandle<Result<()>>,
    reaper: JoinHandle<()>,
    workers: WorkerPool,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Fires when shutdown starts, including after a fatal socket error.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the loop and reaper, let the workers drain, join everything.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let loop_result = self.event_loop.await.context("event loop panicked")?;
        if let Err(e) = self.reaper.await {
            tracing::warn!(error = %e, "reaper task failed");
        }
        // The event loop owned the dispatcher; its exit closed the queue.
        self.workers.join().await;

        tracing::info!(sessions = self.registry.len(), "server stopped");
        loop_result
    }
}

fn make_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind({addr})"))?;
    Ok(socket.into())
}

// ── Event loop ────────────────────────────────────────────────────────────────

struct EventLoop {
    socket: Arc<UdpSocket>,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    chunk_size: usize,
    recv_timeout: std::time::Duration,
    shutdown: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventLoop {
    async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("event loop shutting down");
                    return Ok(());
                }

                result = tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)) => {
                    let (len, peer) = match result {
                        Err(_elapsed) => continue,
                        Ok(Ok(r)) => r,
                        Ok(Err(e)) if is_transient(&e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "socket failed, stopping server");
                            let _ = self.shutdown_tx.send(());
                            return Err(e).context("recv_from");
                        }
                    };
                    self.handle_datagram(peer, &buf[..len]).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, peer: SocketAddr, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(
                    %peer,
                    error = %e,
                    preview = hex::encode(&data[..data.len().min(PREVIEW_LEN)]),
                    "dropping undecodable datagram"
                );
                return;
            }
        };

        let (handle, created) = self.registry.get_or_create(peer);
        if created {
            tracing::info!(%peer, "session created");
        }

        let mut delivered = None;
        let to_send: Vec<Bytes> = {
            let mut session = handle.lock().await;
            session.touch();
            match packet {
                Packet::Ack { sequence } => {
                    tracing::trace!(%peer, sequence, "ack");
                    session.on_ack(sequence)
                }
                Packet::Nack { sequence } => {
                    // Recovery is sender-driven; requests for chunks are not honoured.
                    tracing::debug!(%peer, sequence, "ignoring nack");
                    Vec::new()
                }
                Packet::Content {
                    sequence,
                    total,
                    payload,
                } => {
                    let outcome = session.on_content(sequence, total, payload);
                    tracing::trace!(%peer, sequence, total, ?outcome, "content");
                    let ack = outcome.ack().map(wire::encode_ack);
                    if let ReceiveOutcome::Complete { message, .. } = outcome {
                        delivered = Some(message);
                    }
                    ack.into_iter().collect()
                }
            }
        };

        transmit(&self.socket, peer, &to_send).await;

        if let Some(message) = delivered {
            tracing::debug!(%peer, len = message.len(), "message complete");
            match self.dispatcher.submit(peer, message) {
                Ok(()) => {}
                Err(DispatchError::QueueFull) => {
                    tracing::warn!(%peer, "dispatch queue full, rejecting message");
                    let busy = Message::error("server busy").render();
                    deliver_response(&self.registry, &self.socket, peer, &busy, self.chunk_size)
                        .await;
                }
                Err(DispatchError::Closed) => {
                    tracing::warn!(%peer, "dispatch queue closed, message dropped");
                }
            }
        }
    }
}

/// Receive errors that concern one datagram or one peer, not the socket.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

/// Send packets to `peer` in order. Failures are logged; the reaper's
/// retransmission covers anything lost.
pub async fn transmit(socket: &UdpSocket, peer: SocketAddr, packets: &[Bytes]) {
    for packet in packets {
        if let Err(e) = socket.send_to(packet, peer).await {
            tracing::warn!(%peer, error = %e, "send_to failed");
            return;
        }
    }
}
