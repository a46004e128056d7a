//! Hands reassembled messages to a fixed pool of worker tasks.
//!
//! The event loop owns the only [`Dispatcher`]. When it exits the queue
//! closes; workers finish everything already queued, then stop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tally_services::{MessageRouter, RetransmitBuffer, SessionRegistry};

use crate::server::transmit;

/// One complete inbound message waiting for a worker.
#[derive(Debug)]
pub struct Job {
    pub peer: SocketAddr,
    pub message: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("dispatch queue is closed")]
    Closed,
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Enqueue without waiting. A full queue is reported, never awaited.
    pub fn submit(&self, peer: SocketAddr, message: Bytes) -> Result<(), DispatchError> {
        self.tx
            .try_send(Job { peer, message })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })
    }
}

/// Bounded job queue.
pub fn channel(depth: usize) -> (Dispatcher, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (Dispatcher { tx }, rx)
}

/// Everything a worker needs to answer a message.
pub struct WorkerContext {
    pub router: MessageRouter,
    pub registry: SessionRegistry,
    pub socket: Arc<UdpSocket>,
    pub chunk_size: usize,
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, rx: mpsc::Receiver<Job>, ctx: Arc<WorkerContext>) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..count.max(1))
            .map(|id| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        // Lock only while waiting for the next job.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        handle_job(&ctx, job).await;
                    }
                    tracing::debug!(worker = id, "worker stopped");
                })
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker. Returns once the queue is closed and drained.
    pub async fn join(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "worker task failed");
            }
        }
    }
}

async fn handle_job(ctx: &Arc<WorkerContext>, job: Job) {
    let Job { peer, message } = job;
    tracing::debug!(%peer, len = message.len(), "handling message");

    // The store may block on disk I/O; keep it off the runtime threads.
    let router_ctx = ctx.clone();
    let routed =
        tokio::task::spawn_blocking(move || router_ctx.router.route(peer, &message)).await;

    match routed {
        Ok(Some(response)) => {
            deliver_response(&ctx.registry, &ctx.socket, peer, &response, ctx.chunk_size).await;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(%peer, error = %e, "router task failed"),
    }
}

/// Queue `response` on `peer`'s session and send it if nothing else is in
/// flight. Dropped when the session is gone.
pub async fn deliver_response(
    registry: &SessionRegistry,
    socket: &UdpSocket,
    peer: SocketAddr,
    response: &str,
    chunk_size: usize,
) {
    let Some(handle) = registry.get(&peer) else {
        tracing::debug!(%peer, "session gone, response discarded");
        return;
    };
    let buffer = match RetransmitBuffer::new(response.as_bytes(), chunk_size) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to chunk response");
            return;
        }
    };
    tracing::trace!(%peer, total = buffer.total(), "response queued");
    let packets = handle.lock().await.enqueue_response(buffer);
    transmit(socket, peer, &packets).await;
}
