//! Periodic session sweep: evicts idle sessions, resends unacknowledged
//! chunks, tears down sessions whose peer stopped acknowledging.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use tally_core::config::ProtocolConfig;
use tally_services::{SessionError, SessionRegistry, SweepVerdict};

use crate::server::transmit;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub unreachable: usize,
    pub retransmitted: usize,
}

pub async fn reaper_loop(
    registry: SessionRegistry,
    socket: Arc<UdpSocket>,
    protocol: ProtocolConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(protocol.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("reaper shutting down");
                return;
            }
            _ = interval.tick() => {
                let report = sweep(&registry, &socket, &protocol).await;
                if report != SweepReport::default() {
                    tracing::debug!(
                        expired = report.expired,
                        unreachable = report.unreachable,
                        retransmitted = report.retransmitted,
                        sessions = registry.len(),
                        "sweep"
                    );
                }
            }
        }
    }
}

/// Tick every session once.
pub async fn sweep(
    registry: &SessionRegistry,
    socket: &UdpSocket,
    protocol: &ProtocolConfig,
) -> SweepReport {
    let mut report = SweepReport::default();

    for (peer, handle) in registry.snapshot() {
        let verdict = handle.lock().await.tick(protocol);
        match verdict {
            Ok(SweepVerdict::Quiet) => {}
            Ok(SweepVerdict::Expired) => {
                if registry.remove_if_same(&peer, &handle) {
                    tracing::info!(%peer, "idle session evicted");
                    report.expired += 1;
                }
            }
            Ok(SweepVerdict::Retransmit(packets)) => {
                tracing::debug!(%peer, count = packets.len(), "retransmitting");
                transmit(socket, peer, &packets).await;
                report.retransmitted += 1;
            }
            Err(e @ SessionError::PeerUnreachable { .. }) => {
                if registry.remove_if_same(&peer, &handle) {
                    tracing::warn!(%peer, error = %e, "session torn down");
                    report.unreachable += 1;
                }
            }
        }
    }

    report
}
