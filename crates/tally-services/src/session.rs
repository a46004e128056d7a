//! Session management: per-peer reliable-delivery state and the registry
//! that owns it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

use tally_core::config::ProtocolConfig;

use crate::reassembly::{ReassemblyBuffer, ReceiveOutcome};
use crate::retransmit::{AckOutcome, RetransmitBuffer, TickOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {peer} unreachable after {retries} retransmissions")]
    PeerUnreachable { peer: SocketAddr, retries: u32 },
}

/// What one reaper tick decided for a session.
#[derive(Debug, PartialEq, Eq)]
pub enum SweepVerdict {
    /// Nothing to send, not expired.
    Quiet,
    /// Idle past the threshold. Remove it.
    Expired,
    /// Resend these packets to the peer.
    Retransmit(Vec<Bytes>),
}

/// Reliable-delivery state for one peer.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    reassembly: ReassemblyBuffer,
    /// Outbound messages. Only the head is on the wire.
    outbox: VecDeque<RetransmitBuffer>,
    idle_ticks: u32,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            reassembly: ReassemblyBuffer::new(),
            outbox: VecDeque::new(),
            idle_ticks: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    /// Outbound messages not yet fully acknowledged, in-flight one included.
    pub fn pending_responses(&self) -> usize {
        self.outbox.len()
    }

    pub fn reassembly(&self) -> &ReassemblyBuffer {
        &self.reassembly
    }

    /// Reset the idle counter. Called for every datagram from the peer.
    pub fn touch(&mut self) {
        self.idle_ticks = 0;
    }

    pub fn on_content(&mut self, sequence: u32, total: u32, payload: Bytes) -> ReceiveOutcome {
        self.reassembly.receive(sequence, total, payload)
    }

    /// Apply an ack to the in-flight message. When that completes the
    /// message, the next queued one (if any) is returned for first
    /// transmission. It takes no acks until the sweep has resent it once.
    pub fn on_ack(&mut self, sequence: u32) -> Vec<Bytes> {
        let Some(head) = self.outbox.front_mut() else {
            return Vec::new();
        };
        match head.on_ack(sequence) {
            AckOutcome::Complete => {
                self.outbox.pop_front();
                // The peer has our answer, so it is done with its request.
                self.reassembly.settle();
                match self.outbox.front_mut() {
                    Some(next) => {
                        // A late ack for the finished message would look like
                        // an ack for this one.
                        next.guard();
                        next.send_all()
                    }
                    None => Vec::new(),
                }
            }
            AckOutcome::Advanced | AckOutcome::Ignored => Vec::new(),
        }
    }

    /// Queue an outbound message. Returns its packets when it went straight
    /// to the head of the queue and should be sent now.
    pub fn enqueue_response(&mut self, buffer: RetransmitBuffer) -> Vec<Bytes> {
        self.outbox.push_back(buffer);
        if self.outbox.len() == 1 {
            self.outbox[0].send_all()
        } else {
            Vec::new()
        }
    }

    /// One reaper tick: age the session and drive the in-flight message's
    /// retransmission timer.
    pub fn tick(&mut self, protocol: &ProtocolConfig) -> Result<SweepVerdict, SessionError> {
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if self.idle_ticks > protocol.idle_timeout_ticks {
            return Ok(SweepVerdict::Expired);
        }

        let Some(head) = self.outbox.front_mut() else {
            return Ok(SweepVerdict::Quiet);
        };
        match head.tick(protocol.retransmit_after_ticks, protocol.retry_budget) {
            TickOutcome::Waiting => Ok(SweepVerdict::Quiet),
            TickOutcome::Retransmit(packets) => Ok(SweepVerdict::Retransmit(packets)),
            TickOutcome::Exhausted { retries } => Err(SessionError::PeerUnreachable {
                peer: self.peer,
                retries,
            }),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub type SessionHandle = Arc<Mutex<Session>>;

/// Every live session, keyed by peer address. Cheap to clone.
///
/// Map operations hold a shard lock only for the map access itself; session
/// locks are always taken after the handle has been cloned out.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SocketAddr, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `peer`, or a fresh one. The flag is true when
    /// the session was created by this call.
    pub fn get_or_create(&self, peer: SocketAddr) -> (SessionHandle, bool) {
        match self.sessions.entry(peer) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(Mutex::new(Session::new(peer)));
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<SessionHandle> {
        self.sessions.get(peer).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, peer: &SocketAddr) -> Option<SessionHandle> {
        self.sessions.remove(peer).map(|(_, handle)| handle)
    }

    /// Remove `peer` only if it still maps to `handle`. A session recreated
    /// after the handle was taken is left alone.
    pub fn remove_if_same(&self, peer: &SocketAddr, handle: &SessionHandle) -> bool {
        self.sessions
            .remove_if(peer, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Point-in-time copy of every entry, safe to iterate while the map
    /// changes underneath.
    pub fn snapshot(&self) -> Vec<(SocketAddr, SessionHandle)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Reset the idle counter of `peer`'s session. False if there is none.
    pub async fn touch(&self, peer: &SocketAddr) -> bool {
        match self.get(peer) {
            Some(handle) => {
                handle.lock().await.touch();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
