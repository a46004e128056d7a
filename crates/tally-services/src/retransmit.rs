//! Send side of the reliable channel.
//!
//! [`RetransmitBuffer`] holds every pre-encoded chunk of one outbound
//! message and an ack cursor (the first unacknowledged chunk).
//!
//! - The cursor only moves on an ack for exactly the cursor position.
//!   Acks below it are stale, acks above it are ignored: the sender never
//!   skips a chunk it has no ack for. One ack, one chunk (stop-and-wait).
//! - The caller drives [`RetransmitBuffer::tick`] from a periodic timer.
//!   After `retransmit_after` ticks with no progress, everything from the
//!   cursor to the end is resent. After `retry_budget` such resends the
//!   message fails.
//! - A guarded buffer ignores every ack until its first retransmission.
//!   Sessions guard a message queued behind another one: late acks for the
//!   previous message carry the same sequence numbers, and the wire has no
//!   message id to tell them apart.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use bytes::Bytes;
use tally_core::wire::{self, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Cursor moved forward by one.
    Advanced,
    /// Cursor moved onto the end; every chunk is acknowledged.
    Complete,
    /// Duplicate, stale, or out-of-order ack. Nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do yet.
    Waiting,
    /// Send these packets again.
    Retransmit(Vec<Bytes>),
    /// Retry budget spent without progress. The peer is unreachable.
    Exhausted { retries: u32 },
}

#[derive(Debug)]
pub struct RetransmitBuffer {
    packets: Vec<Bytes>,
    ack_cursor: u32,
    /// Ticks since the last progress or retransmission.
    stalled_ticks: u32,
    /// Retransmissions since the last progress.
    retries: u32,
    /// Acks are ignored until the next retransmission.
    guarded: bool,
}

impl RetransmitBuffer {
    /// Split `message` into `ceil(len / chunk_size)` chunks and encode one
    /// Content packet per chunk. An empty message still yields one chunk.
    pub fn new(message: &[u8], chunk_size: usize) -> Result<Self, WireError> {
        if chunk_size == 0 {
            return Err(WireError::ZeroChunkSize);
        }
        let pieces: Vec<&[u8]> = if message.is_empty() {
            vec![&[][..]]
        } else {
            message.chunks(chunk_size).collect()
        };
        let total =
            u32::try_from(pieces.len()).map_err(|_| WireError::TooManyChunks(message.len()))?;

        let packets = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| wire::encode_content(i as u32, total, piece, chunk_size))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            packets,
            ack_cursor: 0,
            stalled_ticks: 0,
            retries: 0,
            guarded: false,
        })
    }

    pub fn total(&self) -> u32 {
        self.packets.len() as u32
    }

    /// First unacknowledged chunk, or `total()` once complete.
    pub fn ack_cursor(&self) -> u32 {
        self.ack_cursor
    }

    pub fn is_complete(&self) -> bool {
        self.ack_cursor == self.total()
    }

    /// Every packet, for the first transmission.
    pub fn send_all(&self) -> Vec<Bytes> {
        self.packets.clone()
    }

    /// Every packet from the cursor to the end.
    pub fn retransmit_pending(&self) -> Vec<Bytes> {
        self.packets[self.ack_cursor as usize..].to_vec()
    }

    /// Ignore acks until the next retransmission.
    pub fn guard(&mut self) {
        self.guarded = true;
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    pub fn on_ack(&mut self, sequence: u32) -> AckOutcome {
        if self.guarded || self.is_complete() || sequence != self.ack_cursor {
            return AckOutcome::Ignored;
        }
        self.ack_cursor += 1;
        self.stalled_ticks = 0;
        self.retries = 0;
        if self.is_complete() {
            AckOutcome::Complete
        } else {
            AckOutcome::Advanced
        }
    }

    /// Advance the retransmission timer by one tick.
    pub fn tick(&mut self, retransmit_after: u32, retry_budget: u32) -> TickOutcome {
        if self.is_complete() {
            return TickOutcome::Waiting;
        }
        self.stalled_ticks += 1;
        if self.stalled_ticks < retransmit_after.max(1) {
            return TickOutcome::Waiting;
        }
        self.stalled_ticks = 0;
        if self.retries >= retry_budget {
            return TickOutcome::Exhausted {
                retries: self.retries,
            };
        }
        self.retries += 1;
        self.guarded = false;
        TickOutcome::Retransmit(self.retransmit_pending())
    }
}
