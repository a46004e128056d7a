//! Receive side of the reliable channel.
//!
//! [`ReassemblyBuffer`] accepts chunks strictly in order:
//!
//! - `sequence <  expected`: duplicate of an acknowledged chunk, ack again.
//! - `sequence == expected`: store, ack, and deliver once all `total` arrived.
//! - `sequence >  expected`: gap, dropped without an ack. The sender's
//!   retransmission timer fills it; the receiver never asks.
//!
//! After a delivery the chunks of that message are kept until the peer
//! moves on, so a late retransmission of any of them is re-acknowledged
//! instead of being mistaken for the start of a new message.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use bytes::{Bytes, BytesMut};

/// What the caller should do with one received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored. Acknowledge `ack`.
    Accepted { ack: u32 },
    /// Stored and the message is whole. Acknowledge `ack`, then deliver.
    Complete { ack: u32, message: Bytes },
    /// Already have it. Acknowledge `ack` again, nothing else.
    Duplicate { ack: u32 },
    /// Not acknowledged, not stored.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived ahead of the next expected chunk.
    Gap { expected: u32, got: u32 },
    /// Disagrees with the chunk count of the message in progress.
    TotalMismatch { expected: u32, got: u32 },
}

impl ReceiveOutcome {
    /// Sequence number to acknowledge, if any.
    pub fn ack(&self) -> Option<u32> {
        match self {
            ReceiveOutcome::Accepted { ack }
            | ReceiveOutcome::Complete { ack, .. }
            | ReceiveOutcome::Duplicate { ack } => Some(*ack),
            ReceiveOutcome::Dropped(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    /// Payloads of the message in progress, index == sequence.
    chunks: Vec<Bytes>,
    /// Chunk count of the message in progress.
    total: u32,
    /// Chunks of the last delivered message, until the peer moves on.
    delivered: Option<Vec<Bytes>>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number that will be accepted.
    pub fn expected_index(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// True when no message is partially received.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True while the last delivered message is still remembered.
    pub fn has_delivered(&self) -> bool {
        self.delivered.is_some()
    }

    pub fn receive(&mut self, sequence: u32, total: u32, payload: Bytes) -> ReceiveOutcome {
        let expected = self.expected_index();

        if expected == 0 {
            if let Some(previous) = &self.delivered {
                let same_message = previous.len() == total as usize
                    && previous.get(sequence as usize) == Some(&payload);
                if same_message {
                    return ReceiveOutcome::Duplicate { ack: sequence };
                }
                self.delivered = None;
            }
        } else if total != self.total {
            return ReceiveOutcome::Dropped(DropReason::TotalMismatch {
                expected: self.total,
                got: total,
            });
        }

        if sequence < expected {
            return ReceiveOutcome::Duplicate { ack: sequence };
        }
        if sequence > expected {
            return ReceiveOutcome::Dropped(DropReason::Gap {
                expected,
                got: sequence,
            });
        }

        if expected == 0 {
            self.total = total;
        }
        self.chunks.push(payload);

        if self.expected_index() < self.total {
            return ReceiveOutcome::Accepted { ack: sequence };
        }

        let chunks = std::mem::take(&mut self.chunks);
        self.total = 0;
        let mut message = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            message.extend_from_slice(chunk);
        }
        self.delivered = Some(chunks);
        ReceiveOutcome::Complete {
            ack: sequence,
            message: message.freeze(),
        }
    }

    /// Forget the last delivered message. Called once the peer has shown it
    /// is past that message, e.g. by acknowledging the whole response.
    pub fn settle(&mut self) {
        self.delivered = None;
    }
}
