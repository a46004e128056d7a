//! Tally wire format: one datagram per packet.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format. Integers are little-endian.
//!
//! ```text
//! Ack      [0x01][seq:u32]                         5 bytes
//! Nack     [0x02][seq:u32]                         5 bytes
//! Content  [0x03][seq:u32][total:u32][payload..]   9-byte header
//! ```
//!
//! Headers are #[repr(C, packed)] zerocopy structs. Decoding goes through
//! `read_from_prefix`, so a short datagram is an error and never an
//! out-of-bounds read. There is no unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Packet kinds ──────────────────────────────────────────────────────────────

/// The leading byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Receiver acknowledges one chunk.
    Ack = 0x01,
    /// Receiver asks for one chunk again. Decoded, but the server does not act on it.
    Nack = 0x02,
    /// One chunk of a message.
    Content = 0x03,
}

impl PacketKind {
    /// Size of the fixed header that precedes any payload.
    pub fn header_len(self) -> usize {
        match self {
            PacketKind::Ack | PacketKind::Nack => CONTROL_HEADER_LEN,
            PacketKind::Content => CONTENT_HEADER_LEN,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketKind::Ack),
            0x02 => Ok(PacketKind::Nack),
            0x03 => Ok(PacketKind::Content),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(k: PacketKind) -> u8 {
        k as u8
    }
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Header of Ack and Nack packets. These packets have no payload.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ControlHeader {
    pub kind: u8,
    /// Sequence number of the chunk being acknowledged or requested.
    pub sequence: U32<LittleEndian>,
}

assert_eq_size!(ControlHeader, [u8; 5]);

/// Header of a Content packet. The payload follows immediately.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ContentHeader {
    pub kind: u8,
    /// 0-based index of this chunk within its message.
    pub sequence: U32<LittleEndian>,
    /// Number of chunks in the message. Never zero.
    pub total: U32<LittleEndian>,
}

assert_eq_size!(ContentHeader, [u8; 9]);

// ── Constants ─────────────────────────────────────────────────────────────────

pub const CONTROL_HEADER_LEN: usize = std::mem::size_of::<ControlHeader>();
pub const CONTENT_HEADER_LEN: usize = std::mem::size_of::<ContentHeader>();

/// Default datagram size. Every packet, header included, fits in one MTU.
pub const DEFAULT_MTU: usize = 1024;

/// Largest payload a Content packet may carry for a given MTU.
pub fn max_chunk_size(mtu: usize) -> usize {
    mtu.saturating_sub(CONTENT_HEADER_LEN)
}

// ── Decoded packets ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ack { sequence: u32 },
    Nack { sequence: u32 },
    Content { sequence: u32, total: u32, payload: Bytes },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::Nack { .. } => PacketKind::Nack,
            Packet::Content { .. } => PacketKind::Content,
        }
    }

    /// Decode one received datagram. `datagram` must be exactly the bytes
    /// received, not the whole receive buffer.
    pub fn decode(datagram: &[u8]) -> Result<Packet, WireError> {
        let first = *datagram.first().ok_or(WireError::Empty)?;
        let kind = PacketKind::try_from(first)?;
        let needed = kind.header_len();
        if datagram.len() < needed {
            return Err(WireError::Truncated {
                kind,
                len: datagram.len(),
                needed,
            });
        }

        match kind {
            PacketKind::Ack | PacketKind::Nack => {
                if datagram.len() > needed {
                    return Err(WireError::TrailingBytes(datagram.len() - needed));
                }
                let header = ControlHeader::read_from_prefix(datagram).ok_or(
                    WireError::Truncated {
                        kind,
                        len: datagram.len(),
                        needed,
                    },
                )?;
                let sequence = header.sequence.get();
                Ok(if kind == PacketKind::Ack {
                    Packet::Ack { sequence }
                } else {
                    Packet::Nack { sequence }
                })
            }
            PacketKind::Content => {
                let header = ContentHeader::read_from_prefix(datagram).ok_or(
                    WireError::Truncated {
                        kind,
                        len: datagram.len(),
                        needed,
                    },
                )?;
                let sequence = header.sequence.get();
                let total = header.total.get();
                if sequence >= total {
                    return Err(WireError::SequenceOutOfRange { sequence, total });
                }
                Ok(Packet::Content {
                    sequence,
                    total,
                    payload: Bytes::copy_from_slice(&datagram[CONTENT_HEADER_LEN..]),
                })
            }
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn encode_control(kind: PacketKind, sequence: u32) -> Bytes {
    let header = ControlHeader {
        kind: kind.into(),
        sequence: U32::new(sequence),
    };
    Bytes::copy_from_slice(header.as_bytes())
}

pub fn encode_ack(sequence: u32) -> Bytes {
    encode_control(PacketKind::Ack, sequence)
}

pub fn encode_nack(sequence: u32) -> Bytes {
    encode_control(PacketKind::Nack, sequence)
}

/// Encode one chunk. Rejects payloads larger than `max_chunk_size` and
/// headers that could never be decoded (`sequence >= total`).
pub fn encode_content(
    sequence: u32,
    total: u32,
    payload: &[u8],
    max_chunk_size: usize,
) -> Result<Bytes, WireError> {
    if payload.len() > max_chunk_size {
        return Err(WireError::PayloadTooLarge {
            len: payload.len(),
            max: max_chunk_size,
        });
    }
    if sequence >= total {
        return Err(WireError::SequenceOutOfRange { sequence, total });
    }
    let header = ContentHeader {
        kind: PacketKind::Content.into(),
        sequence: U32::new(sequence),
        total: U32::new(total),
    };
    let mut buf = BytesMut::with_capacity(CONTENT_HEADER_LEN + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting or producing wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,

    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("truncated {kind:?} packet: {len} bytes, header needs {needed}")]
    Truncated {
        kind: PacketKind,
        len: usize,
        needed: usize,
    },

    #[error("control packet carries {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("sequence {sequence} out of range for a message of {total} chunks")]
    SequenceOutOfRange { sequence: u32, total: u32 },

    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("message of {0} bytes needs more than u32::MAX chunks")]
    TooManyChunks(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
