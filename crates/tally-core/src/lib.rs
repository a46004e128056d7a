//! tally-core: shared types, wire format, and configuration.
//! All other Tally crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Command, Message, Request, Tag};
pub use wire::{Packet, PacketKind, WireError};
