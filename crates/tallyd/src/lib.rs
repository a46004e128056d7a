//! tallyd: the reliable-datagram server. The binary wires these pieces
//! together; integration tests drive them in-process.

pub mod dispatch;
pub mod reaper;
pub mod server;
pub mod store;

pub use server::{Server, ServerHandle};
pub use store::SqliteStore;
