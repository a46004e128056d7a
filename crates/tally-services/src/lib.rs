//! tally-services: per-session reliability state, the session registry,
//! the message router, the persistence interface, and the client endpoint.

pub mod client;
pub mod reassembly;
pub mod retransmit;
pub mod router;
pub mod session;
pub mod store;

pub use client::{Client, ClientError, ClientSettings};
pub use reassembly::{ReassemblyBuffer, ReceiveOutcome};
pub use retransmit::{AckOutcome, RetransmitBuffer, TickOutcome};
pub use router::MessageRouter;
pub use session::{Session, SessionError, SessionHandle, SessionRegistry, SweepVerdict};
pub use store::{HistoryEntry, MemoryStore, SeriesStore, SeriesSummary, StoreError, StoreStatus};
