//! Per-stream ingest/packaging sessions.

pub mod orchestrator;
pub mod ports;
pub mod state;

pub use orchestrator::{Orchestrator, SessionOutcome};
pub use ports::{AddressPlan, PortPolicy, StreamUrls};
pub use state::{SessionAddrs, SessionState, SessionStatus, StopReason};
