pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod hub;
pub mod registry;
pub mod security;
pub mod session;

// Re-export main components for easier use
pub use error::Error;
pub use hub::{HubHandle, MemberHandle};
pub use registry::StreamRegistry;
pub use security::publish::{PublishAuthorizer, PublishDecision};
pub use session::{Orchestrator, SessionState, StopReason};
