use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Why a session stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// A listener could not be opened
    BindFailure(String),
    /// An engine's accept loop failed or panicked
    Fault(String),
    /// Cancelled by shutdown or because the stream was deleted
    Cancelled,
    /// An engine returned without being asked to
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Running,
    Stopped { stop: StopReason },
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped { .. })
    }

    pub fn stopped(reason: StopReason) -> Self {
        SessionState::Stopped { stop: reason }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unstarted => write!(f, "unstarted"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped { stop } => match stop {
                StopReason::BindFailure(e) => write!(f, "stopped (bind failure: {})", e),
                StopReason::Fault(e) => write!(f, "stopped (fault: {})", e),
                StopReason::Cancelled => write!(f, "stopped (cancelled)"),
                StopReason::Completed => write!(f, "stopped"),
            },
        }
    }
}

/// Listener addresses of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionAddrs {
    pub ingest: SocketAddr,
    pub packaging: SocketAddr,
}

/// Point-in-time copy of a session, published by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub stream_id: i64,
    pub routing_hash: String,
    pub state: SessionState,
    pub addrs: Option<SessionAddrs>,
}
