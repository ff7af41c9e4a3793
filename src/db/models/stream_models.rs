use chrono::{DateTime, Utc};
use serde::Serialize;

/// A registered stream. The key is the publisher's secret; the hash is what
/// shows up in public URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StreamRecord {
    pub id: i64,
    #[serde(skip_serializing)]
    pub stream_key: String,
    #[sqlx(rename = "hash_key")]
    pub routing_hash: String,
    pub created_at: DateTime<Utc>,
}

impl StreamRecord {
    /// Zero-based offset used to derive per-session ports
    pub fn port_offset(&self) -> i64 {
        self.id - 1
    }
}
