//! Media engines started by the session orchestrator.
//!
//! The orchestrator only sees the [`Engine`] and [`EngineFactory`] traits; the
//! production pair is an RTMP ingest server feeding an HTTP-FLV packager
//! through a per-session [`relay::MediaRelay`].

use crate::db::models::stream_models::StreamRecord;
use crate::error::Error;
use crate::security::publish::{PublishAuthorizer, PublishDecision};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod flv;
pub mod relay;
pub mod rtmp;

use flv::HttpFlvPackager;
use relay::MediaRelay;
use rtmp::{RtmpIngest, RtmpServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Ingest,
    Packaging,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Ingest => write!(f, "ingest"),
            EngineKind::Packaging => write!(f, "packaging"),
        }
    }
}

/// A network engine with a blocking accept loop
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Accept connections on `listener` until cancelled. An `Err` means the
    /// engine hit a fault it cannot recover from.
    async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error>;
}

/// The two engines of one session, already bound to each other
pub struct SessionEngines {
    pub ingest: Box<dyn Engine>,
    pub packaging: Box<dyn Engine>,
}

/// Builds a fresh engine pair for each session
pub trait EngineFactory: Send + Sync {
    fn build(&self, record: &StreamRecord) -> SessionEngines;
}

/// Decides whether a publisher may start sending
#[async_trait]
pub trait PublishGate: Send + Sync {
    async fn check(&self, stream_key: &str) -> Result<PublishDecision, Error>;
}

#[async_trait]
impl PublishGate for PublishAuthorizer {
    async fn check(&self, stream_key: &str) -> Result<PublishDecision, Error> {
        self.authorize(stream_key).await
    }
}

/// Production factory: RTMP ingest bound to an HTTP-FLV packager
pub struct RelayEngineFactory {
    gate: Arc<dyn PublishGate>,
    app_name: String,
    tag_buffer: usize,
}

impl RelayEngineFactory {
    pub fn new(gate: Arc<dyn PublishGate>, app_name: &str, tag_buffer: usize) -> Self {
        Self {
            gate,
            app_name: app_name.to_string(),
            tag_buffer,
        }
    }
}

impl EngineFactory for RelayEngineFactory {
    fn build(&self, record: &StreamRecord) -> SessionEngines {
        let packager = HttpFlvPackager::new(MediaRelay::new(self.tag_buffer), &record.routing_hash);
        let ingest = RtmpIngest::new(record.clone(), &self.app_name, self.gate.clone());
        let server = RtmpServer::new(ingest, &packager);

        SessionEngines {
            ingest: Box::new(server),
            packaging: Box::new(packager),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct DenyAll;

    #[async_trait]
    impl PublishGate for DenyAll {
        async fn check(&self, _stream_key: &str) -> Result<PublishDecision, Error> {
            Ok(PublishDecision::Denied)
        }
    }

    async fn http_status(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n])
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn relay_engines_serve_until_cancelled() {
        let record = StreamRecord {
            id: 1,
            stream_key: "studio-a".to_string(),
            routing_hash: "0badc0de".to_string(),
            created_at: Utc::now(),
        };
        let factory = RelayEngineFactory::new(Arc::new(DenyAll), "live", 16);
        let engines = factory.build(&record);
        assert_eq!(engines.ingest.kind(), EngineKind::Ingest);
        assert_eq!(engines.packaging.kind(), EngineKind::Packaging);

        let ingest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let packaging_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let packaging_addr = packaging_listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let ingest = engines.ingest;
        let packaging = engines.packaging;
        let ingest_cancel = cancel.clone();
        let packaging_cancel = cancel.clone();
        let ingest_task =
            tokio::spawn(async move { ingest.serve(ingest_listener, ingest_cancel).await });
        let packaging_task =
            tokio::spawn(async move { packaging.serve(packaging_listener, packaging_cancel).await });

        assert!(http_status(packaging_addr, "/live/ffffffff.flv")
            .await
            .contains("404"));

        cancel.cancel();
        assert!(ingest_task.await.unwrap().is_ok());
        assert!(packaging_task.await.unwrap().is_ok());
    }
}
