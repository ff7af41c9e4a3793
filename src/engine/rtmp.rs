//! RTMP ingest engine.
//!
//! Handshake and chunk-level protocol handling are delegated to `rml_rtmp`;
//! this module drives the socket, gates `publish` through the authorizer and
//! forwards audio/video into the session relay.

use super::flv::HttpFlvPackager;
use super::relay::{MediaRelay, MediaTag, TagKind};
use super::{Engine, EngineKind, PublishGate};
use crate::db::models::stream_models::StreamRecord;
use crate::error::Error;
use crate::security::publish::PublishDecision;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 4096;

/// Per-session ingest state: which stream this listener accepts and who
/// decides whether a publisher is allowed in
pub struct RtmpIngest {
    record: StreamRecord,
    app_name: String,
    gate: Arc<dyn PublishGate>,
}

impl RtmpIngest {
    pub fn new(record: StreamRecord, app_name: &str, gate: Arc<dyn PublishGate>) -> Self {
        Self {
            record,
            app_name: app_name.to_string(),
            gate,
        }
    }
}

struct IngestContext {
    ingest: RtmpIngest,
    relay: Arc<MediaRelay>,
}

/// RTMP server feeding the relay of exactly one packager
pub struct RtmpServer {
    context: Arc<IngestContext>,
}

impl RtmpServer {
    pub fn new(ingest: RtmpIngest, packager: &HttpFlvPackager) -> Self {
        Self {
            context: Arc::new(IngestContext {
                ingest,
                relay: packager.relay(),
            }),
        }
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

#[async_trait]
impl Engine for RtmpServer {
    fn kind(&self) -> EngineKind {
        EngineKind::Ingest
    }

    async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error> {
        let hash = self.context.ingest.record.routing_hash.clone();
        info!("RTMP ingest for {} listening on {}", hash, listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let _ = socket.set_nodelay(true);
                    let context = self.context.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let mut connection = RtmpConnection::new(socket, peer_addr, context);
                        if let Err(e) = connection.run(cancel).await {
                            debug!("RTMP connection {} ended with error: {}", peer_addr, e);
                        }
                        connection.finish().await;
                    });
                }
                Err(e) if is_transient(e.kind()) => {
                    warn!("Failed to accept RTMP connection: {}", e);
                }
                Err(e) => {
                    return Err(Error::Session(format!(
                        "RTMP accept loop for {} failed: {}",
                        hash, e
                    )));
                }
            }
        }

        info!("RTMP ingest for {} stopped", hash);
        Ok(())
    }
}

fn protocol_error<E: std::fmt::Debug>(e: E) -> Error {
    Error::Protocol(format!("{:?}", e))
}

struct RtmpConnection {
    socket: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<IngestContext>,
    publishing: bool,
}

impl RtmpConnection {
    fn new(socket: TcpStream, peer_addr: SocketAddr, context: Arc<IngestContext>) -> Self {
        Self {
            socket,
            peer_addr,
            context,
            publishing: false,
        }
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let remaining = match self.handshake(&mut buf, &cancel).await? {
            Some(remaining) => remaining,
            None => return Ok(()),
        };

        let (mut session, results) =
            ServerSession::new(ServerSessionConfig::new()).map_err(protocol_error)?;
        self.process(&mut session, results).await?;

        if !remaining.is_empty() {
            let results = session.handle_input(&remaining).map_err(protocol_error)?;
            self.process(&mut session, results).await?;
        }

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = self.socket.read(&mut buf) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            let results = session.handle_input(&buf[..read]).map_err(protocol_error)?;
            self.process(&mut session, results).await?;
        }
    }

    /// Returns the bytes received after the handshake, or `None` if the peer
    /// left before finishing it
    async fn handshake(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut handshake = Handshake::new(PeerType::Server);

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                read = self.socket.read(buf) => read?,
            };
            if read == 0 {
                return Ok(None);
            }

            match handshake
                .process_bytes(&buf[..read])
                .map_err(protocol_error)?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    self.socket.write_all(&response_bytes).await?;
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    self.socket.write_all(&response_bytes).await?;
                    return Ok(Some(remaining_bytes));
                }
            }
        }
    }

    async fn process(
        &mut self,
        session: &mut ServerSession,
        results: Vec<ServerSessionResult>,
    ) -> Result<(), Error> {
        let mut queue: VecDeque<ServerSessionResult> = results.into();

        while let Some(result) = queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    self.socket.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    queue.extend(self.handle_event(session, event).await?);
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn handle_event(
        &mut self,
        session: &mut ServerSession,
        event: ServerSessionEvent,
    ) -> Result<Vec<ServerSessionResult>, Error> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
            } => {
                if app_name == self.context.ingest.app_name {
                    session.accept_request(request_id).map_err(protocol_error)
                } else {
                    warn!("{} asked for unknown app {:?}", self.peer_addr, app_name);
                    session
                        .reject_request(request_id, "NetConnection.Connect.Rejected", "Unknown application")
                        .map_err(protocol_error)
                }
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                if self.admit_publisher(&stream_key).await {
                    session.accept_request(request_id).map_err(protocol_error)
                } else {
                    session
                        .reject_request(request_id, "NetStream.Publish.BadName", "Publish not allowed")
                        .map_err(protocol_error)
                }
            }
            ServerSessionEvent::PublishStreamFinished { .. } => {
                self.finish().await;
                Ok(Vec::new())
            }
            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                self.forward(TagKind::Audio, timestamp.value, data).await;
                Ok(Vec::new())
            }
            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                self.forward(TagKind::Video, timestamp.value, data).await;
                Ok(Vec::new())
            }
            ServerSessionEvent::PlayStreamRequested { request_id, .. } => session
                .reject_request(request_id, "NetStream.Play.Failed", "Play over HTTP-FLV")
                .map_err(protocol_error),
            _ => Ok(Vec::new()),
        }
    }

    /// Publish is allowed only for this session's own key, and only while no
    /// one else is publishing to it
    async fn admit_publisher(&mut self, stream_key: &str) -> bool {
        let expected = &self.context.ingest.record.routing_hash;

        match self.context.ingest.gate.check(stream_key).await {
            Ok(PublishDecision::Authorized(record)) if &record.routing_hash == expected => {
                if self.context.relay.begin_publish() {
                    info!("{} started publishing {}", self.peer_addr, expected);
                    self.publishing = true;
                    true
                } else {
                    warn!("{} is already being published", expected);
                    false
                }
            }
            Ok(PublishDecision::Authorized(record)) => {
                warn!(
                    "{} tried to publish {} on the listener for {}",
                    self.peer_addr, record.routing_hash, expected
                );
                false
            }
            Ok(PublishDecision::Denied) => false,
            Err(e) => {
                error!("Publish authorization failed: {}", e);
                false
            }
        }
    }

    async fn forward(&self, kind: TagKind, timestamp: u32, data: bytes::Bytes) {
        if self.publishing {
            self.context
                .relay
                .push(MediaTag {
                    kind,
                    timestamp,
                    data,
                })
                .await;
        }
    }

    /// Release the publisher slot if this connection held it
    async fn finish(&mut self) {
        if self.publishing {
            self.publishing = false;
            self.context.relay.end_publish().await;
            info!("{} stopped publishing", self.peer_addr);
        }
    }
}
