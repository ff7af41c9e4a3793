//! HTTP-FLV packaging engine.
//!
//! Serves `GET /live/{routing_hash}.flv` as an endless FLV body built from
//! the tags of the session's relay.
//!
//! FLV tag layout:
//! ```text
//! +---------+-------------+-----------+-------------+--------------+---------+--------------------+
//! | Type(1) | DataSize(3) | TS low(3) | TS high(1)  | StreamID(3)  | Data(N) | PreviousTagSize(4) |
//! +---------+-------------+-----------+-------------+--------------+---------+--------------------+
//! ```

use super::relay::{MediaRelay, MediaTag, RelayEvent, TagKind};
use super::{Engine, EngineKind};
use crate::error::Error;
use async_trait::async_trait;
use axum::{
    body::StreamBody,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, Stream};
use log::{debug, info, warn};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// "FLV", version 1, audio+video present, header length 9, PreviousTagSize0
pub const FLV_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

const TAG_HEADER_LEN: usize = 11;

/// Largest payload the 24-bit DataSize field can describe
pub const MAX_TAG_DATA_LEN: usize = 0x00FF_FFFF;

/// Wrap one media message into an FLV tag followed by its PreviousTagSize.
/// `None` if the payload is too large for an FLV tag.
pub fn encode_tag(tag: &MediaTag) -> Option<Bytes> {
    let tag_type: u8 = match tag.kind {
        TagKind::Audio => 8,
        TagKind::Video => 9,
    };
    let data_len = tag.data.len();
    if data_len > MAX_TAG_DATA_LEN {
        return None;
    }

    let mut buf = BytesMut::with_capacity(TAG_HEADER_LEN + data_len + 4);

    buf.put_u8(tag_type);
    buf.put_uint(data_len as u64, 3);
    buf.put_uint((tag.timestamp & 0x00FF_FFFF) as u64, 3);
    buf.put_u8((tag.timestamp >> 24) as u8);
    buf.put_uint(0, 3);
    buf.put_slice(&tag.data);
    buf.put_u32((TAG_HEADER_LEN + data_len) as u32);

    Some(buf.freeze())
}

/// Packaging engine bound to a single relay
pub struct HttpFlvPackager {
    relay: Arc<MediaRelay>,
    routing_hash: String,
}

#[derive(Clone)]
struct PackagerState {
    relay: Arc<MediaRelay>,
    file_name: String,
    cancel: CancellationToken,
}

impl HttpFlvPackager {
    pub fn new(relay: MediaRelay, routing_hash: &str) -> Self {
        Self {
            relay: Arc::new(relay),
            routing_hash: routing_hash.to_string(),
        }
    }

    pub fn relay(&self) -> Arc<MediaRelay> {
        self.relay.clone()
    }

    fn router(&self, cancel: CancellationToken) -> Router {
        let state = PackagerState {
            relay: self.relay.clone(),
            file_name: format!("{}.flv", self.routing_hash),
            cancel,
        };

        Router::new()
            .route("/live/:file", get(play_flv))
            .with_state(state)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
    }
}

#[async_trait]
impl Engine for HttpFlvPackager {
    fn kind(&self) -> EngineKind {
        EngineKind::Packaging
    }

    async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error> {
        let addr = listener.local_addr()?;
        info!("HTTP-FLV packager for {} listening on {}", self.routing_hash, addr);

        let app = self.router(cancel.clone());
        axum::Server::from_tcp(listener.into_std()?)
            .map_err(|e| Error::Session(format!("Packager failed to start: {}", e)))?
            .serve(app.into_make_service())
            .with_graceful_shutdown(cancel.cancelled())
            .await
            .map_err(|e| Error::Session(format!("Packager accept loop failed: {}", e)))?;

        info!("HTTP-FLV packager for {} stopped", self.routing_hash);
        Ok(())
    }
}

async fn play_flv(State(state): State<PackagerState>, Path(file): Path<String>) -> Response {
    if file != state.file_name {
        return (StatusCode::NOT_FOUND, "Unknown stream").into_response();
    }

    debug!("Viewer attached to {}", state.file_name);
    let (headers, receiver) = state.relay.subscribe().await;

    (
        [
            (header::CONTENT_TYPE, "video/x-flv"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        StreamBody::new(flv_stream(headers, receiver, state.cancel)),
    )
        .into_response()
}

struct ViewerCursor {
    pending: Option<Bytes>,
    receiver: broadcast::Receiver<RelayEvent>,
    cancel: CancellationToken,
    seen_keyframe: bool,
}

/// FLV header and cached sequence headers, then live tags starting from the
/// next video keyframe. Ends with the publisher or on cancellation.
fn flv_stream(
    headers: Vec<MediaTag>,
    receiver: broadcast::Receiver<RelayEvent>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let mut preamble = BytesMut::from(&FLV_HEADER[..]);
    for tag in &headers {
        let header = MediaTag {
            timestamp: 0,
            ..tag.clone()
        };
        if let Some(encoded) = encode_tag(&header) {
            preamble.extend_from_slice(&encoded);
        }
    }

    let cursor = ViewerCursor {
        pending: Some(preamble.freeze()),
        receiver,
        cancel,
        seen_keyframe: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        if let Some(first) = cursor.pending.take() {
            return Some((Ok(first), cursor));
        }

        loop {
            let event = tokio::select! {
                _ = cursor.cancel.cancelled() => return None,
                event = cursor.receiver.recv() => event,
            };

            match event {
                Ok(RelayEvent::Tag(tag)) => {
                    if !cursor.seen_keyframe && !tag.is_sequence_header() && !tag.is_keyframe() {
                        continue;
                    }
                    let encoded = match encode_tag(&tag) {
                        Some(encoded) => encoded,
                        None => {
                            warn!("Dropping {} byte tag, too large for FLV", tag.data.len());
                            continue;
                        }
                    };
                    if tag.is_keyframe() && !tag.is_sequence_header() {
                        cursor.seen_keyframe = true;
                    }
                    return Some((Ok(encoded), cursor));
                }
                Ok(RelayEvent::Ended) | Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Viewer lagged, skipped {} tags", skipped);
                    cursor.seen_keyframe = false;
                }
            }
        }
    })
}
