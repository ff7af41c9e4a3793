use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Audio,
    Video,
}

/// One audio or video message as received from the publisher
#[derive(Debug, Clone)]
pub struct MediaTag {
    pub kind: TagKind,
    pub timestamp: u32,
    pub data: Bytes,
}

impl MediaTag {
    /// AVC decoder configuration or AAC audio specific config
    pub fn is_sequence_header(&self) -> bool {
        match self.kind {
            TagKind::Video => {
                self.data.len() >= 2 && (self.data[0] & 0x0F) == 7 && self.data[1] == 0
            }
            TagKind::Audio => self.data.len() >= 2 && (self.data[0] >> 4) == 10 && self.data[1] == 0,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == TagKind::Video && !self.data.is_empty() && (self.data[0] >> 4) == 1
    }
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Tag(MediaTag),
    /// The publisher went away
    Ended,
}

#[derive(Default)]
struct SequenceHeaders {
    video: Option<MediaTag>,
    audio: Option<MediaTag>,
}

/// Hands media from one ingest engine to one packaging engine.
///
/// At most one publisher at a time. Sequence headers are cached so viewers
/// joining mid-stream can initialise their decoders.
pub struct MediaRelay {
    events: broadcast::Sender<RelayEvent>,
    headers: RwLock<SequenceHeaders>,
    publishing: AtomicBool,
}

impl MediaRelay {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            headers: RwLock::new(SequenceHeaders::default()),
            publishing: AtomicBool::new(false),
        }
    }

    /// Claim the publisher slot; false if someone is already publishing
    pub fn begin_publish(&self) -> bool {
        self.publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn end_publish(&self) {
        if self.publishing.swap(false, Ordering::AcqRel) {
            *self.headers.write().await = SequenceHeaders::default();
            let _ = self.events.send(RelayEvent::Ended);
        }
    }

    pub async fn push(&self, tag: MediaTag) {
        if !tag.is_sequence_header() {
            // No viewers is not an error
            let _ = self.events.send(RelayEvent::Tag(tag));
            return;
        }

        // Cache and send under one write guard: a subscriber gets a header
        // either from the cache or from its receiver, never both
        let mut headers = self.headers.write().await;
        match tag.kind {
            TagKind::Video => headers.video = Some(tag.clone()),
            TagKind::Audio => headers.audio = Some(tag.clone()),
        }
        let _ = self.events.send(RelayEvent::Tag(tag));
    }

    /// Cached sequence headers plus a receiver for everything after them
    pub async fn subscribe(&self) -> (Vec<MediaTag>, broadcast::Receiver<RelayEvent>) {
        let headers = self.headers.read().await;
        let receiver = self.events.subscribe();
        let cached = headers
            .video
            .iter()
            .chain(headers.audio.iter())
            .cloned()
            .collect();
        (cached, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn video(data: &'static [u8], timestamp: u32) -> MediaTag {
        MediaTag {
            kind: TagKind::Video,
            timestamp,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn recognises_headers_and_keyframes() {
        assert!(video(&[0x17, 0x00, 0, 0, 0], 0).is_sequence_header());
        assert!(video(&[0x17, 0x01, 0, 0, 0], 0).is_keyframe());
        assert!(!video(&[0x27, 0x01, 0, 0, 0], 0).is_keyframe());

        let aac = MediaTag {
            kind: TagKind::Audio,
            timestamp: 0,
            data: Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]),
        };
        assert!(aac.is_sequence_header());
    }

    #[tokio::test]
    async fn single_publisher_and_header_cache() {
        let relay = MediaRelay::new(16);
        assert!(relay.begin_publish());
        assert!(!relay.begin_publish());

        relay.push(video(&[0x17, 0x00, 0, 0, 0], 0)).await;
        let (cached, mut rx) = relay.subscribe().await;
        assert_eq!(cached.len(), 1);

        relay.push(video(&[0x17, 0x01, 0, 0, 0], 40)).await;
        match rx.recv().await.unwrap() {
            RelayEvent::Tag(tag) => assert_eq!(tag.timestamp, 40),
            other => panic!("unexpected {:?}", other),
        }

        relay.end_publish().await;
        assert!(matches!(rx.recv().await.unwrap(), RelayEvent::Ended));
        assert!(relay.subscribe().await.0.is_empty());
        assert!(relay.begin_publish());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_subscribers_see_each_header_once() {
        let relay = Arc::new(MediaRelay::new(64));
        relay.begin_publish();

        let pusher = {
            let relay = relay.clone();
            tokio::spawn(async move {
                for timestamp in 0..32 {
                    relay.push(video(&[0x17, 0x00, 0, 0, 0], timestamp)).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut subscriptions = Vec::new();
        for _ in 0..32 {
            subscriptions.push(relay.subscribe().await);
            tokio::task::yield_now().await;
        }
        pusher.await.unwrap();

        for (cached, mut rx) in subscriptions {
            let mut seen: Vec<u32> = cached.iter().map(|tag| tag.timestamp).collect();
            while let Ok(RelayEvent::Tag(tag)) = rx.try_recv() {
                seen.push(tag.timestamp);
            }
            let mut unique = seen.clone();
            unique.dedup();
            assert_eq!(seen, unique, "header delivered twice");
        }
    }
}
