use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use sesame_core::StreamKind;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("the sink is not connected")]
    NotConnected,
    #[error("the sink is closed")]
    Closed,
}

/// One wire-serialized packet on its way out.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    pub track: String,
    pub bytes: Bytes,
    pub is_keyframe: bool,
    pub timestamp_us: i64,
    pub kind: StreamKind,
}

/// The outbound mirror of a stream source.
#[async_trait]
pub trait PacketSink: Send {
    async fn connect(&mut self) -> Result<(), SinkError>;

    async fn disconnect(&mut self);

    fn send(&mut self, packet: SerializedPacket) -> Result<(), SinkError>;

    /// Raw caller bytes on a data track; the wire format is not applied.
    fn send_data(&mut self, track: &str, payload: Bytes) -> Result<(), SinkError>;

    /// Called by the transport layer when the remote end needs a keyframe.
    fn notify_keyframe_request(&mut self);

    /// The keyframe feedback channel; taken once by the capture pipeline.
    fn keyframe_requests(&mut self) -> Option<UnboundedReceiver<()>>;

    /// Forget group state so the next video frame opens a fresh group.
    fn reset_groups(&mut self) {}

    async fn dispose(&mut self) {
        self.disconnect().await;
    }
}

/// Outbound half of a message-shaped transport.
#[async_trait]
pub trait MessageSender: Send {
    async fn connect(&mut self) -> Result<(), SinkError>;

    fn send_binary(&mut self, payload: Bytes) -> Result<(), SinkError>;

    async fn close(&mut self);
}

/// Outbound half of a session-shaped transport, delivering `(track, bytes,
/// new_group)` frames.
#[async_trait]
pub trait SessionPublisher: Send {
    async fn connect(&mut self) -> Result<(), SinkError>;

    fn publish(&mut self, track: &str, payload: Bytes, new_group: bool)
    -> Result<(), SinkError>;

    async fn close(&mut self);
}

/// Simplest sink: one transport message per packet, no grouping.
pub struct MessageSink<T> {
    transport: T,
    connected: bool,
    keyframe_sender: UnboundedSender<()>,
    keyframe_receiver: Option<UnboundedReceiver<()>>,
}

impl<T> MessageSink<T>
where
    T: MessageSender,
{
    pub fn new(transport: T) -> Self {
        let (keyframe_sender, keyframe_receiver) = unbounded_channel();

        Self {
            transport,
            connected: false,
            keyframe_sender,
            keyframe_receiver: Some(keyframe_receiver),
        }
    }
}

#[async_trait]
impl<T> PacketSink for MessageSink<T>
where
    T: MessageSender,
{
    async fn connect(&mut self) -> Result<(), SinkError> {
        self.transport.connect().await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.transport.close().await;
        self.connected = false;
    }

    fn send(&mut self, packet: SerializedPacket) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }
        self.transport.send_binary(packet.bytes)
    }

    fn send_data(&mut self, _track: &str, payload: Bytes) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }
        self.transport.send_binary(payload)
    }

    fn notify_keyframe_request(&mut self) {
        let _ = self.keyframe_sender.send(());
    }

    fn keyframe_requests(&mut self) -> Option<UnboundedReceiver<()>> {
        self.keyframe_receiver.take()
    }
}

/// How many audio packets share one delivery group.
const DEFAULT_AUDIO_GROUP_SIZE: u64 = 50;

struct GroupState {
    kind: StreamKind,
    /// Packets sent on this track since the track (or its groups) were
    /// last reset.
    count: u64,
}

/// Session-broadcast sink partitioning packets into delivery groups: a
/// keyframe opens a new video group, audio groups rotate every N packets,
/// and every data send is its own group.
pub struct SessionSink<P> {
    publisher: P,
    connected: bool,
    audio_group_size: u64,
    groups: HashMap<String, GroupState>,
    keyframe_sender: UnboundedSender<()>,
    keyframe_receiver: Option<UnboundedReceiver<()>>,
}

impl<P> SessionSink<P>
where
    P: SessionPublisher,
{
    pub fn new(publisher: P) -> Self {
        Self::with_audio_group_size(publisher, DEFAULT_AUDIO_GROUP_SIZE)
    }

    pub fn with_audio_group_size(publisher: P, audio_group_size: u64) -> Self {
        let (keyframe_sender, keyframe_receiver) = unbounded_channel();

        Self {
            publisher,
            connected: false,
            audio_group_size: audio_group_size.max(1),
            groups: HashMap::new(),
            keyframe_sender,
            keyframe_receiver: Some(keyframe_receiver),
        }
    }

    fn begin_packet(&mut self, track: &str, kind: StreamKind, is_keyframe: bool) -> bool {
        let state = self
            .groups
            .entry(track.to_string())
            .or_insert(GroupState { kind, count: 0 });
        state.kind = kind;

        let new_group = match kind {
            StreamKind::Video => is_keyframe || state.count == 0,
            StreamKind::Audio => state.count % self.audio_group_size == 0,
            StreamKind::Data => true,
        };

        state.count += 1;
        new_group
    }
}

#[async_trait]
impl<P> PacketSink for SessionSink<P>
where
    P: SessionPublisher,
{
    async fn connect(&mut self) -> Result<(), SinkError> {
        self.publisher.connect().await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.publisher.close().await;
        self.connected = false;
        self.groups.clear();
    }

    fn send(&mut self, packet: SerializedPacket) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }

        let new_group = self.begin_packet(&packet.track, packet.kind, packet.is_keyframe);
        self.publisher.publish(&packet.track, packet.bytes, new_group)
    }

    fn send_data(&mut self, track: &str, payload: Bytes) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }

        let new_group = self.begin_packet(track, StreamKind::Data, false);
        self.publisher.publish(track, payload, new_group)
    }

    fn notify_keyframe_request(&mut self) {
        let _ = self.keyframe_sender.send(());
    }

    fn keyframe_requests(&mut self) -> Option<UnboundedReceiver<()>> {
        self.keyframe_receiver.take()
    }

    fn reset_groups(&mut self) {
        debug!("[Sink]: resetting video group state");
        self.groups
            .retain(|_, state| state.kind != StreamKind::Video);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct TestPublisher {
        published: Arc<Mutex<Vec<(String, usize, bool)>>>,
    }

    #[async_trait]
    impl SessionPublisher for TestPublisher {
        async fn connect(&mut self) -> Result<(), SinkError> {
            Ok(())
        }

        fn publish(
            &mut self,
            track: &str,
            payload: Bytes,
            new_group: bool,
        ) -> Result<(), SinkError> {
            self.published
                .lock()
                .unwrap()
                .push((track.to_string(), payload.len(), new_group));
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn video_packet(is_keyframe: bool) -> SerializedPacket {
        SerializedPacket {
            track: "video".to_string(),
            bytes: Bytes::from_static(&[0u8; 8]),
            is_keyframe,
            timestamp_us: 0,
            kind: StreamKind::Video,
        }
    }

    fn audio_packet() -> SerializedPacket {
        SerializedPacket {
            track: "audio".to_string(),
            bytes: Bytes::from_static(&[0u8; 4]),
            is_keyframe: false,
            timestamp_us: 0,
            kind: StreamKind::Audio,
        }
    }

    async fn connected_sink() -> (SessionSink<TestPublisher>, Arc<Mutex<Vec<(String, usize, bool)>>>) {
        let publisher = TestPublisher::default();
        let published = publisher.published.clone();
        let mut sink = SessionSink::new(publisher);
        sink.connect().await.unwrap();
        (sink, published)
    }

    #[tokio::test]
    async fn test_video_groups_start_at_keyframes() {
        let (mut sink, published) = connected_sink().await;

        sink.send(video_packet(true)).unwrap();
        sink.send(video_packet(false)).unwrap();
        sink.send(video_packet(false)).unwrap();
        sink.send(video_packet(true)).unwrap();
        sink.send(video_packet(false)).unwrap();

        let groups: Vec<bool> = published.lock().unwrap().iter().map(|(_, _, g)| *g).collect();
        assert_eq!(groups, vec![true, false, false, true, false]);
    }

    #[tokio::test]
    async fn test_audio_groups_rotate_every_n_packets() {
        let publisher = TestPublisher::default();
        let published = publisher.published.clone();
        let mut sink = SessionSink::with_audio_group_size(publisher, 3);
        sink.connect().await.unwrap();

        for _ in 0..7 {
            sink.send(audio_packet()).unwrap();
        }

        let groups: Vec<bool> = published.lock().unwrap().iter().map(|(_, _, g)| *g).collect();
        assert_eq!(groups, vec![true, false, false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_data_sends_are_single_groups() {
        let (mut sink, published) = connected_sink().await;

        sink.send_data("events", Bytes::from_static(b"a")).unwrap();
        sink.send_data("events", Bytes::from_static(b"b")).unwrap();

        let groups: Vec<bool> = published.lock().unwrap().iter().map(|(_, _, g)| *g).collect();
        assert_eq!(groups, vec![true, true]);
    }

    #[tokio::test]
    async fn test_reset_groups_reopens_video_group() {
        let (mut sink, published) = connected_sink().await;

        sink.send(video_packet(true)).unwrap();
        sink.send(video_packet(false)).unwrap();

        // Audio state survives a video group reset.
        sink.send(audio_packet()).unwrap();
        sink.send(audio_packet()).unwrap();

        sink.reset_groups();

        sink.send(video_packet(false)).unwrap();
        sink.send(audio_packet()).unwrap();

        let published = published.lock().unwrap();
        let video: Vec<bool> = published
            .iter()
            .filter(|(track, _, _)| track == "video")
            .map(|(_, _, g)| *g)
            .collect();
        // The delta after the reset opens a fresh group.
        assert_eq!(video, vec![true, false, true]);

        let audio: Vec<bool> = published
            .iter()
            .filter(|(track, _, _)| track == "audio")
            .map(|(_, _, g)| *g)
            .collect();
        assert_eq!(audio, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut sink = SessionSink::new(TestPublisher::default());
        assert!(matches!(
            sink.send(video_packet(true)),
            Err(SinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_keyframe_feedback_channel() {
        let (mut sink, _published) = connected_sink().await;
        let mut requests = sink.keyframe_requests().unwrap();

        sink.notify_keyframe_request();
        assert!(requests.try_recv().is_ok());
        assert!(requests.try_recv().is_err());

        // The channel can only be taken once.
        assert!(sink.keyframe_requests().is_none());
    }
}
