use async_trait::async_trait;
use bytes::Bytes;
use sesame_core::{StreamKind, packet::Packet};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod control;
pub mod subscriber;

#[derive(Debug, Error, Clone)]
pub enum SourceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request {id} ({command}) timed out")]
    RequestTimeout { id: u32, command: &'static str },
    #[error("request failed: {0}")]
    Request(String),
    #[error("the source is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub enum DataPayload {
    /// A parsed Sesame packet (video and audio tracks).
    Packet(Packet),
    /// Raw bytes from a data track; the wire format is not applied.
    Raw(Bytes),
}

#[derive(Debug, Clone)]
pub struct DataEvent {
    pub track: String,
    pub kind: StreamKind,
    pub payload: DataPayload,
}

#[derive(Debug)]
pub enum SourceEvent {
    Connected,
    Disconnected,
    Error(SourceError),
    Data(DataEvent),
}

/// A stream of media packets. Events are delivered on the receiver handed
/// out at construction; ordering is only guaranteed within a track.
#[async_trait]
pub trait StreamSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;

    async fn disconnect(&mut self);

    /// Ask the producer for a keyframe. Optional; default is a no-op.
    fn request_keyframe(&mut self) {}

    async fn dispose(&mut self) {
        self.disconnect().await;
    }
}

// --------------- session-shaped transport (subscriber adapter) ---------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChange(SessionState),
    /// One delivered frame of bytes on a subscribed track.
    Frame { track: String, payload: Bytes },
}

#[derive(Debug, Clone)]
pub struct TrackSubscription {
    pub track: String,
    pub priority: u8,
    /// Decides whether frames on this track are wire-parsed (video/audio)
    /// or passed through raw (data).
    pub kind: StreamKind,
}

impl TrackSubscription {
    pub fn new(track: impl Into<String>, priority: u8, kind: StreamKind) -> Self {
        Self {
            track: track.into(),
            priority,
            kind,
        }
    }
}

/// A dynamically opened media session, e.g. a subscription-based broadcast
/// transport. Implementations deliver events until closed.
#[async_trait]
pub trait MediaSession: Send {
    async fn open(
        &mut self,
        subscriptions: &[TrackSubscription],
    ) -> Result<UnboundedReceiver<SessionEvent>, SourceError>;

    async fn close(&mut self);

    fn request_keyframe(&mut self) {}
}

// --------------- message-shaped transport (control adapter) ---------------

#[derive(Debug)]
pub enum TransportFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug)]
pub enum TransportEvent {
    Frame(TransportFrame),
    Closed,
}

/// A bidirectional message channel multiplexing text control frames and
/// binary media frames, WebSocket-shaped.
#[async_trait]
pub trait MessageTransport: Send {
    async fn connect(&mut self) -> Result<UnboundedReceiver<TransportEvent>, SourceError>;

    async fn send(&mut self, frame: TransportFrame) -> Result<(), SourceError>;

    async fn close(&mut self);
}
