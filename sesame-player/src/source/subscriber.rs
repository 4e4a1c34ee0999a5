use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use log::{debug, info};
use sesame_core::{StreamKind, packet::Packet};
use tokio::{
    spawn,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};

use crate::source::{
    DataEvent, DataPayload, MediaSession, SessionEvent, SessionState, SourceError, SourceEvent,
    StreamSource, TrackSubscription,
};

/// Adapts a subscription-based session into a [`StreamSource`]: frames on
/// video/audio tracks are wire-parsed, data tracks pass through raw, and a
/// session disconnect is terminal.
pub struct SubscriberSource<S> {
    session: S,
    subscriptions: Vec<TrackSubscription>,
    events: UnboundedSender<SourceEvent>,
    pump: Option<JoinHandle<()>>,
    malformed: Arc<AtomicU64>,
}

impl<S> SubscriberSource<S>
where
    S: MediaSession,
{
    pub fn new(
        session: S,
        subscriptions: Vec<TrackSubscription>,
    ) -> (Self, UnboundedReceiver<SourceEvent>) {
        let (events, receiver) = unbounded_channel();

        (
            Self {
                session,
                subscriptions,
                events,
                pump: None,
                malformed: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Count of frames that failed wire parsing and were dropped.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<S> StreamSource for SubscriberSource<S>
where
    S: MediaSession,
{
    async fn connect(&mut self) -> Result<(), SourceError> {
        let receiver = self.session.open(&self.subscriptions).await?;
        info!(
            "[Subscriber]: session open with {} subscriptions",
            self.subscriptions.len()
        );

        let _ = self.events.send(SourceEvent::Connected);

        let tracks: HashMap<String, StreamKind> = self
            .subscriptions
            .iter()
            .map(|subscription| (subscription.track.clone(), subscription.kind))
            .collect();

        self.pump = Some(spawn(pump_session(
            receiver,
            tracks,
            self.events.clone(),
            self.malformed.clone(),
        )));

        Ok(())
    }

    async fn disconnect(&mut self) {
        self.session.close().await;

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn request_keyframe(&mut self) {
        self.session.request_keyframe();
    }
}

async fn pump_session(
    mut receiver: UnboundedReceiver<SessionEvent>,
    tracks: HashMap<String, StreamKind>,
    events: UnboundedSender<SourceEvent>,
    malformed: Arc<AtomicU64>,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            SessionEvent::Frame { track, payload } => {
                let Some(kind) = tracks.get(&track).copied() else {
                    debug!("[Subscriber]: frame on unsubscribed track {track:?}");
                    continue;
                };

                let payload = match kind {
                    StreamKind::Video | StreamKind::Audio => match Packet::parse(payload) {
                        Ok(packet) => DataPayload::Packet(packet),
                        Err(err) => {
                            malformed.fetch_add(1, Ordering::Relaxed);
                            debug!("[Subscriber]: dropping malformed packet on {track:?}: {err}");
                            continue;
                        }
                    },
                    StreamKind::Data => DataPayload::Raw(payload),
                };

                if events
                    .send(SourceEvent::Data(DataEvent {
                        track,
                        kind,
                        payload,
                    }))
                    .is_err()
                {
                    return;
                }
            }
            SessionEvent::StateChange(SessionState::Disconnected) => {
                info!("[Subscriber]: session disconnected");
                let _ = events.send(SourceEvent::Disconnected);
                return;
            }
            SessionEvent::StateChange(state) => {
                debug!("[Subscriber]: session state {state:?}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;
    use sesame_core::packet::{PacketFlags, PacketHeader, PacketType, serialize};

    use super::*;

    struct TestSession {
        events: Option<UnboundedReceiver<SessionEvent>>,
        keyframe_requests: Arc<AtomicU64>,
    }

    fn test_session() -> (TestSession, UnboundedSender<SessionEvent>, Arc<AtomicU64>) {
        let (sender, receiver) = unbounded_channel();
        let keyframe_requests = Arc::new(AtomicU64::new(0));

        (
            TestSession {
                events: Some(receiver),
                keyframe_requests: keyframe_requests.clone(),
            },
            sender,
            keyframe_requests,
        )
    }

    #[async_trait]
    impl MediaSession for TestSession {
        async fn open(
            &mut self,
            _subscriptions: &[TrackSubscription],
        ) -> Result<UnboundedReceiver<SessionEvent>, SourceError> {
            self.events.take().ok_or(SourceError::Closed)
        }

        async fn close(&mut self) {}

        fn request_keyframe(&mut self) {
            self.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn subscriptions() -> Vec<TrackSubscription> {
        vec![
            TrackSubscription::new("video", 0, StreamKind::Video),
            TrackSubscription::new("events", 1, StreamKind::Data),
        ]
    }

    fn video_frame_bytes() -> Bytes {
        let header = PacketHeader {
            flags: PacketFlags::IS_KEYFRAME,
            pts: 1000,
            id: 1,
            ty: PacketType::VideoFrame as u16,
        };
        serialize(&header, None, None, &[9, 9, 9]).unwrap().freeze()
    }

    #[tokio::test]
    async fn test_media_tracks_are_parsed() {
        let (session, frames, _) = test_session();
        let (mut source, mut events) = SubscriberSource::new(session, subscriptions());

        source.connect().await.unwrap();
        assert!(matches!(events.recv().await, Some(SourceEvent::Connected)));

        frames
            .send(SessionEvent::Frame {
                track: "video".to_string(),
                payload: video_frame_bytes(),
            })
            .unwrap();

        match events.recv().await {
            Some(SourceEvent::Data(data)) => {
                assert_eq!(data.track, "video");
                assert_eq!(data.kind, StreamKind::Video);
                match data.payload {
                    DataPayload::Packet(packet) => {
                        assert!(packet.is_keyframe());
                        assert_eq!(&packet.payload[..], &[9, 9, 9]);
                    }
                    DataPayload::Raw(_) => panic!("expected parsed packet"),
                }
            }
            other => panic!("expected data event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_data_tracks_pass_through() {
        let (session, frames, _) = test_session();
        let (mut source, mut events) = SubscriberSource::new(session, subscriptions());

        source.connect().await.unwrap();
        let _ = events.recv().await;

        frames
            .send(SessionEvent::Frame {
                track: "events".to_string(),
                payload: Bytes::from_static(b"not a sesame packet"),
            })
            .unwrap();

        match events.recv().await {
            Some(SourceEvent::Data(data)) => {
                assert_eq!(data.kind, StreamKind::Data);
                assert!(matches!(data.payload, DataPayload::Raw(_)));
            }
            other => panic!("expected raw data event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_packets_are_counted() {
        let (session, frames, _) = test_session();
        let (mut source, mut events) = SubscriberSource::new(session, subscriptions());

        source.connect().await.unwrap();
        let _ = events.recv().await;

        frames
            .send(SessionEvent::Frame {
                track: "video".to_string(),
                payload: Bytes::from_static(b"garbage"),
            })
            .unwrap();
        // A good frame after the bad one still comes through.
        frames
            .send(SessionEvent::Frame {
                track: "video".to_string(),
                payload: video_frame_bytes(),
            })
            .unwrap();

        assert!(matches!(events.recv().await, Some(SourceEvent::Data(_))));
        assert_eq!(source.malformed_packets(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let (session, frames, _) = test_session();
        let (mut source, mut events) = SubscriberSource::new(session, subscriptions());

        source.connect().await.unwrap();
        let _ = events.recv().await;

        frames
            .send(SessionEvent::StateChange(SessionState::Disconnected))
            .unwrap();
        assert!(matches!(events.recv().await, Some(SourceEvent::Disconnected)));

        // Frames after the disconnect are not delivered.
        frames
            .send(SessionEvent::Frame {
                track: "video".to_string(),
                payload: video_frame_bytes(),
            })
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keyframe_requests_forwarded() {
        let (session, _frames, keyframe_requests) = test_session();
        let (mut source, _events) = SubscriberSource::new(session, subscriptions());

        source.request_keyframe();
        assert_eq!(keyframe_requests.load(Ordering::Relaxed), 1);
    }
}
