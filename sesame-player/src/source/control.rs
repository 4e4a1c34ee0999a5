use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use sesame_core::{
    StreamKind,
    packet::{Packet, PacketType},
};
use tokio::{
    spawn,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, interval, sleep},
};

use crate::source::{
    DataEvent, DataPayload, MessageTransport, SourceError, SourceEvent, StreamSource,
    TransportEvent, TransportFrame,
};

const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const KEYFRAME_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Server broadcasts carry this id instead of echoing a request.
pub const BROADCAST_ID: i64 = -1;
/// Track name used for delivered broadcast messages.
pub const CONTROL_TRACK: &str = "control";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub request_timeout: Duration,
    /// Reconnect with this fixed delay after an unsolicited close. `None`
    /// surfaces the close instead.
    pub reconnect_delay: Option<Duration>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            reconnect_delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Subscribe to a live stream.
    Live { filename: String },
    /// Open a file for playback.
    Load {
        filename: String,
        project: Option<String>,
    },
    /// Seek the loaded file.
    Seek { position_ms: i64 },
    /// Request more packets.
    Read { packets: u32 },
    /// Release the current stream.
    Unload,
    /// Ask the server for a keyframe.
    Keyframe,
}

impl ControlCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Live { .. } => "live",
            Self::Load { .. } => "load",
            Self::Seek { .. } => "seek",
            Self::Read { .. } => "read",
            Self::Unload => "unload",
            Self::Keyframe => "keyframe",
        }
    }

    fn request(&self, id: u32) -> ControlRequest<'_> {
        let mut request = ControlRequest {
            id,
            ty: self.name(),
            param_num: None,
            filename: None,
            project: None,
        };

        match self {
            Self::Live { filename } => request.filename = Some(filename),
            Self::Load { filename, project } => {
                request.filename = Some(filename);
                request.project = project.as_deref();
            }
            Self::Seek { position_ms } => request.param_num = Some(*position_ms),
            Self::Read { packets } => request.param_num = Some(i64::from(*packets)),
            Self::Unload | Self::Keyframe => {}
        }

        request
    }
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    id: u32,
    #[serde(rename = "type")]
    ty: &'a str,
    #[serde(rename = "paramNum", skip_serializing_if = "Option::is_none")]
    param_num: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ControlResponse {
    id: i64,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

struct Waiter {
    command: &'static str,
    deadline: Instant,
    sender: oneshot::Sender<Result<Option<serde_json::Value>, SourceError>>,
}

struct Shared {
    pending: Mutex<HashMap<u32, Waiter>>,
    /// Binary frames whose header id is below this watermark are stale
    /// leftovers of pre-flush requests and get dropped.
    ignore_below: AtomicU64,
    malformed: AtomicU64,
}

/// Request/response control channel: JSON control messages and binary media
/// frames multiplexed on one message transport. Each request carries a
/// monotonically increasing id and resolves when the server echoes it.
pub struct ControlSource<T> {
    transport: Arc<tokio::sync::Mutex<T>>,
    config: ControlConfig,
    events: UnboundedSender<SourceEvent>,
    shared: Arc<Shared>,
    next_id: u32,
    last_keyframe_request: Option<Instant>,
    closing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> ControlSource<T>
where
    T: MessageTransport + 'static,
{
    pub fn new(transport: T, config: ControlConfig) -> (Self, UnboundedReceiver<SourceEvent>) {
        let (events, receiver) = unbounded_channel();

        (
            Self {
                transport: Arc::new(tokio::sync::Mutex::new(transport)),
                config,
                events,
                shared: Arc::new(Shared {
                    pending: Mutex::new(HashMap::new()),
                    ignore_below: AtomicU64::new(0),
                    malformed: AtomicU64::new(0),
                }),
                next_id: 0,
                last_keyframe_request: None,
                closing: Arc::new(AtomicBool::new(false)),
                tasks: Vec::new(),
            },
            receiver,
        )
    }

    /// Sends a request and waits for the matching response or its deadline.
    pub async fn request(
        &mut self,
        command: ControlCommand,
    ) -> Result<Option<serde_json::Value>, SourceError> {
        let id = self.take_id();
        let json = encode_request(&command.request(id))?;

        let (sender, receiver) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(
                id,
                Waiter {
                    command: command.name(),
                    deadline: Instant::now() + self.config.request_timeout,
                    sender,
                },
            );
        }

        {
            let mut transport = self.transport.lock().await;
            if let Err(err) = transport.send(TransportFrame::Text(json)).await {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&id);
                }
                return Err(err);
            }
        }

        receiver.await.map_err(|_| SourceError::Closed)?
    }

    /// Drops every media frame still in flight for requests issued before
    /// this call, by raising the id watermark. Used around seeks.
    pub fn flush(&self) {
        self.shared
            .ignore_below
            .store(u64::from(self.next_id), Ordering::Release);
    }

    pub async fn seek(&mut self, position_ms: i64) -> Result<(), SourceError> {
        self.flush();
        self.request(ControlCommand::Seek { position_ms }).await?;
        Ok(())
    }

    /// Count of binary frames that failed wire parsing.
    pub fn malformed_packets(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

#[async_trait]
impl<T> StreamSource for ControlSource<T>
where
    T: MessageTransport + 'static,
{
    async fn connect(&mut self) -> Result<(), SourceError> {
        let receiver = {
            let mut transport = self.transport.lock().await;
            transport.connect().await?
        };

        let _ = self.events.send(SourceEvent::Connected);

        self.tasks.push(spawn(pump_transport(
            self.transport.clone(),
            receiver,
            self.events.clone(),
            self.shared.clone(),
            self.closing.clone(),
            self.config.reconnect_delay,
        )));
        self.tasks
            .push(spawn(sweep_timeouts(self.shared.clone(), self.closing.clone())));

        Ok(())
    }

    async fn disconnect(&mut self) {
        self.closing.store(true, Ordering::Release);

        {
            let mut transport = self.transport.lock().await;
            transport.close().await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        // Anything still waiting will never get an answer.
        if let Ok(mut pending) = self.shared.pending.lock() {
            for (_, waiter) in pending.drain() {
                let _ = waiter.sender.send(Err(SourceError::Closed));
            }
        }
    }

    /// Rate-limited to one request per second; excess calls are dropped.
    fn request_keyframe(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_keyframe_request {
            if now.duration_since(last) < KEYFRAME_MIN_INTERVAL {
                return;
            }
        }
        self.last_keyframe_request = Some(now);

        let id = self.take_id();
        let json = match encode_request(&ControlCommand::Keyframe.request(id)) {
            Ok(json) => json,
            Err(err) => {
                warn!("[Control]: failed to encode keyframe request: {err}");
                return;
            }
        };

        let transport = self.transport.clone();
        spawn(async move {
            let mut transport = transport.lock().await;
            if let Err(err) = transport.send(TransportFrame::Text(json)).await {
                warn!("[Control]: failed to send keyframe request: {err}");
            }
        });
    }
}

fn encode_request(request: &ControlRequest<'_>) -> Result<String, SourceError> {
    serde_json::to_string(request).map_err(|err| SourceError::Transport(err.to_string()))
}

async fn pump_transport<T>(
    transport: Arc<tokio::sync::Mutex<T>>,
    mut receiver: UnboundedReceiver<TransportEvent>,
    events: UnboundedSender<SourceEvent>,
    shared: Arc<Shared>,
    closing: Arc<AtomicBool>,
    reconnect_delay: Option<Duration>,
) where
    T: MessageTransport + 'static,
{
    loop {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Frame(TransportFrame::Text(text)) => {
                    handle_text(&text, &shared, &events);
                }
                TransportEvent::Frame(TransportFrame::Binary(bytes)) => {
                    handle_binary(bytes, &shared, &events);
                }
                TransportEvent::Closed => break,
            }
        }

        if closing.load(Ordering::Acquire) {
            let _ = events.send(SourceEvent::Disconnected);
            return;
        }

        let Some(delay) = reconnect_delay else {
            let _ = events.send(SourceEvent::Error(SourceError::Closed));
            let _ = events.send(SourceEvent::Disconnected);
            return;
        };

        warn!("[Control]: connection closed, reconnecting in {delay:?}");
        sleep(delay).await;

        let mut locked = transport.lock().await;
        match locked.connect().await {
            Ok(new_receiver) => {
                receiver = new_receiver;
                let _ = events.send(SourceEvent::Connected);
            }
            Err(err) => {
                warn!("[Control]: reconnect failed: {err}");
                let _ = events.send(SourceEvent::Error(err));
            }
        }
    }
}

fn handle_text(text: &str, shared: &Shared, events: &UnboundedSender<SourceEvent>) {
    let response = match serde_json::from_str::<ControlResponse>(text) {
        Ok(response) => response,
        Err(err) => {
            warn!("[Control]: failed to deserialize control message: {err}");
            return;
        }
    };

    if response.id == BROADCAST_ID {
        let _ = events.send(SourceEvent::Data(DataEvent {
            track: CONTROL_TRACK.to_string(),
            kind: StreamKind::Data,
            payload: DataPayload::Raw(Bytes::from(text.as_bytes().to_vec())),
        }));
        return;
    }

    let Ok(id) = u32::try_from(response.id) else {
        warn!("[Control]: response with invalid id {}", response.id);
        return;
    };

    let waiter = match shared.pending.lock() {
        Ok(mut pending) => pending.remove(&id),
        Err(_) => None,
    };
    let Some(waiter) = waiter else {
        debug!("[Control]: response for unknown request {id}");
        return;
    };

    let result = match response.error {
        Some(error) => Err(SourceError::Request(error)),
        None => Ok(response.data),
    };
    let _ = waiter.sender.send(result);
}

fn handle_binary(bytes: Bytes, shared: &Shared, events: &UnboundedSender<SourceEvent>) {
    let packet = match Packet::parse(bytes) {
        Ok(packet) => packet,
        Err(err) => {
            shared.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("[Control]: dropping malformed media frame: {err}");
            return;
        }
    };

    // Stale frame from before the last flush.
    if packet.header.id < shared.ignore_below.load(Ordering::Acquire) {
        trace!("[Control]: dropping stale frame {}", packet.header.id);
        return;
    }

    let (track, kind) = match packet.header.packet_type() {
        Some(PacketType::VideoFrame) => ("video", StreamKind::Video),
        Some(PacketType::AudioFrame) => ("audio", StreamKind::Audio),
        _ => ("data", StreamKind::Data),
    };

    let _ = events.send(SourceEvent::Data(DataEvent {
        track: track.to_string(),
        kind,
        payload: DataPayload::Packet(packet),
    }));
}

/// Rejects expired waiters with `RequestTimeout`; every outstanding request
/// carries a deadline.
async fn sweep_timeouts(shared: Arc<Shared>, closing: Arc<AtomicBool>) {
    let mut ticker = interval(TIMEOUT_SWEEP_INTERVAL);

    loop {
        ticker.tick().await;
        if closing.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let Ok(mut pending) = shared.pending.lock() else {
            return;
        };

        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(waiter) = pending.remove(&id) {
                warn!("[Control]: request {id} ({}) timed out", waiter.command);
                let _ = waiter.sender.send(Err(SourceError::RequestTimeout {
                    id,
                    command: waiter.command,
                }));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sesame_core::packet::{PacketFlags, PacketHeader, serialize};

    use super::*;

    struct TestTransport {
        incoming: Arc<Mutex<Option<UnboundedSender<TransportEvent>>>>,
        sent: Arc<Mutex<Vec<String>>>,
        connects: Arc<AtomicU64>,
    }

    struct TestHandle {
        incoming: Arc<Mutex<Option<UnboundedSender<TransportEvent>>>>,
        sent: Arc<Mutex<Vec<String>>>,
        connects: Arc<AtomicU64>,
    }

    impl TestHandle {
        fn send_text(&self, text: &str) {
            let incoming = self.incoming.lock().unwrap();
            incoming
                .as_ref()
                .unwrap()
                .send(TransportEvent::Frame(TransportFrame::Text(text.to_string())))
                .unwrap();
        }

        fn send_binary(&self, bytes: Bytes) {
            let incoming = self.incoming.lock().unwrap();
            incoming
                .as_ref()
                .unwrap()
                .send(TransportEvent::Frame(TransportFrame::Binary(bytes)))
                .unwrap();
        }

        fn close(&self) {
            let incoming = self.incoming.lock().unwrap();
            incoming.as_ref().unwrap().send(TransportEvent::Closed).unwrap();
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn test_transport() -> (TestTransport, TestHandle) {
        let incoming = Arc::new(Mutex::new(None));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicU64::new(0));

        (
            TestTransport {
                incoming: incoming.clone(),
                sent: sent.clone(),
                connects: connects.clone(),
            },
            TestHandle {
                incoming,
                sent,
                connects,
            },
        )
    }

    #[async_trait]
    impl MessageTransport for TestTransport {
        async fn connect(&mut self) -> Result<UnboundedReceiver<TransportEvent>, SourceError> {
            let (sender, receiver) = unbounded_channel();
            *self.incoming.lock().unwrap() = Some(sender);
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(receiver)
        }

        async fn send(&mut self, frame: TransportFrame) -> Result<(), SourceError> {
            if let TransportFrame::Text(text) = frame {
                self.sent.lock().unwrap().push(text);
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn media_frame(id: u64) -> Bytes {
        let header = PacketHeader {
            flags: PacketFlags::empty(),
            pts: 0,
            id,
            ty: 1,
        };
        serialize(&header, None, None, &[1]).unwrap().freeze()
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (transport, handle) = test_transport();
        let (mut source, _events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();

        let request = tokio::spawn(async move {
            let result = source
                .request(ControlCommand::Load {
                    filename: "clip.mp4".to_string(),
                    project: Some("demo".to_string()),
                })
                .await;
            (source, result)
        });

        // Wait for the outgoing frame, then answer it.
        let sent = loop {
            let sent = handle.sent();
            if !sent.is_empty() {
                break sent;
            }
            tokio::task::yield_now().await;
        };
        assert!(sent[0].contains("\"type\":\"load\""));
        assert!(sent[0].contains("\"filename\":\"clip.mp4\""));
        assert!(sent[0].contains("\"id\":0"));

        handle.send_text(r#"{"id":0,"data":{"duration":1000}}"#);

        let (_source, result) = request.await.unwrap();
        let data = result.unwrap().unwrap();
        assert_eq!(data["duration"], 1000);
    }

    #[tokio::test]
    async fn test_request_error_response() {
        let (transport, handle) = test_transport();
        let (mut source, _events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();

        let request = tokio::spawn(async move {
            let result = source.request(ControlCommand::Unload).await;
            (source, result)
        });

        while handle.sent().is_empty() {
            tokio::task::yield_now().await;
        }
        handle.send_text(r#"{"id":0,"error":"no stream loaded"}"#);

        let (_source, result) = request.await.unwrap();
        assert!(matches!(result, Err(SourceError::Request(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (transport, _handle) = test_transport();
        let (mut source, _events) = ControlSource::new(
            transport,
            ControlConfig {
                request_timeout: Duration::from_secs(2),
                reconnect_delay: None,
            },
        );
        source.connect().await.unwrap();

        let result = source.request(ControlCommand::Read { packets: 10 }).await;

        assert!(matches!(
            result,
            Err(SourceError::RequestTimeout { id: 0, command: "read" })
        ));
    }

    #[tokio::test]
    async fn test_flush_watermark_drops_stale_frames() {
        let (transport, handle) = test_transport();
        let (mut source, mut events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();
        assert!(matches!(events.recv().await, Some(SourceEvent::Connected)));

        // Raise the outgoing id past the frames in flight.
        for _ in 0..3 {
            source.take_id();
        }
        source.flush();

        handle.send_binary(media_frame(2));
        handle.send_binary(media_frame(3));

        // Only the frame at the watermark comes through.
        match events.recv().await {
            Some(SourceEvent::Data(data)) => match data.payload {
                DataPayload::Packet(packet) => assert_eq!(packet.header.id, 3),
                DataPayload::Raw(_) => panic!("expected packet"),
            },
            other => panic!("expected data event, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_requests_rate_limited() {
        let (transport, handle) = test_transport();
        let (mut source, _events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();

        source.request_keyframe();
        source.request_keyframe();
        tokio::task::yield_now().await;

        assert_eq!(handle.sent().len(), 1);
        assert!(handle.sent()[0].contains("\"type\":\"keyframe\""));

        tokio::time::advance(Duration::from_millis(1100)).await;
        source.request_keyframe();
        tokio::task::yield_now().await;

        assert_eq!(handle.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect() {
        let (transport, handle) = test_transport();
        let (mut source, mut events) = ControlSource::new(
            transport,
            ControlConfig {
                request_timeout: Duration::from_secs(10),
                reconnect_delay: Some(Duration::from_millis(250)),
            },
        );
        source.connect().await.unwrap();
        assert!(matches!(events.recv().await, Some(SourceEvent::Connected)));
        assert_eq!(handle.connects.load(Ordering::SeqCst), 1);

        handle.close();

        assert!(matches!(events.recv().await, Some(SourceEvent::Connected)));
        assert_eq!(handle.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcasts_surface_as_control_data() {
        let (transport, handle) = test_transport();
        let (mut source, mut events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();
        let _ = events.recv().await;

        handle.send_text(r#"{"id":-1,"data":{"notice":"stream ending"}}"#);

        match events.recv().await {
            Some(SourceEvent::Data(data)) => {
                assert_eq!(data.track, CONTROL_TRACK);
                assert!(matches!(data.payload, DataPayload::Raw(_)));
            }
            other => panic!("expected broadcast data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_media_frames_counted() {
        let (transport, handle) = test_transport();
        let (mut source, mut events) = ControlSource::new(transport, ControlConfig::default());
        source.connect().await.unwrap();
        let _ = events.recv().await;

        handle.send_binary(Bytes::from_static(b"junk"));
        handle.send_binary(media_frame(0));

        assert!(matches!(events.recv().await, Some(SourceEvent::Data(_))));
        assert_eq!(source.malformed_packets(), 1);
    }
}
