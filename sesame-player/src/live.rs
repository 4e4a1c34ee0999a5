use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use log::{debug, error, info, warn};
use sesame_core::{
    StreamKind,
    codec::{CodecIdentity, codec_data_changed, codec_string},
    packet::{CodecData, Packet, PacketType},
    time::{MICROSECONDS, to_micros},
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::{
    PlayerError,
    config::PlayerConfig,
    decoder::{DecoderConfig, DecoderError, DecoderEvent, DecoderHarness, DecoderKind, DecoderProvider},
    frame::DecodedFrame,
    schedule::{FrameScheduler, FrameTiming, SchedulerConfig, SchedulerTelemetry},
    source::{DataEvent, DataPayload, SourceEvent, StreamSource},
};

const KEYFRAME_REQUEST_INTERVAL_US: i64 = 1_000_000;
const MAX_BUFFER_DELAY_MS: u32 = 5000;
/// Arrival records older than this relative to the newest packet are stale.
const ARRIVAL_PRUNE_HORIZON_US: i64 = 10_000_000;
const ARRIVAL_MAP_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStage {
    /// A reconfigure is in flight; packets queue up behind it.
    Configuring,
    /// Non-key packets are dropped until a keyframe restarts decoding.
    WaitingKeyframe,
    Decoding,
}

#[derive(Debug)]
pub enum PlayerEvent {
    StateChanged(PlayerState),
    Error(PlayerError),
    /// Auxiliary (non-media) data passed through to the embedder.
    Data(DataEvent),
}

struct ArrivalRecord {
    arrival_us: i64,
    keyframe: bool,
}

/// The live playback state machine: routes source events, reconfigures the
/// decoder on codec change, enforces wait-for-keyframe, and pumps decoded
/// frames through the scheduler to the renderer.
///
/// All methods must be driven from a single task; transport and decoder
/// outputs cross in through channels.
pub struct LivePlayer<S> {
    config: PlayerConfig,
    source: S,
    video: DecoderHarness,
    video_events: UnboundedReceiver<DecoderEvent>,
    audio: Option<DecoderHarness>,
    audio_events: Option<UnboundedReceiver<DecoderEvent>>,
    scheduler: FrameScheduler,
    state: PlayerState,
    stage: DecodeStage,
    video_codec: Option<CodecData>,
    audio_codec: Option<CodecData>,
    /// Identity that failed to configure; retried only on a keyframe with a
    /// different identity.
    failed_codec: Option<CodecIdentity>,
    queued: VecDeque<Packet>,
    arrivals: HashMap<i64, ArrivalRecord>,
    audio_frames: VecDeque<DecodedFrame>,
    last_frame: Option<DecodedFrame>,
    last_keyframe_request_us: Option<i64>,
    events: UnboundedSender<PlayerEvent>,
}

impl<S> LivePlayer<S>
where
    S: StreamSource,
{
    pub fn new(
        source: S,
        provider: Arc<dyn DecoderProvider>,
        mut config: PlayerConfig,
    ) -> (Self, UnboundedReceiver<PlayerEvent>) {
        if config.buffer_delay_ms > MAX_BUFFER_DELAY_MS {
            warn!(
                "[Player]: buffer_delay_ms {} clamped to {MAX_BUFFER_DELAY_MS}",
                config.buffer_delay_ms
            );
            config.buffer_delay_ms = MAX_BUFFER_DELAY_MS;
        }

        let (video, video_events) = DecoderHarness::new(
            provider.clone(),
            config.preferred_decoder,
            config.max_decoder_queue,
        );
        let (audio, audio_events) = if config.enable_audio {
            let (harness, events) = DecoderHarness::new(
                provider,
                config.preferred_decoder,
                config.max_decoder_queue,
            );
            (Some(harness), Some(events))
        } else {
            (None, None)
        };

        let scheduler = FrameScheduler::new(SchedulerConfig {
            buffer_delay_ms: config.buffer_delay_ms,
            debug_logging: config.debug_logging,
            ..Default::default()
        });

        let (events, receiver) = unbounded_channel();

        (
            Self {
                config,
                source,
                video,
                video_events,
                audio,
                audio_events,
                scheduler,
                state: PlayerState::Idle,
                stage: DecodeStage::WaitingKeyframe,
                video_codec: None,
                audio_codec: None,
                failed_codec: None,
                queued: VecDeque::new(),
                arrivals: HashMap::new(),
                audio_frames: VecDeque::new(),
                last_frame: None,
                last_keyframe_request_us: None,
                events,
            },
            receiver,
        )
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn telemetry(&self) -> SchedulerTelemetry {
        self.scheduler.telemetry()
    }

    pub fn scheduler(&mut self) -> &mut FrameScheduler {
        &mut self.scheduler
    }

    pub fn set_buffer_delay(&mut self, buffer_delay_ms: u32) {
        self.scheduler
            .set_buffer_delay(buffer_delay_ms.min(MAX_BUFFER_DELAY_MS));
    }

    pub async fn play(&mut self) -> Result<(), PlayerError> {
        match self.state {
            PlayerState::Idle => {
                if let Err(err) = self.source.connect().await {
                    self.fail(PlayerError::Transport(err.clone()));
                    return Err(PlayerError::Transport(err));
                }
                self.set_state(PlayerState::Playing);
            }
            PlayerState::Paused => self.set_state(PlayerState::Playing),
            PlayerState::Playing => {}
            PlayerState::Error => return Err(PlayerError::Invariant("player is in error state")),
        }

        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.set_state(PlayerState::Paused);
        }
    }

    /// Flushes the decode pipeline and waits for the next keyframe.
    pub async fn flush(&mut self, now_us: i64) {
        if let Err(err) = self.video.flush().await {
            warn!("[Player]: decoder flush failed: {err}");
        }
        self.scheduler.clear();
        self.arrivals.clear();
        self.stage = DecodeStage::WaitingKeyframe;
        self.force_request_keyframe(now_us);
    }

    /// Switches the preferred decoder family. A switch away from the live
    /// decoder tears the pipeline down and restarts at the next keyframe.
    pub async fn set_preferred_decoder(&mut self, kind: DecoderKind, now_us: i64) {
        self.video.set_preferred(kind);

        let live = self.video.active_kind();
        if live.is_none() || live == Some(kind) {
            return;
        }

        info!("[Player]: switching decoder to {kind:?}");
        self.video.dispose();
        self.scheduler.clear();
        self.arrivals.clear();
        self.video_codec = None;
        self.stage = DecodeStage::WaitingKeyframe;
        self.force_request_keyframe(now_us);
    }

    /// Feeds one source event through the state machine.
    pub async fn handle_source_event(&mut self, event: SourceEvent, now_us: i64) {
        match event {
            SourceEvent::Connected => debug!("[Player]: source connected"),
            SourceEvent::Disconnected => {
                info!("[Player]: source disconnected");
                self.scheduler.clear();
                self.arrivals.clear();
                self.stage = DecodeStage::WaitingKeyframe;
            }
            SourceEvent::Error(err) => self.fail(PlayerError::Transport(err)),
            SourceEvent::Data(data) => self.handle_data(data, now_us).await,
        }
    }

    async fn handle_data(&mut self, data: DataEvent, now_us: i64) {
        let DataEvent {
            track,
            kind,
            payload,
        } = data;

        let packet = match payload {
            DataPayload::Packet(packet) => packet,
            DataPayload::Raw(payload) => {
                // Raw data tracks are the embedder's business.
                let _ = self.events.send(PlayerEvent::Data(DataEvent {
                    track,
                    kind,
                    payload: DataPayload::Raw(payload),
                }));
                return;
            }
        };

        let is_audio = packet.header.packet_type() == Some(PacketType::AudioFrame)
            || kind == StreamKind::Audio;
        if is_audio {
            if track_matches(self.config.audio_track_name.as_deref(), &track) {
                self.handle_audio_packet(packet).await;
            }
            return;
        }

        if kind != StreamKind::Video {
            return;
        }
        if !track_matches(self.config.video_track_name.as_deref(), &track) {
            return;
        }

        self.handle_video_packet(packet, now_us).await;
    }

    async fn handle_video_packet(&mut self, packet: Packet, now_us: i64) {
        if self.state == PlayerState::Error {
            // A configure failure is recoverable, but only on a keyframe
            // advertising a different codec identity.
            let Some(codec_data) = packet.codec_data else {
                return;
            };
            if !packet.is_keyframe() || Some(CodecIdentity::from(&codec_data)) == self.failed_codec
            {
                return;
            }
            self.reconfigure(packet, now_us).await;
            return;
        }
        if self.state == PlayerState::Idle {
            return;
        }

        let changed = match packet.codec_data.as_ref() {
            Some(new) => codec_data_changed(self.video_codec.as_ref(), Some(new)),
            None => false,
        };

        if self.video_codec.is_none() && packet.codec_data.is_none() {
            // Nothing to configure from; keep asking for a keyframe, which
            // carries the stream description.
            self.maybe_request_keyframe(now_us);
            return;
        }

        if changed {
            if !packet.is_keyframe() {
                debug!("[Player]: codec changed on a delta frame, waiting for a keyframe");
                return;
            }
            self.reconfigure(packet, now_us).await;
            return;
        }

        match self.stage {
            DecodeStage::Configuring => self.queued.push_back(packet),
            DecodeStage::WaitingKeyframe => {
                if packet.is_keyframe() {
                    self.stage = DecodeStage::Decoding;
                    self.decode_video(packet, now_us);
                } else {
                    self.maybe_request_keyframe(now_us);
                }
            }
            DecodeStage::Decoding => self.decode_video(packet, now_us),
        }
    }

    async fn reconfigure(&mut self, keyframe: Packet, now_us: i64) {
        let Some(codec_data) = keyframe.codec_data else {
            return;
        };
        let Some(codec) = codec_string(&codec_data) else {
            self.fail(PlayerError::UnsupportedCodec(format!(
                "unknown codec type {}",
                codec_data.codec_type
            )));
            return;
        };

        info!(
            "[Player]: configuring video decoder: {codec} {}x{}",
            codec_data.width, codec_data.height
        );

        self.stage = DecodeStage::Configuring;
        self.queued.push_back(keyframe);

        let config = DecoderConfig {
            codec,
            width: u32::from(codec_data.width),
            height: u32::from(codec_data.height),
            ..Default::default()
        };

        match self.video.configure(config).await {
            Ok(()) => {
                self.video_codec = Some(codec_data);
                self.failed_codec = None;
                if self.state == PlayerState::Error {
                    self.set_state(PlayerState::Playing);
                }
                self.stage = DecodeStage::Decoding;

                while let Some(packet) = self.queued.pop_front() {
                    self.decode_video(packet, now_us);
                }
            }
            Err(DecoderError::Unsupported(codec)) => {
                self.queued.clear();
                self.fail(PlayerError::UnsupportedCodec(codec));
            }
            Err(err) => {
                self.queued.clear();
                self.failed_codec = Some(CodecIdentity::from(&codec_data));
                self.fail(PlayerError::ConfigureFailed(err.to_string()));
            }
        }
    }

    fn decode_video(&mut self, packet: Packet, now_us: i64) {
        let timebase = packet
            .codec_data
            .map(|data| data.timebase())
            .unwrap_or(MICROSECONDS);
        let pts_us = to_micros(packet.header.pts, timebase) as i64;

        self.arrivals.insert(
            pts_us,
            ArrivalRecord {
                arrival_us: now_us,
                keyframe: packet.is_keyframe(),
            },
        );
        if self.arrivals.len() > ARRIVAL_MAP_LIMIT {
            self.arrivals
                .retain(|ts, _| pts_us - *ts < ARRIVAL_PRUNE_HORIZON_US);
        }

        if let Err(err) = self.video.decode_packet(&packet) {
            warn!("[Player]: video decode failed: {err}");
        }
    }

    async fn handle_audio_packet(&mut self, packet: Packet) {
        let Some(audio) = self.audio.as_mut() else {
            return;
        };

        // Same codec-change policy as video; audio needs no keyframe.
        if let Some(codec_data) = packet.codec_data {
            if codec_data_changed(self.audio_codec.as_ref(), Some(&codec_data)) {
                let Some(codec) = codec_string(&codec_data) else {
                    self.fail(PlayerError::UnsupportedCodec(format!(
                        "unknown codec type {}",
                        codec_data.codec_type
                    )));
                    return;
                };

                let config = DecoderConfig {
                    codec,
                    sample_rate: codec_data.sample_rate,
                    channels: codec_data.channels,
                    ..Default::default()
                };
                match audio.configure(config).await {
                    Ok(()) => self.audio_codec = Some(codec_data),
                    Err(err) => {
                        self.fail(PlayerError::ConfigureFailed(err.to_string()));
                        return;
                    }
                }
            }
        }

        let Some(audio) = self.audio.as_mut() else {
            return;
        };
        if audio.configured().is_some() {
            if let Err(err) = audio.decode_packet(&packet) {
                warn!("[Player]: audio decode failed: {err}");
            }
        }
    }

    /// Returns the frame to display at `now_us`. Outside `Playing` the last
    /// displayed frame is returned without pulling the scheduler.
    pub async fn get_video_frame(&mut self, now_us: i64) -> Option<&DecodedFrame> {
        self.pump_decoder(now_us).await;

        if self.state != PlayerState::Playing {
            return self.last_frame.as_ref();
        }

        if let Some(frame) = self.scheduler.dequeue(now_us) {
            if let Some(previous) = self.last_frame.take() {
                previous.close();
            }
            self.last_frame = Some(frame);
        }

        self.last_frame.as_ref()
    }

    /// Drains decoder output into the scheduler and reacts to overflow.
    pub async fn pump_decoder(&mut self, now_us: i64) {
        while let Ok(event) = self.video_events.try_recv() {
            match event {
                DecoderEvent::Frame(frame) => {
                    let stream_ts_us = frame.timestamp_us();
                    let record = self.arrivals.remove(&stream_ts_us);

                    self.scheduler.enqueue(
                        frame,
                        stream_ts_us,
                        FrameTiming {
                            arrival_us: record
                                .as_ref()
                                .map_or(now_us, |record| record.arrival_us),
                            decode_us: now_us,
                            keyframe: record.is_some_and(|record| record.keyframe),
                        },
                    );
                }
                DecoderEvent::Overflow { queue_size } => {
                    warn!("[Player]: decoder queue overflow ({queue_size}), flushing");
                    self.flush(now_us).await;
                }
                DecoderEvent::Error(err) => self.fail(PlayerError::Decoder(err)),
            }
        }

        if let Some(receiver) = self.audio_events.as_mut() {
            // Audio frames wait in the channel for the audio subsystem; only
            // failures are handled here.
            while let Ok(event) = receiver.try_recv() {
                match event {
                    DecoderEvent::Frame(frame) => {
                        // Re-deliver through poll_audio_frame.
                        self.audio_frames.push_back(frame);
                    }
                    DecoderEvent::Overflow { queue_size } => {
                        warn!("[Player]: audio decoder overflow ({queue_size})");
                        if let Some(audio) = self.audio.as_mut() {
                            audio.reset();
                        }
                    }
                    DecoderEvent::Error(err) => warn!("[Player]: audio decoder error: {err}"),
                }
            }
        }
    }

    /// Decoded audio for the (out-of-core) audio subsystem, in decode order.
    pub fn poll_audio_frame(&mut self) -> Option<DecodedFrame> {
        self.audio_frames.pop_front()
    }

    pub async fn dispose(&mut self) {
        self.source.dispose().await;
        self.video.dispose();
        if let Some(audio) = self.audio.as_mut() {
            audio.dispose();
        }
        self.scheduler.clear();
        if let Some(frame) = self.last_frame.take() {
            frame.close();
        }
        for frame in self.audio_frames.drain(..) {
            frame.close();
        }
    }

    fn maybe_request_keyframe(&mut self, now_us: i64) {
        let due = self
            .last_keyframe_request_us
            .is_none_or(|last| now_us - last >= KEYFRAME_REQUEST_INTERVAL_US);

        if due {
            self.force_request_keyframe(now_us);
        }
    }

    fn force_request_keyframe(&mut self, now_us: i64) {
        self.last_keyframe_request_us = Some(now_us);
        self.source.request_keyframe();
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.send(PlayerEvent::StateChanged(state));
        }
    }

    fn fail(&mut self, err: PlayerError) {
        error!("[Player]: {err}");
        self.set_state(PlayerState::Error);
        let _ = self.events.send(PlayerEvent::Error(err));
    }
}

fn track_matches(filter: Option<&str>, track: &str) -> bool {
    filter.is_none_or(|filter| filter == track)
}
