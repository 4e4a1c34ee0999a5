use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::timeout_at,
};

use crate::{
    config::{FileConfig, PlayMode},
    decoder::{
        ChunkKind, DecoderConfig, DecoderError, DecoderEvent, DecoderHarness, DecoderProvider,
        EncodedChunk,
    },
    frame::DecodedFrame,
};

const BUFFER_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to open media: {0}")]
    Open(String),
    #[error("no decodable track in media")]
    NoTracks,
    #[error("decoder: {0}")]
    Decoder(#[from] DecoderError),
    #[error(
        "timed out waiting for decoded frames; the container may not be laid out progressively"
    )]
    BufferTimeout,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    pub pts_us: i64,
    pub duration_us: i64,
    pub is_key: bool,
}

#[derive(Debug, Clone)]
pub struct VideoTrackInfo {
    pub codec: String,
    pub description: Option<Bytes>,
    pub width: u32,
    pub height: u32,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub struct AudioTrackInfo {
    pub codec: String,
    pub description: Option<Bytes>,
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration_us: i64,
    pub video: Option<VideoTrackInfo>,
    pub audio: Option<AudioTrackInfo>,
}

/// The container demuxer, external to the core. One `load` yields codec
/// descriptions and the full sample tables.
#[async_trait]
pub trait ContainerSource: Send {
    async fn load(&mut self) -> Result<MediaInfo, FileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Error,
}

#[derive(Debug)]
pub enum FileEvent {
    StateChanged(FilePlayerState),
    /// Loop mode wrapped back to the start.
    Looped,
    Error(FileError),
}

/// Seekable file playback: demuxer → lazy sample feeding → decoder →
/// pts-sorted frame buffer → position-driven frame pull.
///
/// The position clock is wall time anchored at `play`; all clocks are
/// caller-supplied microseconds.
pub struct FilePlayer<C> {
    container: C,
    config: FileConfig,
    video: DecoderHarness,
    video_events: UnboundedReceiver<DecoderEvent>,
    audio: Option<DecoderHarness>,
    audio_events: Option<UnboundedReceiver<DecoderEvent>>,
    info: Option<MediaInfo>,
    state: FilePlayerState,
    video_index: usize,
    audio_index: usize,
    /// Decoded frames, insertion-sorted by pts (decode order may differ).
    frames: Vec<DecodedFrame>,
    last_frame: Option<DecodedFrame>,
    play_start_time_us: i64,
    play_start_position_us: i64,
    events: UnboundedSender<FileEvent>,
}

impl<C> FilePlayer<C>
where
    C: ContainerSource,
{
    pub fn new(
        container: C,
        provider: Arc<dyn DecoderProvider>,
        config: FileConfig,
    ) -> (Self, UnboundedReceiver<FileEvent>) {
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

        let (events, receiver) = unbounded_channel();

        (
            Self {
                container,
                config,
                video,
                video_events,
                audio,
                audio_events,
                info: None,
                state: FilePlayerState::Idle,
                video_index: 0,
                audio_index: 0,
                frames: Vec::new(),
                last_frame: None,
                play_start_time_us: 0,
                play_start_position_us: 0,
                events,
            },
            receiver,
        )
    }

    pub fn state(&self) -> FilePlayerState {
        self.state
    }

    pub fn duration_us(&self) -> i64 {
        self.info.as_ref().map_or(0, |info| info.duration_us)
    }

    /// Wall-clock playhead: frozen while not playing.
    pub fn position_us(&self, now_us: i64) -> i64 {
        match self.state {
            FilePlayerState::Playing => {
                self.play_start_position_us + (now_us - self.play_start_time_us)
            }
            _ => self.play_start_position_us,
        }
    }

    /// Demuxes the container, configures the decoders and blocks until the
    /// first frames are decoded (or the 5 s barrier expires).
    pub async fn load(&mut self) -> Result<(), FileError> {
        self.set_state(FilePlayerState::Loading);

        let info = match self.container.load().await {
            Ok(info) => info,
            Err(err) => return Err(self.fail(err)),
        };

        let Some(video) = info.video.as_ref() else {
            return Err(self.fail(FileError::NoTracks));
        };
        info!(
            "[File]: loaded {}x{} {} ({} samples, {} ms)",
            video.width,
            video.height,
            video.codec,
            video.samples.len(),
            info.duration_us / 1000
        );

        let video_config = DecoderConfig {
            codec: video.codec.clone(),
            width: video.width,
            height: video.height,
            description: video.description.clone(),
            ..Default::default()
        };
        if let Err(err) = self.video.configure(video_config).await {
            return Err(self.fail(err.into()));
        }

        if let Some(harness) = self.audio.as_mut() {
            if let Some(audio) = info.audio.as_ref() {
                let audio_config = DecoderConfig {
                    codec: audio.codec.clone(),
                    description: audio.description.clone(),
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                    ..Default::default()
                };
                if let Err(err) = harness.configure(audio_config).await {
                    return Err(self.fail(err.into()));
                }
            }
        }

        self.info = Some(info);
        self.video_index = 0;
        self.audio_index = 0;

        self.feed(0);
        self.wait_buffer_ready().await?;

        self.set_state(FilePlayerState::Ready);
        Ok(())
    }

    async fn wait_buffer_ready(&mut self) -> Result<(), FileError> {
        let deadline = tokio::time::Instant::now() + BUFFER_READY_TIMEOUT;

        while self.frames.len() < self.config.min_buffer_frames {
            self.feed(0);

            match timeout_at(deadline, self.video_events.recv()).await {
                Ok(Some(event)) => self.handle_video_decoder_event(event),
                Ok(None) => break,
                Err(_) => {
                    if self.frames.is_empty() {
                        return Err(self.fail(FileError::BufferTimeout));
                    }
                    // Enough to start with.
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn play(&mut self, now_us: i64) {
        match self.state {
            FilePlayerState::Ready | FilePlayerState::Paused | FilePlayerState::Ended => {
                if self.state == FilePlayerState::Ended {
                    self.restart(now_us);
                }
                self.play_start_time_us = now_us;
                self.set_state(FilePlayerState::Playing);
            }
            _ => {}
        }
    }

    pub fn pause(&mut self, now_us: i64) {
        if self.state == FilePlayerState::Playing {
            self.play_start_position_us = self.position_us(now_us);
            self.set_state(FilePlayerState::Paused);
        }
    }

    /// Drives feeding, decoder draining and end-of-media handling. Call at
    /// render cadence while playing.
    pub fn advance(&mut self, now_us: i64) {
        if self.state != FilePlayerState::Playing {
            return;
        }

        let position = self.position_us(now_us);
        self.feed(position);

        while let Ok(event) = self.video_events.try_recv() {
            self.handle_video_decoder_event(event);
        }
        if let Some(receiver) = self.audio_events.as_mut() {
            while let Ok(event) = receiver.try_recv() {
                match event {
                    // Audio frames go to the (out-of-core) audio output.
                    DecoderEvent::Frame(frame) => frame.close(),
                    DecoderEvent::Overflow { queue_size } => {
                        warn!("[File]: audio decoder overflow ({queue_size})");
                    }
                    DecoderEvent::Error(err) => warn!("[File]: audio decoder error: {err}"),
                }
            }
        }

        let duration = self.duration_us();
        if duration > 0 && position >= duration {
            match self.config.play_mode {
                PlayMode::Loop => {
                    debug!("[File]: position reached the end, looping");
                    self.restart(now_us);
                    let _ = self.events.send(FileEvent::Looped);
                }
                PlayMode::Once => {
                    self.play_start_position_us = duration;
                    self.set_state(FilePlayerState::Ended);
                }
            }
        }
    }

    /// The latest decoded frame at or before the playhead; everything older
    /// is released.
    pub fn get_video_frame(&mut self, now_us: i64) -> Option<&DecodedFrame> {
        let position = self.position_us(now_us);

        let due = self
            .frames
            .partition_point(|frame| frame.timestamp_us() <= position);
        if due > 0 {
            let mut display = None;
            for frame in self.frames.drain(..due) {
                if let Some(stale) = display.replace(frame) {
                    stale.close();
                }
            }

            if let Some(frame) = display {
                if let Some(previous) = self.last_frame.take() {
                    previous.close();
                }
                self.last_frame = Some(frame);
            }
        }

        self.last_frame.as_ref()
    }

    /// Jumps to the nearest keyframe at or before `target_us`: sample
    /// indices reset, decoders reset, the frame buffer cleared.
    pub fn seek(&mut self, target_us: i64, now_us: i64) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        let Some(video) = info.video.as_ref() else {
            return;
        };

        let mut keyframe_index = 0;
        let mut keyframe_pts = 0;
        for (index, sample) in video.samples.iter().enumerate() {
            if sample.pts_us > target_us {
                break;
            }
            if sample.is_key {
                keyframe_index = index;
                keyframe_pts = sample.pts_us;
            }
        }

        let audio_index = info.audio.as_ref().map_or(0, |audio| {
            audio
                .samples
                .partition_point(|sample| sample.pts_us < keyframe_pts)
        });

        debug!(
            "[File]: seek to {} ms lands on keyframe at {} ms",
            target_us / 1000,
            keyframe_pts / 1000
        );

        self.video_index = keyframe_index;
        self.audio_index = audio_index;

        self.video.reset();
        if let Some(audio) = self.audio.as_mut() {
            audio.reset();
        }
        self.discard_pending_frames();

        self.play_start_position_us = keyframe_pts;
        self.play_start_time_us = now_us;

        self.feed(keyframe_pts);
    }

    pub async fn dispose(&mut self) {
        self.video.dispose();
        if let Some(audio) = self.audio.as_mut() {
            audio.dispose();
        }
        self.discard_pending_frames();
        self.info = None;
        self.set_state(FilePlayerState::Idle);
    }

    fn restart(&mut self, now_us: i64) {
        self.video_index = 0;
        self.audio_index = 0;

        // Sample 0 is a keyframe, so no reconfigure; resetting just keeps
        // in-flight end-of-stream frames out of the cleared buffer.
        self.video.reset();
        if let Some(audio) = self.audio.as_mut() {
            audio.reset();
        }
        self.discard_pending_frames();

        self.play_start_position_us = 0;
        self.play_start_time_us = now_us;
    }

    fn discard_pending_frames(&mut self) {
        for frame in self.frames.drain(..) {
            frame.close();
        }
        if let Some(previous) = self.last_frame.take() {
            previous.close();
        }
        while let Ok(event) = self.video_events.try_recv() {
            if let DecoderEvent::Frame(frame) = event {
                frame.close();
            }
        }
    }

    /// Keeps the video decoder's queue topped up and feeds audio up to the
    /// look-ahead horizon.
    fn feed(&mut self, position_us: i64) {
        loop {
            if self.video.pending() >= self.config.max_decoder_queue {
                break;
            }
            let Some(chunk) = self.video_chunk(self.video_index) else {
                break;
            };

            self.video_index += 1;
            if let Err(err) = self.video.decode_chunk(chunk) {
                warn!("[File]: video decode failed: {err}");
            }
        }

        if self.audio.is_some() {
            let horizon = position_us + self.config.audio_look_ahead_ms * 1000;

            loop {
                let Some(chunk) = self.audio_chunk(self.audio_index) else {
                    break;
                };
                if chunk.timestamp_us > horizon {
                    break;
                }

                self.audio_index += 1;
                if let Some(audio) = self.audio.as_mut() {
                    if let Err(err) = audio.decode_chunk(chunk) {
                        warn!("[File]: audio decode failed: {err}");
                    }
                }
            }
        }
    }

    fn video_chunk(&self, index: usize) -> Option<EncodedChunk> {
        let sample = self.info.as_ref()?.video.as_ref()?.samples.get(index)?;
        Some(sample_chunk(sample))
    }

    fn audio_chunk(&self, index: usize) -> Option<EncodedChunk> {
        let sample = self.info.as_ref()?.audio.as_ref()?.samples.get(index)?;
        Some(sample_chunk(sample))
    }

    fn handle_video_decoder_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::Frame(frame) => self.insert_frame(frame),
            DecoderEvent::Overflow { queue_size } => {
                // Feeding respects the bound, so this points at a decoder
                // misreporting its queue.
                warn!("[File]: unexpected decoder overflow ({queue_size})");
            }
            DecoderEvent::Error(err) => {
                warn!("[File]: video decoder error: {err}");
                let _ = self.events.send(FileEvent::Error(err.into()));
            }
        }
    }

    fn insert_frame(&mut self, frame: DecodedFrame) {
        let index = self
            .frames
            .partition_point(|buffered| buffered.timestamp_us() <= frame.timestamp_us());
        self.frames.insert(index, frame);
    }

    fn set_state(&mut self, state: FilePlayerState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.send(FileEvent::StateChanged(state));
        }
    }

    fn fail(&mut self, err: FileError) -> FileError {
        warn!("[File]: {err}");
        self.set_state(FilePlayerState::Error);
        err
    }
}

fn sample_chunk(sample: &Sample) -> EncodedChunk {
    EncodedChunk {
        kind: if sample.is_key {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        },
        timestamp_us: sample.pts_us,
        duration_us: Some(sample.duration_us),
        data: sample.data.clone(),
    }
}
