use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use log::{LevelFilter, info};
use sesame_capture::{
    packetize::{CaptureCodec, CapturedChunk, VideoCaptureSettings},
    pipeline::{CaptureConfig, CaptureEncoder, CapturePipeline, CapturedFrame},
    sink::{SessionPublisher, SessionSink, SinkError},
};
use sesame_core::StreamKind;
use sesame_player::{
    config::PlayerConfig,
    decoder::{
        DecoderConfig, DecoderError, DecoderEvent, DecoderKind, DecoderProvider, EncodedChunk,
        MediaDecoder,
    },
    frame::DecodedFrame,
    live::LivePlayer,
    source::{
        MediaSession, SessionEvent, SourceError, TrackSubscription, subscriber::SubscriberSource,
    },
};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tokio::{
    spawn,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{interval, sleep},
};

/// Plays a synthetic live stream through the full pipeline: capture
/// packetizer → session sink → subscriber source → decoder → scheduler.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scheduler buffer delay in milliseconds (0 = bypass).
    #[arg(long, default_value_t = 100)]
    buffer_delay_ms: u32,

    /// Synthetic stream frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// How long to play, in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

// --------------- in-process session transport ---------------

struct ChannelSession {
    receiver: Option<UnboundedReceiver<SessionEvent>>,
}

#[async_trait]
impl MediaSession for ChannelSession {
    async fn open(
        &mut self,
        _subscriptions: &[TrackSubscription],
    ) -> Result<UnboundedReceiver<SessionEvent>, SourceError> {
        self.receiver.take().ok_or(SourceError::Closed)
    }

    async fn close(&mut self) {}
}

struct ChannelPublisher {
    sender: UnboundedSender<SessionEvent>,
}

#[async_trait]
impl SessionPublisher for ChannelPublisher {
    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn publish(
        &mut self,
        track: &str,
        payload: Bytes,
        _new_group: bool,
    ) -> Result<(), SinkError> {
        self.sender
            .send(SessionEvent::Frame {
                track: track.to_string(),
                payload,
            })
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self) {}
}

struct NoopEncoder;

impl CaptureEncoder for NoopEncoder {
    fn request_keyframe(&mut self) {
        info!("[Demo]: keyframe requested");
    }
}

// --------------- stub decoder ---------------

struct StubDecoder {
    events: UnboundedSender<DecoderEvent>,
    config: Option<DecoderConfig>,
}

#[async_trait]
impl MediaDecoder for StubDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Software
    }

    fn supports(&self, _config: &DecoderConfig) -> bool {
        true
    }

    async fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecoderError> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecoderError> {
        let config = self.config.as_ref().ok_or(DecoderError::NotConfigured)?;
        let _ = self.events.send(DecoderEvent::Frame(DecodedFrame::new(
            chunk.timestamp_us,
            config.width,
            config.height,
        )));
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }

    async fn flush(&mut self) -> Result<(), DecoderError> {
        Ok(())
    }

    fn reset(&mut self) {}
}

struct StubProvider;

impl DecoderProvider for StubProvider {
    fn create(
        &self,
        _kind: DecoderKind,
        events: UnboundedSender<DecoderEvent>,
    ) -> Option<Box<dyn MediaDecoder>> {
        Some(Box::new(StubDecoder {
            events,
            config: None,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    TermLogger::init(
        cli.log_level,
        simplelog::ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    // Synthetic capture side: packetizer + session sink feeding the player's
    // session over a channel.
    let (session_sender, session_receiver) = unbounded_channel();
    let sink = SessionSink::new(ChannelPublisher {
        sender: session_sender,
    });
    let mut capture = CapturePipeline::new(
        sink,
        NoopEncoder,
        CaptureConfig {
            video: Some(VideoCaptureSettings {
                codec: CaptureCodec::Avc,
                width: 1280,
                height: 720,
                bitrate: 2_000_000,
                frame_rate: cli.fps,
                keyframe_interval: cli.fps * 2,
                codec_profile: 0,
                codec_level: 0,
            }),
            audio: None,
            video_track: "video".to_string(),
            audio_track: "audio".to_string(),
            metadata: Some("sesame-demo".to_string()),
            audio_timestamp_offset_us: 0,
        },
    );
    capture.connect().await?;

    let fps = cli.fps.max(1);
    let keyframe_interval = fps * 2;
    spawn(async move {
        let frame_duration = Duration::from_secs(1) / fps;
        let mut ticker = interval(frame_duration);
        let mut index: u32 = 0;

        loop {
            ticker.tick().await;

            let chunk = CapturedChunk {
                keyframe: index % keyframe_interval == 0,
                timestamp_us: i64::from(index) * i64::from(frame_duration.as_micros() as u32),
                data: Bytes::from(vec![0u8; 1024]),
            };

            if capture.handle_frame(CapturedFrame::Video(chunk)).is_err() {
                break;
            }
            index += 1;
        }
    });

    // Player side.
    let session = ChannelSession {
        receiver: Some(session_receiver),
    };
    let (source, mut source_events) = SubscriberSource::new(
        session,
        vec![TrackSubscription::new("video", 0, StreamKind::Video)],
    );

    let (mut player, mut player_events) = LivePlayer::new(
        source,
        Arc::new(StubProvider),
        PlayerConfig {
            buffer_delay_ms: cli.buffer_delay_ms,
            enable_audio: false,
            ..Default::default()
        },
    );

    let start = Instant::now();
    let now_us = move || start.elapsed().as_micros() as i64;

    player.play().await?;
    info!("[Demo]: playing for {} s", cli.seconds);

    let mut render = interval(Duration::from_millis(16));
    let mut rendered: u64 = 0;
    let mut last_timestamp = None;
    let deadline = sleep(Duration::from_secs(cli.seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = source_events.recv() => {
                player.handle_source_event(event, now_us()).await;
            }
            Some(event) = player_events.recv() => {
                info!("[Demo]: player event: {event:?}");
            }
            _ = render.tick() => {
                if let Some(frame) = player.get_video_frame(now_us()).await {
                    if last_timestamp != Some(frame.timestamp_us()) {
                        last_timestamp = Some(frame.timestamp_us());
                        rendered += 1;
                    }
                }
            }
            _ = &mut deadline => break,
        }
    }

    let telemetry = player.telemetry();
    info!(
        "[Demo]: rendered {rendered} frames, buffered {} ({:.0} ms), dropped {}, drift corrections {}",
        telemetry.current_buffer_size,
        telemetry.current_buffer_ms,
        telemetry.dropped_frames,
        telemetry.drift_corrections
    );
    info!(
        "[Demo]: latency avg: decode {:.1} ms, buffer wait {:.1} ms, total {:.1} ms",
        telemetry.latency.avg_decode_ms,
        telemetry.latency.avg_buffer_wait_ms,
        telemetry.latency.avg_total_ms
    );

    player.dispose().await;

    Ok(())
}
