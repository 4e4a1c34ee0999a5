use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sesame_core::{
    packet::Packet,
    time::{MICROSECONDS, to_micros},
};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::frame::DecodedFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    Hardware,
    Software,
    Native,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Codec-config string, see `sesame_core::codec::codec_string`.
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Out-of-band codec description (e.g. an avcC box) for file playback.
    pub description: Option<Bytes>,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Key,
    Delta,
}

#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub kind: ChunkKind,
    pub timestamp_us: i64,
    pub duration_us: Option<i64>,
    pub data: Bytes,
}

#[derive(Debug, Error, Clone)]
pub enum DecoderError {
    #[error("no decoder supports codec {0:?}")]
    Unsupported(String),
    #[error("decoder rejected the configuration: {0}")]
    Configure(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("the decoder is not configured")]
    NotConfigured,
}

#[derive(Debug)]
pub enum DecoderEvent {
    /// A decoded frame; ownership transfers to the receiver.
    Frame(DecodedFrame),
    /// The pending-chunk queue ran past its bound; the chunk was dropped.
    Overflow { queue_size: usize },
    Error(DecoderError),
}

/// The external decoder, implemented per platform (hardware, software or a
/// native decoder process). Decoded frames surface on the event channel the
/// decoder was created with; submission order is preserved per stream.
#[async_trait]
pub trait MediaDecoder: Send {
    fn kind(&self) -> DecoderKind;

    /// Cheap support probe, called before `configure`.
    fn supports(&self, config: &DecoderConfig) -> bool;

    async fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecoderError>;

    /// Submits one encoded chunk. Non-blocking.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecoderError>;

    /// Number of submitted chunks that haven't produced output yet.
    fn pending(&self) -> usize;

    /// Drains in-flight chunks; remaining frames are still delivered.
    async fn flush(&mut self) -> Result<(), DecoderError>;

    /// Discards in-flight chunks without output.
    fn reset(&mut self);
}

/// Creates decoders by kind. Returns `None` when the kind isn't available
/// on this platform.
pub trait DecoderProvider: Send + Sync {
    fn create(
        &self,
        kind: DecoderKind,
        events: UnboundedSender<DecoderEvent>,
    ) -> Option<Box<dyn MediaDecoder>>;
}

/// Uniform lifecycle around an external decoder: candidate selection with
/// fallback, a single canonical configured state, timestamp conversion and
/// queue-pressure tracking.
pub struct DecoderHarness {
    provider: Arc<dyn DecoderProvider>,
    events: UnboundedSender<DecoderEvent>,
    decoder: Option<Box<dyn MediaDecoder>>,
    configured: Option<DecoderConfig>,
    preferred: DecoderKind,
    max_queue_size: usize,
}

impl DecoderHarness {
    pub fn new(
        provider: Arc<dyn DecoderProvider>,
        preferred: DecoderKind,
        max_queue_size: usize,
    ) -> (Self, UnboundedReceiver<DecoderEvent>) {
        let (events, receiver) = unbounded_channel();

        (
            Self {
                provider,
                events,
                decoder: None,
                configured: None,
                preferred,
                max_queue_size,
            },
            receiver,
        )
    }

    pub fn preferred(&self) -> DecoderKind {
        self.preferred
    }

    pub fn set_preferred(&mut self, kind: DecoderKind) {
        self.preferred = kind;
    }

    /// Kind of the live decoder, if one is configured.
    pub fn active_kind(&self) -> Option<DecoderKind> {
        self.decoder.as_ref().map(|decoder| decoder.kind())
    }

    pub fn configured(&self) -> Option<&DecoderConfig> {
        self.configured.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.decoder.as_ref().map_or(0, |decoder| decoder.pending())
    }

    fn candidates(&self) -> Vec<DecoderKind> {
        let mut candidates = vec![self.preferred];
        for kind in [DecoderKind::Software, DecoderKind::Hardware, DecoderKind::Native] {
            if !candidates.contains(&kind) {
                candidates.push(kind);
            }
        }
        candidates
    }

    /// Configures a decoder for `config`, preferring the requested kind and
    /// falling back through the remaining kinds. Support is confirmed before
    /// configuring.
    pub async fn configure(&mut self, config: DecoderConfig) -> Result<(), DecoderError> {
        if let Some(decoder) = self.decoder.as_mut() {
            if decoder.supports(&config) {
                decoder.configure(&config).await?;
                self.configured = Some(config);
                return Ok(());
            }
        }

        let mut last_error = None;
        for kind in self.candidates() {
            let Some(mut decoder) = self.provider.create(kind, self.events.clone()) else {
                continue;
            };
            if !decoder.supports(&config) {
                continue;
            }

            match decoder.configure(&config).await {
                Ok(()) => {
                    info!(
                        "[Decoder]: configured {kind:?} decoder for {} ({}x{})",
                        config.codec, config.width, config.height
                    );
                    self.decoder = Some(decoder);
                    self.configured = Some(config);
                    return Ok(());
                }
                Err(err) => {
                    warn!("[Decoder]: {kind:?} decoder rejected {}: {err}", config.codec);
                    last_error = Some(err);
                }
            }
        }

        self.decoder = None;
        self.configured = None;

        Err(last_error.unwrap_or(DecoderError::Unsupported(config.codec)))
    }

    /// Submits a live packet. The packet pts is rescaled into microseconds
    /// with the stream's declared timebase; the keyframe flag selects the
    /// chunk kind.
    pub fn decode_packet(&mut self, packet: &Packet) -> Result<(), DecoderError> {
        let timebase = packet
            .codec_data
            .map(|data| data.timebase())
            .unwrap_or(MICROSECONDS);

        let chunk = EncodedChunk {
            kind: if packet.is_keyframe() {
                ChunkKind::Key
            } else {
                ChunkKind::Delta
            },
            timestamp_us: to_micros(packet.header.pts, timebase) as i64,
            duration_us: None,
            data: packet.payload.clone(),
        };

        self.decode_chunk(chunk)
    }

    /// Submits a chunk whose timestamps are already in microseconds (the
    /// file path). Drops the chunk with an overflow event when the decoder
    /// queue is saturated.
    pub fn decode_chunk(&mut self, chunk: EncodedChunk) -> Result<(), DecoderError> {
        let decoder = self.decoder.as_mut().ok_or(DecoderError::NotConfigured)?;

        let queue_size = decoder.pending();
        if queue_size > self.max_queue_size {
            warn!("[Decoder]: queue overflow ({queue_size} pending), dropping chunk");
            let _ = self.events.send(DecoderEvent::Overflow { queue_size });
            return Ok(());
        }

        decoder.decode(chunk)
    }

    pub async fn flush(&mut self) -> Result<(), DecoderError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.flush().await,
            None => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    /// Tears the decoder down; the next `configure` starts from scratch.
    pub fn dispose(&mut self) {
        self.decoder = None;
        self.configured = None;
    }
}
