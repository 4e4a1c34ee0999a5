use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sesame_core::{StreamKind, packet::PacketType};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    CaptureError,
    packetize::{
        AudioCaptureSettings, CapturedChunk, VideoCaptureSettings, audio_codec_data, packetize,
        video_codec_data,
    },
    sink::{PacketSink, SerializedPacket},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub video: Option<VideoCaptureSettings>,
    pub audio: Option<AudioCaptureSettings>,
    #[serde(default = "default_video_track")]
    pub video_track: String,
    #[serde(default = "default_audio_track")]
    pub audio_track: String,
    /// Routing string carried in the packet metadata block.
    #[serde(default)]
    pub metadata: Option<String>,
    /// Added to audio timestamps to line them up with video.
    #[serde(default)]
    pub audio_timestamp_offset_us: i64,
}

fn default_video_track() -> String {
    "video".to_string()
}

fn default_audio_track() -> String {
    "audio".to_string()
}

/// One encoded frame from the capture encoder.
#[derive(Debug, Clone)]
pub enum CapturedFrame {
    Video(CapturedChunk),
    Audio(CapturedChunk),
}

/// Handle to the external encoder; the pipeline only ever asks it for the
/// next keyframe.
pub trait CaptureEncoder: Send {
    fn request_keyframe(&mut self);
}

/// Camera/microphone capture tail: encoded chunks are packetized with the
/// Sesame wire format and handed to the sink; keyframe requests from the
/// sink flow back into the encoder.
pub struct CapturePipeline<K, E> {
    config: CaptureConfig,
    sink: K,
    encoder: E,
    keyframe_requests: Option<UnboundedReceiver<()>>,
    sequence: u64,
}

impl<K, E> CapturePipeline<K, E>
where
    K: PacketSink,
    E: CaptureEncoder,
{
    pub fn new(mut sink: K, encoder: E, config: CaptureConfig) -> Self {
        let keyframe_requests = sink.keyframe_requests();

        Self {
            config,
            sink,
            encoder,
            keyframe_requests,
            sequence: 0,
        }
    }

    pub async fn connect(&mut self) -> Result<(), CaptureError> {
        self.sink.connect().await?;
        info!("[Capture]: sink connected");
        Ok(())
    }

    pub async fn dispose(&mut self) {
        self.sink.dispose().await;
    }

    /// Packetizes and sends one encoded frame. Pending keyframe requests
    /// are serviced first so the encoder reacts before its next frame.
    pub fn handle_frame(&mut self, frame: CapturedFrame) -> Result<(), CaptureError> {
        self.poll_keyframe_requests();

        match frame {
            CapturedFrame::Video(chunk) => self.send_video(chunk),
            CapturedFrame::Audio(chunk) => self.send_audio(chunk),
        }
    }

    /// Raw bytes on an auxiliary data track, bypassing the wire format.
    pub fn send_data(&mut self, track: &str, payload: bytes::Bytes) -> Result<(), CaptureError> {
        self.sink.send_data(track, payload)?;
        Ok(())
    }

    /// Consumes encoder output until the channel closes.
    pub async fn run(
        &mut self,
        mut frames: UnboundedReceiver<CapturedFrame>,
    ) -> Result<(), CaptureError> {
        while let Some(frame) = frames.recv().await {
            self.handle_frame(frame)?;
        }

        debug!("[Capture]: encoder channel closed");
        Ok(())
    }

    fn send_video(&mut self, chunk: CapturedChunk) -> Result<(), CaptureError> {
        let Some(settings) = self.config.video.as_ref() else {
            return Err(CaptureError::NotConfigured("video"));
        };
        let codec_data = video_codec_data(settings);

        let bytes = packetize(
            PacketType::VideoFrame,
            self.take_sequence(),
            &codec_data,
            &chunk,
            self.config.metadata.as_deref(),
        )?;

        self.sink.send(SerializedPacket {
            track: self.config.video_track.clone(),
            bytes,
            is_keyframe: chunk.keyframe,
            timestamp_us: chunk.timestamp_us,
            kind: StreamKind::Video,
        })?;
        Ok(())
    }

    fn send_audio(&mut self, mut chunk: CapturedChunk) -> Result<(), CaptureError> {
        let Some(settings) = self.config.audio.as_ref() else {
            return Err(CaptureError::NotConfigured("audio"));
        };
        let codec_data = audio_codec_data(settings);

        chunk.timestamp_us += self.config.audio_timestamp_offset_us;

        let bytes = packetize(
            PacketType::AudioFrame,
            self.take_sequence(),
            &codec_data,
            &chunk,
            self.config.metadata.as_deref(),
        )?;

        self.sink.send(SerializedPacket {
            track: self.config.audio_track.clone(),
            bytes,
            is_keyframe: chunk.keyframe,
            timestamp_us: chunk.timestamp_us,
            kind: StreamKind::Audio,
        })?;
        Ok(())
    }

    fn poll_keyframe_requests(&mut self) {
        let Some(requests) = self.keyframe_requests.as_mut() else {
            return;
        };

        let mut requested = false;
        while requests.try_recv().is_ok() {
            requested = true;
        }

        if requested {
            warn!("[Capture]: keyframe requested by the far end");
            self.encoder.request_keyframe();
            self.sink.reset_groups();
        }
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}
