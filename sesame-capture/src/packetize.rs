use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sesame_core::packet::{
    CodecData, CodecType, PacketFlags, PacketHeader, PacketType, WireError, serialize,
};

/// Encoder configuration for the video capture path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCaptureSettings {
    pub codec: CaptureCodec,
    pub width: u16,
    pub height: u16,
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Keyframe every this many frames.
    pub keyframe_interval: u32,
    #[serde(default)]
    pub codec_profile: u16,
    #[serde(default)]
    pub codec_level: u16,
}

/// Encoder configuration for the audio capture path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioCaptureSettings {
    pub codec: CaptureCodec,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

/// Wire codec types expressible by the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureCodec {
    Vp8,
    Vp9,
    Avc,
    Hevc,
    Av1,
    Opus,
    Aac,
    Pcm,
}

impl From<CaptureCodec> for CodecType {
    fn from(codec: CaptureCodec) -> Self {
        match codec {
            CaptureCodec::Vp8 => CodecType::Vp8,
            CaptureCodec::Vp9 => CodecType::Vp9,
            CaptureCodec::Avc => CodecType::Avc,
            CaptureCodec::Hevc => CodecType::Hevc,
            CaptureCodec::Av1 => CodecType::Av1,
            CaptureCodec::Opus => CodecType::Opus,
            CaptureCodec::Aac => CodecType::Aac,
            CaptureCodec::Pcm => CodecType::Pcm,
        }
    }
}

/// One encoded frame out of the (external) encoder, timestamps already in
/// microseconds.
#[derive(Debug, Clone)]
pub struct CapturedChunk {
    pub keyframe: bool,
    pub timestamp_us: i64,
    pub data: Bytes,
}

/// The codec block describing a captured video stream. Capture emits
/// microsecond timestamps, so the timebase is fixed to 1/1_000_000.
pub fn video_codec_data(settings: &VideoCaptureSettings) -> CodecData {
    CodecData {
        timebase_num: 1,
        timebase_den: 1_000_000,
        codec_profile: settings.codec_profile,
        codec_level: settings.codec_level,
        width: settings.width,
        height: settings.height,
        codec_type: CodecType::from(settings.codec) as u8,
        ..Default::default()
    }
}

pub fn audio_codec_data(settings: &AudioCaptureSettings) -> CodecData {
    CodecData {
        sample_rate: settings.sample_rate,
        timebase_num: 1,
        timebase_den: 1_000_000,
        codec_type: CodecType::from(settings.codec) as u8,
        channels: settings.channels,
        bit_depth: settings.bit_depth,
        ..Default::default()
    }
}

/// Wraps one encoded chunk into a Sesame packet: codec block always
/// attached, metadata when given, keyframe flag from the chunk.
pub fn packetize(
    ty: PacketType,
    id: u64,
    codec_data: &CodecData,
    chunk: &CapturedChunk,
    metadata: Option<&str>,
) -> Result<Bytes, WireError> {
    let mut flags = PacketFlags::HAS_CODEC_DATA;
    if metadata.is_some() {
        flags |= PacketFlags::HAS_METADATA;
    }
    if chunk.keyframe {
        flags |= PacketFlags::IS_KEYFRAME;
    }

    let header = PacketHeader {
        flags,
        pts: chunk.timestamp_us as u64,
        id,
        ty: ty as u16,
    };

    Ok(serialize(&header, metadata, Some(codec_data), &chunk.data)?.freeze())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sesame_core::packet::parse;

    use super::*;

    fn video_settings() -> VideoCaptureSettings {
        VideoCaptureSettings {
            codec: CaptureCodec::Avc,
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            frame_rate: 30,
            keyframe_interval: 60,
            codec_profile: 0x42,
            codec_level: 0x1f,
        }
    }

    #[test]
    fn test_video_packet_round_trips() {
        let settings = video_settings();
        let chunk = CapturedChunk {
            keyframe: true,
            timestamp_us: 33_333,
            data: Bytes::from_static(&[0x65, 0x88, 0x84]),
        };

        let bytes = packetize(
            PacketType::VideoFrame,
            7,
            &video_codec_data(&settings),
            &chunk,
            Some("camera-1"),
        )
        .unwrap();

        let packet = parse(&bytes).unwrap();
        assert!(packet.is_keyframe());
        assert_eq!(packet.header.pts, 33_333);
        assert_eq!(packet.header.id, 7);
        assert_eq!(packet.header.packet_type(), Some(PacketType::VideoFrame));
        assert_eq!(packet.metadata, Some("camera-1"));
        assert_eq!(packet.payload, &[0x65, 0x88, 0x84]);

        let codec_data = packet.codec_data.unwrap();
        assert_eq!(codec_data.codec(), Some(CodecType::Avc));
        assert_eq!(codec_data.width, 1280);
        assert_eq!(codec_data.timebase_den, 1_000_000);
    }

    #[test]
    fn test_audio_packet_without_metadata() {
        let settings = AudioCaptureSettings {
            codec: CaptureCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        let chunk = CapturedChunk {
            keyframe: false,
            timestamp_us: 20_000,
            data: Bytes::from_static(&[1, 2]),
        };

        let bytes = packetize(
            PacketType::AudioFrame,
            0,
            &audio_codec_data(&settings),
            &chunk,
            None,
        )
        .unwrap();

        let packet = parse(&bytes).unwrap();
        assert!(!packet.is_keyframe());
        assert_eq!(packet.metadata, None);

        let codec_data = packet.codec_data.unwrap();
        assert_eq!(codec_data.codec(), Some(CodecType::Opus));
        assert_eq!(codec_data.sample_rate, 48_000);
        assert_eq!(codec_data.channels, 2);
    }
}
