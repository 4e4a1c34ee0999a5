use serde::{Deserialize, Serialize};

use crate::decoder::DecoderKind;

/// Live player configuration. Every field has a serde default so partial
/// documents work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_preferred_decoder")]
    pub preferred_decoder: DecoderKind,
    /// Scheduler target in milliseconds, clamped to [0, 5000]. 0 bypasses
    /// the jitter buffer.
    #[serde(default = "default_buffer_delay_ms")]
    pub buffer_delay_ms: u32,
    #[serde(default = "default_enable_audio")]
    pub enable_audio: bool,
    /// Video packets are accepted from this track; `None` accepts any.
    #[serde(default = "default_video_track_name")]
    pub video_track_name: Option<String>,
    #[serde(default = "default_audio_track_name")]
    pub audio_track_name: Option<String>,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default = "default_max_decoder_queue")]
    pub max_decoder_queue: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            preferred_decoder: default_preferred_decoder(),
            buffer_delay_ms: default_buffer_delay_ms(),
            enable_audio: default_enable_audio(),
            video_track_name: default_video_track_name(),
            audio_track_name: default_audio_track_name(),
            debug_logging: false,
            max_decoder_queue: default_max_decoder_queue(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    Once,
    Loop,
}

/// File player configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_preferred_decoder")]
    pub preferred_decoder: DecoderKind,
    #[serde(default = "default_play_mode")]
    pub play_mode: PlayMode,
    #[serde(default = "default_enable_audio")]
    pub enable_audio: bool,
    /// Upper bound on chunks in flight inside the decoder.
    #[serde(default = "default_file_decoder_queue")]
    pub max_decoder_queue: usize,
    /// Audio samples are fed up to this far past the playhead.
    #[serde(default = "default_audio_look_ahead_ms")]
    pub audio_look_ahead_ms: i64,
    /// Frames that must be decoded before `load` resolves.
    #[serde(default = "default_min_buffer_frames")]
    pub min_buffer_frames: usize,
    #[serde(default)]
    pub debug_logging: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            preferred_decoder: default_preferred_decoder(),
            play_mode: default_play_mode(),
            enable_audio: default_enable_audio(),
            max_decoder_queue: default_file_decoder_queue(),
            audio_look_ahead_ms: default_audio_look_ahead_ms(),
            min_buffer_frames: default_min_buffer_frames(),
            debug_logging: false,
        }
    }
}

fn default_preferred_decoder() -> DecoderKind {
    DecoderKind::Hardware
}

fn default_buffer_delay_ms() -> u32 {
    100
}

fn default_enable_audio() -> bool {
    true
}

fn default_video_track_name() -> Option<String> {
    Some("video".to_string())
}

fn default_audio_track_name() -> Option<String> {
    Some("audio".to_string())
}

fn default_max_decoder_queue() -> usize {
    16
}

fn default_play_mode() -> PlayMode {
    PlayMode::Once
}

fn default_file_decoder_queue() -> usize {
    10
}

fn default_audio_look_ahead_ms() -> i64 {
    2000
}

fn default_min_buffer_frames() -> usize {
    3
}
