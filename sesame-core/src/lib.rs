pub mod codec;
pub mod packet;
pub mod time;

/// Which pipeline a track feeds. Sources and sinks tag every track with one
/// of these; only video and audio tracks carry Sesame-framed packets.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Data,
}
