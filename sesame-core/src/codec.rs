use crate::packet::{CodecData, CodecType};

/// The subset of [`CodecData`] whose change forces a decoder reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecIdentity {
    pub codec_type: u8,
    pub width: u16,
    pub height: u16,
    pub codec_profile: u16,
    pub codec_level: u16,
}

impl From<&CodecData> for CodecIdentity {
    fn from(data: &CodecData) -> Self {
        Self {
            codec_type: data.codec_type,
            width: data.width,
            height: data.height,
            codec_profile: data.codec_profile,
            codec_level: data.codec_level,
        }
    }
}

/// True when moving from `current` to `new` requires reconfiguring the
/// decoder: one side missing, or any identity field differing.
pub fn codec_data_changed(current: Option<&CodecData>, new: Option<&CodecData>) -> bool {
    match (current, new) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(current), Some(new)) => CodecIdentity::from(current) != CodecIdentity::from(new),
    }
}

/// Maps a codec block to the decoder's codec-config string. Returns `None`
/// for codec types this build doesn't know.
pub fn codec_string(data: &CodecData) -> Option<String> {
    let codec = match data.codec()? {
        CodecType::Vp8 => "vp8".to_string(),
        CodecType::Vp9 => "vp09.00.10.08".to_string(),
        CodecType::Avc => avc_codec_string(data.codec_profile, data.codec_level),
        CodecType::Hevc => "hvc1.1.6.L93.B0".to_string(),
        CodecType::Av1 => "av01.0.04M.08".to_string(),
        CodecType::Opus => "opus".to_string(),
        CodecType::Aac => "mp4a.40.2".to_string(),
        CodecType::Pcm => pcm_codec_string(data.bit_depth).to_string(),
    };

    Some(codec)
}

/// `avc1.PPCCLL`: profile_idc in the low byte of `codec_profile`, the
/// constraint flags in the high byte, level_idc in `codec_level`. Zero
/// fields fall back to Constrained Baseline level 3.1 (`42`/`00`/`1f`).
fn avc_codec_string(profile: u16, level: u16) -> String {
    let profile_idc = if profile == 0 { 0x42 } else { (profile & 0xff) as u8 };
    let constraints = (profile >> 8) as u8;
    let level_idc = if level == 0 { 0x1f } else { (level & 0xff) as u8 };

    format!("avc1.{profile_idc:02x}{constraints:02x}{level_idc:02x}")
}

fn pcm_codec_string(bit_depth: u8) -> &'static str {
    match bit_depth {
        8 => "pcm-u8",
        24 => "pcm-s24",
        32 => "pcm-s32",
        _ => "pcm-s16",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_codec_data(codec_type: u8, width: u16, height: u16) -> CodecData {
        CodecData {
            timebase_num: 1,
            timebase_den: 90_000,
            width,
            height,
            codec_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_avc_defaults() {
        let data = video_codec_data(CodecType::Avc as u8, 1280, 720);
        assert_eq!(codec_string(&data).as_deref(), Some("avc1.42001f"));
    }

    #[test]
    fn test_avc_high_profile() {
        let mut data = video_codec_data(CodecType::Avc as u8, 1920, 1080);
        data.codec_profile = 0x64;
        data.codec_level = 0x32;

        assert_eq!(codec_string(&data).as_deref(), Some("avc1.640032"));
    }

    #[test]
    fn test_unknown_codec_type() {
        let data = video_codec_data(200, 1280, 720);
        assert_eq!(codec_string(&data), None);
    }

    #[test]
    fn test_pcm_bit_depths() {
        let mut data = video_codec_data(CodecType::Pcm as u8, 0, 0);
        assert_eq!(codec_string(&data).as_deref(), Some("pcm-s16"));

        data.bit_depth = 32;
        assert_eq!(codec_string(&data).as_deref(), Some("pcm-s32"));
    }

    #[test]
    fn test_changed_presence() {
        let data = video_codec_data(CodecType::Avc as u8, 1280, 720);

        assert!(!codec_data_changed(None, None));
        assert!(codec_data_changed(None, Some(&data)));
        assert!(codec_data_changed(Some(&data), None));
        assert!(!codec_data_changed(Some(&data), Some(&data)));
    }

    #[test]
    fn test_changed_identity_fields() {
        let current = video_codec_data(CodecType::Avc as u8, 1920, 1080);

        let mut new = current;
        new.height = 720;
        assert!(codec_data_changed(Some(&current), Some(&new)));

        let mut new = current;
        new.codec_type = CodecType::Hevc as u8;
        assert!(codec_data_changed(Some(&current), Some(&new)));
    }

    #[test]
    fn test_non_identity_fields_ignored() {
        let current = video_codec_data(CodecType::Avc as u8, 1920, 1080);

        let mut new = current;
        new.sample_rate = 48_000;
        new.timebase_den = 1_000_000;
        assert!(!codec_data_changed(Some(&current), Some(&new)));
    }
}
