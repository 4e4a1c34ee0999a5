use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use thiserror::Error;

use crate::time::{MICROSECONDS, Timebase};

/// "SESM" once the u32 is written little-endian.
pub const SESAME_MAGIC: u32 = 0x4D53_4553;
pub const SESAME_VERSION: u16 = 1;

pub const FIXED_HEADER_LEN: usize = 32;
pub const METADATA_LEN: usize = 64;
pub const CODEC_DATA_LEN: usize = 24;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer of {0} bytes is too short for the declared packet")]
    TooShort(usize),
    #[error("bad packet magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported packet version {0}")]
    BadVersion(u16),
    #[error("header size {got} doesn't match the flag bits (expected {expected})")]
    BadHeaderSize { got: u16, expected: u16 },
    #[error("metadata block is not valid utf-8")]
    BadMetadata,
    #[error("flags declare a block that wasn't provided")]
    MissingBlock,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u32 {
        const HAS_CODEC_DATA = 1 << 0;
        const HAS_METADATA = 1 << 1;
        const IS_KEYFRAME = 1 << 2;
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PacketType {
    VideoFrame = 1,
    AudioFrame = 2,
    Rpc = 3,
    MuxedData = 4,
    DecoderData = 5,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CodecType {
    Vp8 = 1,
    Vp9 = 2,
    Avc = 3,
    Hevc = 4,
    Av1 = 5,
    Opus = 64,
    Aac = 65,
    Pcm = 66,
}

/// The fixed portion of a Sesame packet. Magic, version, `header_size` and
/// the reserved word are derived at the wire boundary and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    /// Presentation timestamp in the packet's declared timebase.
    pub pts: u64,
    /// Opaque ordering id, used for request/response correlation on some
    /// transports.
    pub id: u64,
    /// Raw packet type. Unknown values are preserved; see [`Self::packet_type`].
    pub ty: u16,
}

impl PacketHeader {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u16(self.ty)
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(PacketFlags::IS_KEYFRAME)
    }

    pub fn header_size(&self) -> u16 {
        let mut size = FIXED_HEADER_LEN;
        if self.flags.contains(PacketFlags::HAS_METADATA) {
            size += METADATA_LEN;
        }
        if self.flags.contains(PacketFlags::HAS_CODEC_DATA) {
            size += CODEC_DATA_LEN;
        }
        size as u16
    }
}

/// The 24-byte codec description block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecData {
    pub sample_rate: u32,
    pub timebase_num: u32,
    pub timebase_den: u32,
    pub codec_profile: u16,
    pub codec_level: u16,
    pub width: u16,
    pub height: u16,
    /// Raw codec type. Unknown values are preserved; see [`Self::codec`].
    pub codec_type: u8,
    pub channels: u8,
    pub bit_depth: u8,
}

impl CodecData {
    pub fn codec(&self) -> Option<CodecType> {
        CodecType::from_u8(self.codec_type)
    }

    /// The stream timebase, falling back to microseconds when the block
    /// carries no usable rational.
    pub fn timebase(&self) -> Timebase {
        Timebase::new(self.timebase_num, self.timebase_den).unwrap_or(MICROSECONDS)
    }

    fn read(block: &[u8]) -> Self {
        Self {
            sample_rate: u32_at(block, 0),
            timebase_num: u32_at(block, 4),
            timebase_den: u32_at(block, 8),
            codec_profile: u16_at(block, 12),
            codec_level: u16_at(block, 14),
            width: u16_at(block, 16),
            height: u16_at(block, 18),
            codec_type: block[20],
            channels: block[21],
            bit_depth: block[22],
        }
    }

    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_u32_le(self.sample_rate);
        buffer.put_u32_le(self.timebase_num);
        buffer.put_u32_le(self.timebase_den);
        buffer.put_u16_le(self.codec_profile);
        buffer.put_u16_le(self.codec_level);
        buffer.put_u16_le(self.width);
        buffer.put_u16_le(self.height);
        buffer.put_u8(self.codec_type);
        buffer.put_u8(self.channels);
        buffer.put_u8(self.bit_depth);
        buffer.put_u8(0);
    }
}

/// A validated, borrowed view of a packet. `payload` references the input
/// buffer; nothing is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRef<'a> {
    pub header: PacketHeader,
    pub metadata: Option<&'a str>,
    pub codec_data: Option<CodecData>,
    pub payload: &'a [u8],
}

impl PacketRef<'_> {
    pub fn is_keyframe(&self) -> bool {
        self.header.is_keyframe()
    }
}

/// An owned packet whose payload is a zero-copy slice of the transport
/// buffer, safe to hand across task boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub metadata: Option<String>,
    pub codec_data: Option<CodecData>,
    pub payload: Bytes,
}

impl Packet {
    pub fn parse(buffer: Bytes) -> Result<Self, WireError> {
        let (header, metadata, codec_data) = {
            let packet = parse(&buffer)?;
            (
                packet.header,
                packet.metadata.map(str::to_owned),
                packet.codec_data,
            )
        };

        let payload = buffer.slice(header.header_size() as usize..);

        Ok(Self {
            header,
            metadata,
            codec_data,
            payload,
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.header.is_keyframe()
    }
}

pub fn parse(buffer: &[u8]) -> Result<PacketRef<'_>, WireError> {
    if buffer.len() < FIXED_HEADER_LEN {
        return Err(WireError::TooShort(buffer.len()));
    }

    let magic = u32_at(buffer, 0);
    if magic != SESAME_MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let version = u16_at(buffer, 24);
    if version != SESAME_VERSION {
        return Err(WireError::BadVersion(version));
    }

    // Reserved flag bits are ignored on parse.
    let flags = PacketFlags::from_bits_truncate(u32_at(buffer, 4));
    let header = PacketHeader {
        flags,
        pts: u64_at(buffer, 8),
        id: u64_at(buffer, 16),
        ty: u16_at(buffer, 28),
    };

    let header_size = u16_at(buffer, 26);
    if header_size != header.header_size() {
        return Err(WireError::BadHeaderSize {
            got: header_size,
            expected: header.header_size(),
        });
    }
    if buffer.len() < header_size as usize {
        return Err(WireError::TooShort(buffer.len()));
    }

    let mut offset = FIXED_HEADER_LEN;

    let metadata = if flags.contains(PacketFlags::HAS_METADATA) {
        let block = &buffer[offset..offset + METADATA_LEN];
        offset += METADATA_LEN;

        let end = block.iter().position(|byte| *byte == 0).unwrap_or(METADATA_LEN);
        Some(std::str::from_utf8(&block[..end]).map_err(|_| WireError::BadMetadata)?)
    } else {
        None
    };

    let codec_data = if flags.contains(PacketFlags::HAS_CODEC_DATA) {
        let block = &buffer[offset..offset + CODEC_DATA_LEN];
        offset += CODEC_DATA_LEN;

        Some(CodecData::read(block))
    } else {
        None
    };

    Ok(PacketRef {
        header,
        metadata,
        codec_data,
        payload: &buffer[offset..],
    })
}

/// Serializes a packet. The metadata and codec blocks are emitted iff the
/// matching flag bit is set; `header_size` and the reserved fields are
/// recomputed here, whatever the caller put together.
pub fn serialize(
    header: &PacketHeader,
    metadata: Option<&str>,
    codec_data: Option<&CodecData>,
    payload: &[u8],
) -> Result<BytesMut, WireError> {
    if header.flags.contains(PacketFlags::HAS_METADATA) && metadata.is_none() {
        return Err(WireError::MissingBlock);
    }
    if header.flags.contains(PacketFlags::HAS_CODEC_DATA) && codec_data.is_none() {
        return Err(WireError::MissingBlock);
    }

    let header_size = header.header_size();
    let mut buffer = BytesMut::with_capacity(header_size as usize + payload.len());

    buffer.put_u32_le(SESAME_MAGIC);
    buffer.put_u32_le(header.flags.bits());
    buffer.put_u64_le(header.pts);
    buffer.put_u64_le(header.id);
    buffer.put_u16_le(SESAME_VERSION);
    buffer.put_u16_le(header_size);
    buffer.put_u16_le(header.ty);
    buffer.put_u16_le(0);

    if header.flags.contains(PacketFlags::HAS_METADATA) {
        if let Some(metadata) = metadata {
            // Truncate to 63 bytes on a char boundary, NUL-terminate, pad to 64.
            let mut end = metadata.len().min(METADATA_LEN - 1);
            while !metadata.is_char_boundary(end) {
                end -= 1;
            }

            let bytes = &metadata.as_bytes()[..end];
            buffer.put_slice(bytes);
            buffer.put_bytes(0, METADATA_LEN - bytes.len());
        }
    }

    if header.flags.contains(PacketFlags::HAS_CODEC_DATA) {
        if let Some(codec_data) = codec_data {
            codec_data.write(&mut buffer);
        }
    }

    buffer.put_slice(payload);

    Ok(buffer)
}

fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buffer[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn u32_at(buffer: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(buffer: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_codec_data() -> CodecData {
        CodecData {
            sample_rate: 48_000,
            timebase_num: 1,
            timebase_den: 90_000,
            codec_profile: 0x64,
            codec_level: 0x32,
            width: 1920,
            height: 1080,
            codec_type: CodecType::Avc as u8,
            channels: 2,
            bit_depth: 8,
        }
    }

    #[test]
    fn test_round_trip_all_blocks() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_METADATA | PacketFlags::HAS_CODEC_DATA | PacketFlags::IS_KEYFRAME,
            pts: 123_456_789,
            id: 42,
            ty: PacketType::VideoFrame as u16,
        };
        let codec_data = test_codec_data();
        let payload = [0x00u8, 0x01, 0x02, 0xff, 0x7f];

        let bytes = serialize(&header, Some("camera-1"), Some(&codec_data), &payload).unwrap();
        let packet = parse(&bytes).unwrap();

        assert_eq!(packet.header, header);
        assert_eq!(packet.metadata, Some("camera-1"));
        assert_eq!(packet.codec_data, Some(codec_data));
        assert_eq!(packet.payload, &payload);
        assert!(packet.is_keyframe());
    }

    #[test]
    fn test_round_trip_minimal() {
        let header = PacketHeader {
            flags: PacketFlags::empty(),
            pts: 0,
            id: 0,
            ty: PacketType::AudioFrame as u16,
        };

        let bytes = serialize(&header, None, None, &[]).unwrap();
        let packet = parse(&bytes).unwrap();

        assert_eq!(packet.header, header);
        assert_eq!(packet.metadata, None);
        assert_eq!(packet.codec_data, None);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_exact_layout() {
        let header = PacketHeader {
            flags: PacketFlags::IS_KEYFRAME,
            pts: 0x1122_3344_5566_7788,
            id: 0x99aa_bbcc_ddee_ff00,
            ty: PacketType::VideoFrame as u16,
        };

        let bytes = serialize(&header, None, None, &[0xab]).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"SESM");
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        expected.extend_from_slice(&0x99aa_bbcc_ddee_ff00u64.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&32u16.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&0u16.to_le_bytes());
        expected.push(0xab);

        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_header_size_tracks_flags() {
        let mut header = PacketHeader::default();
        assert_eq!(header.header_size(), 32);

        header.flags = PacketFlags::HAS_METADATA;
        assert_eq!(header.header_size(), 96);

        header.flags = PacketFlags::HAS_CODEC_DATA;
        assert_eq!(header.header_size(), 56);

        header.flags = PacketFlags::HAS_METADATA | PacketFlags::HAS_CODEC_DATA;
        assert_eq!(header.header_size(), 120);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let header = PacketHeader::default();
        let mut bytes = serialize(&header, None, None, &[]).unwrap();
        bytes[0] ^= 0xff;

        assert!(matches!(parse(&bytes), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn test_rejects_bad_version() {
        let header = PacketHeader::default();
        let mut bytes = serialize(&header, None, None, &[]).unwrap();
        bytes[24] = 2;

        assert_eq!(parse(&bytes), Err(WireError::BadVersion(2)));
    }

    #[test]
    fn test_rejects_bad_header_size() {
        let header = PacketHeader::default();
        let mut bytes = serialize(&header, None, None, &[]).unwrap();
        bytes[26] = 33;

        assert_eq!(
            parse(&bytes),
            Err(WireError::BadHeaderSize {
                got: 33,
                expected: 32
            })
        );
    }

    #[test]
    fn test_rejects_short_buffer() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_CODEC_DATA,
            ..Default::default()
        };
        let bytes = serialize(&header, None, Some(&test_codec_data()), &[]).unwrap();

        // Shorter than the fixed header.
        assert!(matches!(parse(&bytes[..16]), Err(WireError::TooShort(16))));
        // Shorter than the declared header size.
        assert!(matches!(parse(&bytes[..40]), Err(WireError::TooShort(40))));
    }

    #[test]
    fn test_rejects_missing_blocks() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_METADATA,
            ..Default::default()
        };
        assert_eq!(serialize(&header, None, None, &[]), Err(WireError::MissingBlock));

        let header = PacketHeader {
            flags: PacketFlags::HAS_CODEC_DATA,
            ..Default::default()
        };
        assert_eq!(serialize(&header, None, None, &[]), Err(WireError::MissingBlock));
    }

    #[test]
    fn test_blocks_without_flags_are_skipped() {
        let header = PacketHeader::default();
        let bytes = serialize(&header, Some("ignored"), Some(&test_codec_data()), &[]).unwrap();

        assert_eq!(bytes.len(), FIXED_HEADER_LEN);

        let packet = parse(&bytes).unwrap();
        assert_eq!(packet.metadata, None);
        assert_eq!(packet.codec_data, None);
    }

    #[test]
    fn test_metadata_truncated_to_63_bytes() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_METADATA,
            ..Default::default()
        };
        let long = "x".repeat(80);

        let bytes = serialize(&header, Some(&long), None, &[]).unwrap();
        let packet = parse(&bytes).unwrap();

        assert_eq!(packet.metadata, Some(&long[..63]));
    }

    #[test]
    fn test_unknown_packet_type_preserved() {
        let header = PacketHeader {
            ty: 99,
            ..Default::default()
        };

        let bytes = serialize(&header, None, None, &[]).unwrap();
        let packet = parse(&bytes).unwrap();

        assert_eq!(packet.header.ty, 99);
        assert_eq!(packet.header.packet_type(), None);
    }

    #[test]
    fn test_owned_parse_slices_payload() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_CODEC_DATA,
            pts: 7,
            ..Default::default()
        };
        let payload = [1u8, 2, 3, 4];
        let bytes = serialize(&header, None, Some(&test_codec_data()), &payload).unwrap();

        let packet = Packet::parse(bytes.freeze()).unwrap();
        assert_eq!(packet.header, header);
        assert_eq!(&packet.payload[..], &payload);
    }

    #[test]
    fn test_empty_payload_allowed() {
        let header = PacketHeader {
            flags: PacketFlags::HAS_CODEC_DATA,
            ..Default::default()
        };
        let bytes = serialize(&header, None, Some(&test_codec_data()), &[]).unwrap();

        let packet = parse(&bytes).unwrap();
        assert!(packet.payload.is_empty());
    }
}
