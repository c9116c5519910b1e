use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::body::BodyReader;
use crate::code::{is_sniffable, split_code, CompressionType, PacketType, CODE_MASK, PONG};
use crate::error::{PacketError, Result};
use crate::message::{self, Message};
use crate::query::QueryPacketData;

/// Channel id carried by request/response packets.
pub type ChannelId = u32;

/// The declared length field itself, not counted in the declared length.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Connectionless header: length (4) + code (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Channel-carrying header: length (4) + code (4) + channel (4) = 12 bytes.
pub const CHANNEL_HEADER_SIZE: usize = 12;

/// Uncompressed-size field in front of a compressed body.
pub const COMPRESSION_HEADER_SIZE: usize = 4;

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_PACKET: usize = 16 * 1024 * 1024;

/// Default initial encode/receive buffer size: 8 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

// LZ4 block format cannot expand data by more than this factor.
const MAX_LZ4_RATIO: usize = 255;

/// Body compression settings for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Compressor used when a body qualifies.
    pub kind: CompressionType,
    /// Bodies strictly larger than this many bytes are compressed.
    /// Zero disables compression.
    pub limit: usize,
}

impl CompressionConfig {
    pub fn lz4(limit: usize) -> Self {
        Self {
            kind: CompressionType::Lz4,
            limit,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.limit != 0 && self.kind != CompressionType::None
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            kind: CompressionType::Lz4,
            limit: 0,
        }
    }
}

/// Configuration for the packet codec, reader and writer.
#[derive(Debug, Clone)]
pub struct PacketConfig {
    /// Largest frame accepted in either direction. Default: 16 MiB.
    pub max_packet_size: usize,
    /// Starting size of encode and receive buffers; both double on demand
    /// up to `max_packet_size`. Default: 8 KiB.
    pub initial_buffer_size: usize,
    /// Outbound body compression.
    pub compression: CompressionConfig,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET,
            initial_buffer_size: DEFAULT_BUFFER_SIZE,
            compression: CompressionConfig::default(),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl PacketConfig {
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_initial_buffer_size(mut self, size: usize) -> Self {
        self.initial_buffer_size = size;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Initial buffer size clamped to `[CHANNEL_HEADER_SIZE, max_packet_size]`.
    pub(crate) fn starting_capacity(&self) -> usize {
        self.initial_buffer_size
            .max(CHANNEL_HEADER_SIZE)
            .min(self.max_packet_size.max(CHANNEL_HEADER_SIZE))
    }
}

/// A decoded packet together with the channel id from its header.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Present only for channel-carrying packet types.
    pub channel: Option<ChannelId>,
    pub message: Message,
}

/// What one successful encode produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSummary {
    /// Bytes written for the frame, after compression.
    pub frame_len: usize,
    /// Whether the body went out compressed.
    pub compressed: bool,
    /// Encoded-section snapshot, for query packets.
    pub query_data: Option<QueryPacketData>,
}

/// Encode a packet, appending one complete frame to `dst`.
///
/// `channel` is written only for channel-carrying packet types. If the
/// uncompressed frame would exceed `capacity`, `dst` is restored to its
/// length before the call and [`PacketError::BufferTooSmall`] is returned so
/// the caller can retry with a larger buffer.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┬─────────────┬──────────────────────┐
/// │ Length (4B)  │ Code (4B)        │ Channel(4B) │ Body                 │
/// │ frame len -4 │ tag<<24 | type   │ if carried  │ [usize(4B)] payload  │
/// └──────────────┴──────────────────┴─────────────┴──────────────────────┘
/// ```
pub fn encode_packet(
    message: &Message,
    channel: ChannelId,
    compression: &CompressionConfig,
    dst: &mut BytesMut,
    capacity: usize,
) -> Result<EncodeSummary> {
    let start = dst.len();
    let kind = message.packet_type();

    dst.put_u32(0); // patched below
    dst.put_u32(kind.code());
    if kind.has_channel_id() {
        dst.put_u32(channel);
    }
    let body_start = dst.len();
    let query_data = message.encode_body(dst);

    let uncompressed_len = dst.len() - start;
    if uncompressed_len > capacity {
        dst.truncate(start);
        return Err(PacketError::BufferTooSmall {
            needed: uncompressed_len,
            capacity,
        });
    }

    let compressed = compress_body(dst, start, body_start, compression);

    let frame_len = dst.len() - start;
    let declared = (frame_len - LENGTH_FIELD_SIZE) as u32;
    dst[start..start + LENGTH_FIELD_SIZE].copy_from_slice(&declared.to_be_bytes());

    trace!(
        packet = kind.name(),
        channel,
        frame_len,
        compressed,
        "encoded packet"
    );

    Ok(EncodeSummary {
        frame_len,
        compressed,
        query_data,
    })
}

/// Encode a packet into a fresh buffer with no size limit.
pub fn encode(
    message: &Message,
    channel: ChannelId,
    compression: &CompressionConfig,
) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    encode_packet(message, channel, compression, &mut dst, usize::MAX)?;
    Ok(dst.freeze())
}

/// Compress the body in place when it is over the limit and actually shrinks.
fn compress_body(
    dst: &mut BytesMut,
    start: usize,
    body_start: usize,
    config: &CompressionConfig,
) -> bool {
    let body_len = dst.len() - body_start;
    if !config.is_enabled() || body_len <= config.limit {
        return false;
    }
    if config.kind != CompressionType::Lz4 {
        debug!(kind = ?config.kind, "no encoder for compression type; sending uncompressed");
        return false;
    }

    let compressed = lz4_flex::block::compress(&dst[body_start..]);
    if compressed.len() + COMPRESSION_HEADER_SIZE >= body_len {
        trace!(
            body_len,
            compressed_len = compressed.len(),
            "body does not compress; sending uncompressed"
        );
        return false;
    }

    dst.truncate(body_start);
    dst.put_u32(body_len as u32);
    dst.put_slice(&compressed);
    // Big-endian code word: its first byte is the compression tag.
    dst[start + LENGTH_FIELD_SIZE] = config.kind.tag();
    true
}

/// Next buffer size for a frame of `needed` bytes: double `current` until it
/// fits, never past `max`. `None` if the frame can never fit.
pub(crate) fn grown_capacity(current: usize, needed: usize, max: usize) -> Option<usize> {
    if needed > max {
        return None;
    }
    let mut capacity = current.max(CHANNEL_HEADER_SIZE);
    while capacity < needed {
        capacity = capacity.saturating_mul(2);
    }
    Some(capacity.min(max))
}

fn read_u32_at(src: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = src.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Declared length of the frame at the start of `src`, without consuming.
///
/// Returns `None` if fewer than 4 bytes are buffered.
pub fn peek_declared_length(src: &[u8]) -> Option<u32> {
    read_u32_at(src, 0)
}

/// Real on-wire length (declared + 4) of the frame at the start of `src`.
pub fn peek_frame_length(src: &[u8]) -> Option<usize> {
    peek_declared_length(src).map(|declared| declared as usize + LENGTH_FIELD_SIZE)
}

/// Channel id of a buffered result frame, read from the fixed header offset.
///
/// Only result codes (including the legacy aliases) are sniffed; anything
/// else, or fewer than 12 buffered bytes, yields `None`.
pub fn sniff_channel(src: &[u8]) -> Option<ChannelId> {
    let code = read_u32_at(src, LENGTH_FIELD_SIZE)? & CODE_MASK;
    if !is_sniffable(code) {
        return None;
    }
    read_u32_at(src, HEADER_SIZE)
}

/// Cheap check for a monitor reply at the start of `src`.
pub fn is_pong(src: &[u8]) -> bool {
    read_u32_at(src, LENGTH_FIELD_SIZE).is_some_and(|raw| raw & CODE_MASK == PONG)
}

fn checked_frame_length(declared: u32) -> Result<usize> {
    let signed = declared as i32;
    if signed < (HEADER_SIZE - LENGTH_FIELD_SIZE) as i32 {
        return Err(PacketError::InvalidLength(signed));
    }
    Ok(declared as usize + LENGTH_FIELD_SIZE)
}

/// One complete, undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Bytes,
}

impl RawFrame {
    /// Wrap bytes holding exactly one frame.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let declared = peek_declared_length(&bytes).ok_or(PacketError::Truncated {
            code: 0,
            needed: LENGTH_FIELD_SIZE,
            remaining: bytes.len(),
        })?;
        let frame_len = checked_frame_length(declared)?;
        if bytes.len() != frame_len {
            return Err(PacketError::Truncated {
                code: read_u32_at(&bytes, LENGTH_FIELD_SIZE).unwrap_or(0) & CODE_MASK,
                needed: frame_len,
                remaining: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Code word as on the wire, compression tag included.
    pub fn raw_code(&self) -> u32 {
        read_u32_at(&self.bytes, LENGTH_FIELD_SIZE).unwrap_or(0)
    }

    pub fn packet_code(&self) -> u32 {
        split_code(self.raw_code()).0
    }

    pub fn compression_tag(&self) -> u8 {
        split_code(self.raw_code()).1
    }

    /// Sniffed channel id; see [`sniff_channel`].
    pub fn channel(&self) -> Option<ChannelId> {
        sniff_channel(&self.bytes)
    }

    pub fn is_pong(&self) -> bool {
        is_pong(&self.bytes)
    }

    pub fn decode(&self) -> Result<Packet> {
        decode_packet(&self.bytes)
    }
}

/// Split one complete frame off the front of `src`.
///
/// Returns `Ok(None)` if the frame is not complete yet; leftover bytes stay
/// at the front of `src` for the next read to extend. A frame whose real
/// length exceeds `capacity` can never be buffered and yields
/// [`PacketError::BufferTooSmall`].
pub fn extract_raw_frame(src: &mut BytesMut, capacity: usize) -> Result<Option<RawFrame>> {
    let Some(declared) = peek_declared_length(src) else {
        return Ok(None); // Need more data
    };
    let frame_len = checked_frame_length(declared)?;
    if frame_len > capacity {
        return Err(PacketError::BufferTooSmall {
            needed: frame_len,
            capacity,
        });
    }
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None); // Need more data
    }
    Ok(Some(RawFrame {
        bytes: src.split_to(frame_len).freeze(),
    }))
}

/// Split off and decode one frame.
///
/// A decode failure consumes the offending frame, so `src` stays aligned on
/// the next frame either way.
pub fn extract_packet(src: &mut BytesMut, capacity: usize) -> Result<Option<Packet>> {
    match extract_raw_frame(src, capacity)? {
        Some(frame) => frame.decode().map(Some),
        None => Ok(None),
    }
}

/// Decode the frame at the start of `frame`, transparently decompressing.
///
/// Bytes past the declared frame end are ignored. Either a fully decoded
/// packet is returned or an error; nothing partial escapes.
pub fn decode_packet(frame: &Bytes) -> Result<Packet> {
    let declared = peek_declared_length(frame).ok_or(PacketError::Truncated {
        code: 0,
        needed: LENGTH_FIELD_SIZE,
        remaining: frame.len(),
    })?;
    let frame_len = checked_frame_length(declared)?;
    let raw_code = read_u32_at(frame, LENGTH_FIELD_SIZE).unwrap_or(0);
    let (code, tag) = split_code(raw_code);
    if frame.len() < frame_len {
        return Err(PacketError::Truncated {
            code,
            needed: frame_len,
            remaining: frame.len(),
        });
    }

    let kind = PacketType::from_code(code)
        .filter(|kind| kind.is_decodable())
        .ok_or(PacketError::UnknownPacketCode(code))?;

    let (channel, body_start) = if kind.has_channel_id() {
        let channel = read_u32_at(&frame[..frame_len], HEADER_SIZE).ok_or(
            PacketError::Truncated {
                code,
                needed: CHANNEL_HEADER_SIZE,
                remaining: frame_len,
            },
        )?;
        (Some(channel), CHANNEL_HEADER_SIZE)
    } else {
        (None, HEADER_SIZE)
    };

    let body = frame.slice(body_start..frame_len);
    let body = match CompressionType::from_tag(tag) {
        // Incompressible marks a body the sender tried and failed to shrink.
        Some(CompressionType::None | CompressionType::Incompressible) => body,
        _ => decompress_body(code, tag, body)?,
    };

    let message = message::decode_body(kind, body)?;
    Ok(Packet { channel, message })
}

fn decompress_body(code: u32, tag: u8, body: Bytes) -> Result<Bytes> {
    if CompressionType::from_tag(tag) != Some(CompressionType::Lz4) {
        return Err(PacketError::UnsupportedCompression(tag));
    }

    let mut reader = BodyReader::new(code, body);
    let uncompressed_len = reader.get_u32()? as usize;
    let compressed = reader.take_rest();
    if uncompressed_len > compressed.len().saturating_mul(MAX_LZ4_RATIO) + 16 {
        return Err(PacketError::Compression(format!(
            "claimed size {uncompressed_len} impossible for {} compressed bytes",
            compressed.len()
        )));
    }

    let body = lz4_flex::block::decompress(&compressed, uncompressed_len)
        .map_err(|err| PacketError::Compression(err.to_string()))?;
    if body.len() != uncompressed_len {
        return Err(PacketError::Compression(format!(
            "decompressed {} bytes, header claimed {uncompressed_len}",
            body.len()
        )));
    }
    Ok(Bytes::from(body))
}
