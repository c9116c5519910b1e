/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The frame does not fit the buffer it must be encoded into or read into.
    /// Recoverable by retrying with a larger buffer.
    #[error("buffer too small ({needed} bytes needed, capacity {capacity})")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The packet code is not one this side knows how to decode.
    #[error("unknown packet code {0}")]
    UnknownPacketCode(u32),

    /// The compression tag names a compressor that is not supported.
    #[error("unsupported compression type {0}")]
    UnsupportedCompression(u8),

    /// The compressed body could not be decompressed.
    #[error("decompression failed: {0}")]
    Compression(String),

    /// The body ended before the decoder had read everything it needed.
    #[error("packet {code} body truncated ({needed} bytes needed, {remaining} remaining)")]
    Truncated {
        code: u32,
        needed: usize,
        remaining: usize,
    },

    /// The body is well-sized but internally inconsistent.
    #[error("packet {code} body malformed: {reason}")]
    Malformed { code: u32, reason: String },

    /// The declared frame length is impossible (smaller than the header).
    #[error("invalid declared packet length {0}")]
    InvalidLength(i32),

    /// A string field was not valid UTF-8.
    #[error("packet {0} contains invalid UTF-8")]
    InvalidUtf8(u32),

    /// An I/O error occurred while reading or writing packets.
    #[error("packet I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl PacketError {
    /// True for errors confined to one frame: the stream is still aligned on
    /// the next frame and reading may continue.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            PacketError::UnknownPacketCode(_)
                | PacketError::UnsupportedCompression(_)
                | PacketError::Compression(_)
                | PacketError::Truncated { .. }
                | PacketError::Malformed { .. }
                | PacketError::InvalidUtf8(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PacketError>;

impl From<fs4_transport::TransportError> for PacketError {
    fn from(err: fs4_transport::TransportError) -> Self {
        use fs4_transport::TransportError;
        match err {
            TransportError::Io(io) | TransportError::Accept(io) => PacketError::Io(io),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                PacketError::Io(source)
            }
            other => PacketError::Io(std::io::Error::other(other.to_string())),
        }
    }
}
