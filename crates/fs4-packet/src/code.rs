//! Packet codes, compression tags and body feature flags.
//!
//! The code word on the wire packs the packet type into its low three bytes
//! and the compression tag into the top byte.

/// Mask selecting the packet type from a raw code word.
pub const CODE_MASK: u32 = 0x00FF_FFFF;

/// End of a reply sequence.
pub const EOL: u32 = 200;
/// Legacy query result codes. Only sniffed for routing, never decoded.
pub const LEGACY_QUERY_RESULT: u32 = 202;
pub const ERROR: u32 = 203;
pub const DOCUMENT_SUMMARY: u32 = 205;
pub const LEGACY_QUERY_RESULT_X: u32 = 208;
pub const LEGACY_QUERY_RESULT_2: u32 = 214;
pub const QUERY_RESULT: u32 = 217;
pub const QUERY: u32 = 218;
pub const GET_SUMMARIES: u32 = 219;
pub const PING: u32 = 220;
pub const PONG: u32 = 221;

/// Query feature flags (`QF_*`): which optional sections a query body carries.
pub mod query_flags {
    pub const PARSED_QUERY: u32 = 0x0000_0002;
    pub const RANK_PROFILE: u32 = 0x0000_0004;
    pub const SORT_SPEC: u32 = 0x0000_0080;
    pub const LOCATION: u32 = 0x0000_0800;
    pub const PROPERTIES: u32 = 0x0010_0000;
    pub const GROUP_SPEC: u32 = 0x0040_0000;
    pub const SESSION_ID: u32 = 0x0080_0000;
}

/// Query result feature flags (`QRF_*`).
pub mod result_flags {
    pub const MLD: u32 = 0x0000_0001;
    pub const SORT_DATA: u32 = 0x0000_0010;
    pub const COVERAGE_NODES: u32 = 0x0000_0020;
    pub const GROUP_DATA: u32 = 0x0000_0200;
}

/// Summary request feature flags (`GDF_*`).
pub mod summary_flags {
    pub const MLD: u32 = 0x0000_0001;
    pub const QUERY_STACK: u32 = 0x0000_0004;
    pub const RANK_PROFILE_QUERY_FLAGS: u32 = 0x0000_0010;
    pub const LOCATION: u32 = 0x0000_0080;
    pub const RESULT_CLASS_NAME: u32 = 0x0000_0800;
    pub const PROPERTIES: u32 = 0x0000_1000;
    pub const FLAGS: u32 = 0x0000_2000;
}

/// Monitor (ping/pong) flags.
pub mod monitor_flags {
    /// Ping carries a query-flags word.
    pub const QUERY_FLAGS: u32 = 0x0000_0002;
    /// Query flag asking the backend to report its active document count.
    pub const REPORT_ACTIVE_DOCS: u32 = 0x0000_0020;

    /// Pong carries node and partition counts.
    pub const REPLY_MLD: u32 = 0x0000_0001;
    /// Pong carries a reply-flags word (ignored).
    pub const REPLY_FLAGS: u32 = 0x0000_0008;
    /// Pong carries the active document count.
    pub const REPLY_ACTIVE_DOCS: u32 = 0x0000_0020;
}

/// The closed set of packet types this crate knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Eol,
    Error,
    DocumentSummary,
    QueryResult,
    Query,
    GetSummaries,
    Ping,
    Pong,
}

impl PacketType {
    /// Look up a packet type from a masked code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            EOL => Some(PacketType::Eol),
            ERROR => Some(PacketType::Error),
            DOCUMENT_SUMMARY => Some(PacketType::DocumentSummary),
            QUERY_RESULT => Some(PacketType::QueryResult),
            QUERY => Some(PacketType::Query),
            GET_SUMMARIES => Some(PacketType::GetSummaries),
            PING => Some(PacketType::Ping),
            PONG => Some(PacketType::Pong),
            _ => None,
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            PacketType::Eol => EOL,
            PacketType::Error => ERROR,
            PacketType::DocumentSummary => DOCUMENT_SUMMARY,
            PacketType::QueryResult => QUERY_RESULT,
            PacketType::Query => QUERY,
            PacketType::GetSummaries => GET_SUMMARIES,
            PacketType::Ping => PING,
            PacketType::Pong => PONG,
        }
    }

    /// Whether frames of this type carry a channel id after the code.
    pub const fn has_channel_id(self) -> bool {
        matches!(self, PacketType::Query | PacketType::QueryResult)
    }

    /// Whether a client decodes this type. Requests are encode-only.
    pub const fn is_decodable(self) -> bool {
        matches!(
            self,
            PacketType::Eol
                | PacketType::Error
                | PacketType::DocumentSummary
                | PacketType::QueryResult
                | PacketType::Pong
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            PacketType::Eol => "eol",
            PacketType::Error => "error",
            PacketType::DocumentSummary => "document_summary",
            PacketType::QueryResult => "query_result",
            PacketType::Query => "query",
            PacketType::GetSummaries => "get_summaries",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
        }
    }
}

/// Returns true for result codes whose channel id sits at the fixed header
/// offset and can be read without decoding the frame.
pub fn is_sniffable(code: u32) -> bool {
    matches!(
        code,
        LEGACY_QUERY_RESULT | LEGACY_QUERY_RESULT_X | LEGACY_QUERY_RESULT_2 | QUERY_RESULT
    )
}

/// Body compressor named by the top byte of the code word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionType {
    #[default]
    None,
    Incompressible,
    Lz4,
    Zstd,
}

impl CompressionType {
    pub const fn tag(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Incompressible => 1,
            CompressionType::Lz4 => 6,
            CompressionType::Zstd => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Incompressible),
            6 => Some(CompressionType::Lz4),
            7 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Split a raw code word into (packet code, compression tag).
pub fn split_code(raw: u32) -> (u32, u8) {
    (raw & CODE_MASK, (raw >> 24) as u8)
}

/// Human-readable name of a masked packet code.
pub fn code_name(code: u32) -> &'static str {
    match PacketType::from_code(code) {
        Some(kind) => kind.name(),
        None if is_sniffable(code) => "legacy_query_result",
        None => "unknown",
    }
}
