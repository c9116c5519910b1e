//! FS4 packet framing and decoding.
//!
//! Every packet on the wire is framed as:
//! - A 4-byte big-endian declared length (frame length minus 4)
//! - A 4-byte big-endian code: low 3 bytes packet type, top byte compression tag
//! - A 4-byte big-endian channel id, only for channel-carrying packets
//!
//! Bodies above a configurable size limit are LZ4-compressed when that
//! actually shrinks them. Decoding is dispatched once on the packet code into
//! the closed [`Message`] enum.

pub mod code;
pub mod codec;
pub mod error;
pub mod message;
pub mod monitor;
pub mod query;
pub mod reader;
pub mod result;
pub mod writer;

mod body;

#[cfg(feature = "async")]
pub mod async_codec;

pub use code::{CompressionType, PacketType, CODE_MASK};
pub use codec::{
    decode_packet, encode, encode_packet, extract_packet, extract_raw_frame, is_pong,
    peek_declared_length, peek_frame_length, sniff_channel, ChannelId, CompressionConfig,
    EncodeSummary, Packet, PacketConfig, RawFrame, CHANNEL_HEADER_SIZE, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_PACKET, HEADER_SIZE,
};
pub use error::{PacketError, Result};
pub use message::Message;
pub use monitor::{NodeStatus, Ping, Pong};
pub use query::{GetSummaries, Query, QueryPacketData, QuerySource, SerializedItems, SummaryHit};
pub use reader::PacketReader;
pub use result::{
    Coverage, Document, DocumentSummary, ErrorReply, GlobalId, NodeCoverage, PartitionRef,
    QueryResult,
};
pub use writer::PacketWriter;

#[cfg(feature = "async")]
pub use async_codec::{OutboundPacket, PacketCodec};
