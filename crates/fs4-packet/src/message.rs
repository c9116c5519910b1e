//! The closed set of packet variants and the code-to-variant dispatcher.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::body::BodyReader;
use crate::code::PacketType;
use crate::error::Result;
use crate::monitor::{Ping, Pong};
use crate::query::{GetSummaries, Query, QueryPacketData};
use crate::result::{DocumentSummary, ErrorReply, QueryResult};

/// One FS4 packet, request or reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    Eol,
    Error(ErrorReply),
    QueryResult(QueryResult),
    DocumentSummary(DocumentSummary),
    Query(Query),
    GetSummaries(GetSummaries),
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::Ping(_) => PacketType::Ping,
            Message::Pong(_) => PacketType::Pong,
            Message::Eol => PacketType::Eol,
            Message::Error(_) => PacketType::Error,
            Message::QueryResult(_) => PacketType::QueryResult,
            Message::DocumentSummary(_) => PacketType::DocumentSummary,
            Message::Query(_) => PacketType::Query,
            Message::GetSummaries(_) => PacketType::GetSummaries,
        }
    }

    /// Wire code, without compression tag.
    pub fn code(&self) -> u32 {
        self.packet_type().code()
    }

    pub fn has_channel_id(&self) -> bool {
        self.packet_type().has_channel_id()
    }

    pub fn name(&self) -> &'static str {
        self.packet_type().name()
    }

    pub fn as_query_result(&self) -> Option<&QueryResult> {
        match self {
            Message::QueryResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_pong(&self) -> Option<&Pong> {
        match self {
            Message::Pong(pong) => Some(pong),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorReply> {
        match self {
            Message::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Number of hits, for query results.
    pub fn document_count(&self) -> Option<usize> {
        self.as_query_result().map(QueryResult::document_count)
    }

    /// Active documents reported by a pong, if it reported them.
    pub fn active_documents(&self) -> Option<u64> {
        self.as_pong().and_then(Pong::active_documents)
    }

    /// Replies that end a summary fetch.
    pub fn is_terminal_reply(&self) -> bool {
        matches!(self, Message::Eol | Message::Error(_))
    }

    /// Write the body. Queries also return their encoded-section snapshot.
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) -> Option<QueryPacketData> {
        match self {
            Message::Ping(ping) => ping.encode_body(dst),
            Message::Pong(pong) => pong.encode_body(dst),
            Message::Eol => {}
            Message::Error(err) => err.encode_body(dst),
            Message::QueryResult(result) => result.encode_body(dst),
            Message::DocumentSummary(summary) => summary.encode_body(dst),
            Message::Query(query) => return Some(query.encode_body(dst)),
            Message::GetSummaries(request) => request.encode_body(dst),
        }
        None
    }
}

impl From<Ping> for Message {
    fn from(ping: Ping) -> Self {
        Message::Ping(ping)
    }
}

impl From<Pong> for Message {
    fn from(pong: Pong) -> Self {
        Message::Pong(pong)
    }
}

impl From<ErrorReply> for Message {
    fn from(err: ErrorReply) -> Self {
        Message::Error(err)
    }
}

impl From<QueryResult> for Message {
    fn from(result: QueryResult) -> Self {
        Message::QueryResult(result)
    }
}

impl From<DocumentSummary> for Message {
    fn from(summary: DocumentSummary) -> Self {
        Message::DocumentSummary(summary)
    }
}

impl From<Query> for Message {
    fn from(query: Query) -> Self {
        Message::Query(query)
    }
}

impl From<GetSummaries> for Message {
    fn from(request: GetSummaries) -> Self {
        Message::GetSummaries(request)
    }
}

/// Decode a (decompressed) body for an already-validated decodable type.
///
/// A body that decodes cleanly but leaves bytes behind is still returned:
/// the frame boundary is authoritative, so the leftovers are logged and
/// skipped rather than allowed to shift the stream.
pub(crate) fn decode_body(kind: PacketType, body: Bytes) -> Result<Message> {
    let mut reader = BodyReader::new(kind.code(), body);
    let message = match kind {
        PacketType::Eol => Message::Eol,
        PacketType::Error => Message::Error(ErrorReply::decode_body(&mut reader)?),
        PacketType::DocumentSummary => {
            Message::DocumentSummary(DocumentSummary::decode_body(&mut reader)?)
        }
        PacketType::QueryResult => Message::QueryResult(QueryResult::decode_body(&mut reader)?),
        PacketType::Pong => Message::Pong(Pong::decode_body(&mut reader)?),
        PacketType::Query | PacketType::GetSummaries | PacketType::Ping => {
            return Err(crate::error::PacketError::UnknownPacketCode(kind.code()));
        }
    };

    if reader.remaining() != 0 {
        warn!(
            code = reader.code(),
            packet = kind.name(),
            leftover = reader.remaining(),
            "packet body not fully consumed; repositioning to frame end"
        );
    }
    Ok(message)
}
