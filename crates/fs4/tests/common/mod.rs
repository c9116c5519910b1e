//! In-process mock search backend for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use fs4::packet::{
    ChannelId, Coverage, Document, DocumentSummary, GlobalId, Message, PacketReader, PacketWriter,
    Pong, QueryResult, RawFrame,
};
use fs4::transport::{Endpoint, Fs4Listener};

pub type Handler = dyn Fn(&RawFrame) -> Vec<(Message, ChannelId)> + Send + Sync;

/// Serves every accepted connection on its own thread, answering each
/// request frame with whatever the handler returns.
pub struct MockBackend {
    endpoint: Endpoint,
}

impl MockBackend {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&RawFrame) -> Vec<(Message, ChannelId)> + Send + Sync + 'static,
    {
        let listener = Fs4Listener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = listener.local_endpoint().clone();
        let handler: Arc<Handler> = Arc::new(handler);

        thread::spawn(move || {
            while let Ok(stream) = listener.accept() {
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    let mut reader = PacketReader::new(stream.try_clone().unwrap());
                    let mut writer = PacketWriter::new(stream);
                    while let Ok(frame) = reader.read_raw() {
                        for (reply, channel) in handler(&frame) {
                            if writer.send(&reply, channel).is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self { endpoint }
    }

    /// A backend holding two documents out of five, one of them active for pings.
    pub fn standard() -> Self {
        Self::start(standard_reply)
    }

    /// A backend that reads requests and never answers.
    pub fn silent() -> Self {
        Self::start(|_| Vec::new())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

pub const QUERY: u32 = 218;
pub const GET_SUMMARIES: u32 = 219;
pub const PING: u32 = 220;

fn word_at(frame: &RawFrame, at: usize) -> u32 {
    let bytes = frame.as_bytes();
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Channel id of a query frame.
pub fn query_channel(frame: &RawFrame) -> ChannelId {
    word_at(frame, 8)
}

/// `offset` field of an uncompressed query body.
pub fn query_offset(frame: &RawFrame) -> u32 {
    word_at(frame, 16)
}

/// `hits` field of an uncompressed query body.
pub fn query_hits(frame: &RawFrame) -> u32 {
    word_at(frame, 20)
}

pub fn corpus() -> Vec<Document> {
    vec![
        Document::new(GlobalId::new([0xa1; 12]), 0.9),
        Document::new(GlobalId::new([0xb2; 12]), 0.4),
    ]
}

pub fn standard_reply(frame: &RawFrame) -> Vec<(Message, ChannelId)> {
    match frame.packet_code() {
        QUERY => {
            let documents: Vec<_> = corpus()
                .into_iter()
                .take(query_hits(frame) as usize)
                .collect();
            let result = QueryResult {
                offset: query_offset(frame),
                total_document_count: 5,
                max_rank: 0.9,
                documents,
                coverage: Coverage::full(5),
                ..QueryResult::default()
            };
            vec![(Message::from(result), query_channel(frame))]
        }
        GET_SUMMARIES => {
            let mut replies: Vec<_> = corpus()
                .iter()
                .map(|doc| {
                    let summary = DocumentSummary::new(doc.gid, format!("summary of {}", doc.gid));
                    (Message::from(summary), 0)
                })
                .collect();
            replies.push((Message::Eol, 0));
            replies
        }
        PING => {
            let pong = Pong {
                docstamp: 42,
                active_documents: Some(1),
                ..Pong::default()
            };
            vec![(Message::from(pong), 0)]
        }
        _ => Vec::new(),
    }
}
