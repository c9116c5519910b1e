//! Health-check packets. Both are connectionless: no channel id on the wire.

use bytes::{BufMut, BytesMut};

use crate::body::BodyReader;
use crate::code::monitor_flags;
use crate::error::Result;

/// Monitor request (code 220).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Ask the backend to include its active document count in the pong.
    pub report_active_documents: bool,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            report_active_documents: true,
        }
    }
}

impl Ping {
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        if self.report_active_documents {
            dst.put_u32(monitor_flags::QUERY_FLAGS);
            dst.put_u32(monitor_flags::REPORT_ACTIVE_DOCS);
        } else {
            dst.put_u32(0);
        }
    }
}

/// Node and partition counts reported by a dispatching backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub total_nodes: u32,
    pub active_nodes: u32,
    pub total_partitions: u32,
    pub active_partitions: u32,
}

/// Monitor reply (code 221).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pong {
    pub docstamp: u32,
    pub nodes: Option<NodeStatus>,
    pub active_documents: Option<u64>,
}

impl Pong {
    pub fn active_documents(&self) -> Option<u64> {
        self.active_documents
    }

    pub fn active_nodes(&self) -> Option<u32> {
        self.nodes.map(|n| n.active_nodes)
    }

    pub fn active_partitions(&self) -> Option<u32> {
        self.nodes.map(|n| n.active_partitions)
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        let mut features = 0;
        if self.nodes.is_some() {
            features |= monitor_flags::REPLY_MLD;
        }
        if self.active_documents.is_some() {
            features |= monitor_flags::REPLY_ACTIVE_DOCS;
        }
        dst.put_u32(features);
        dst.put_u32(self.docstamp);
        if let Some(nodes) = self.nodes {
            dst.put_u32(nodes.total_nodes);
            dst.put_u32(nodes.active_nodes);
            dst.put_u32(nodes.total_partitions);
            dst.put_u32(nodes.active_partitions);
        }
        if let Some(docs) = self.active_documents {
            dst.put_u64(docs);
        }
    }

    pub(crate) fn decode_body(reader: &mut BodyReader) -> Result<Self> {
        let features = reader.get_u32()?;
        let docstamp = reader.get_u32()?;
        let nodes = if features & monitor_flags::REPLY_MLD != 0 {
            Some(NodeStatus {
                total_nodes: reader.get_u32()?,
                active_nodes: reader.get_u32()?,
                total_partitions: reader.get_u32()?,
                active_partitions: reader.get_u32()?,
            })
        } else {
            None
        };
        if features & monitor_flags::REPLY_FLAGS != 0 {
            let _reply_flags = reader.get_u32()?;
        }
        let active_documents = if features & monitor_flags::REPLY_ACTIVE_DOCS != 0 {
            Some(reader.get_u64()?)
        } else {
            None
        };
        Ok(Self {
            docstamp,
            nodes,
            active_documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;
    use crate::code::PONG;

    #[test]
    fn ping_requests_active_docs_by_default() {
        let mut body = BytesMut::new();
        Ping::default().encode_body(&mut body);
        assert_eq!(body.len(), 8);
        assert_eq!(body.get_u32(), monitor_flags::QUERY_FLAGS);
        assert_eq!(body.get_u32(), monitor_flags::REPORT_ACTIVE_DOCS);
    }

    #[test]
    fn plain_ping_is_one_word() {
        let mut body = BytesMut::new();
        Ping {
            report_active_documents: false,
        }
        .encode_body(&mut body);
        assert_eq!(&body[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn pong_skips_reply_flags_word() {
        let mut body = BytesMut::new();
        body.put_u32(monitor_flags::REPLY_FLAGS | monitor_flags::REPLY_ACTIVE_DOCS);
        body.put_u32(3);
        body.put_u32(0xdead);
        body.put_u64(77);

        let mut reader = BodyReader::new(PONG, body.freeze());
        let pong = Pong::decode_body(&mut reader).unwrap();
        assert_eq!(pong.docstamp, 3);
        assert_eq!(pong.active_documents(), Some(77));
        assert_eq!(pong.active_nodes(), None);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn pong_node_counts() {
        let pong = Pong {
            docstamp: 1,
            nodes: Some(NodeStatus {
                total_nodes: 4,
                active_nodes: 3,
                total_partitions: 2,
                active_partitions: 2,
            }),
            active_documents: None,
        };
        let mut body = BytesMut::new();
        pong.encode_body(&mut body);
        let mut reader = BodyReader::new(PONG, body.freeze());
        let decoded = Pong::decode_body(&mut reader).unwrap();
        assert_eq!(decoded, pong);
        assert_eq!(decoded.active_nodes(), Some(3));
        assert_eq!(decoded.active_partitions(), Some(2));
    }
}
