//! Reply bodies: query results, document summaries and errors.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::body::{put_blob, put_string, BodyReader};
use crate::code::result_flags;
use crate::error::Result;

/// 12-byte global document id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GlobalId([u8; GlobalId::LENGTH]);

impl GlobalId {
    pub const LENGTH: usize = 12;

    pub const fn new(raw: [u8; Self::LENGTH]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({self})")
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Where a hit lives in a multi-level-dispatch (MLD) setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PartitionRef {
    pub part_id: u32,
    pub distribution_key: u32,
}

/// One hit in a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub gid: GlobalId,
    pub relevance: f64,
    /// Present when the result was produced with MLD partition info.
    pub partition: Option<PartitionRef>,
}

impl Document {
    pub fn new(gid: GlobalId, relevance: f64) -> Self {
        Self {
            gid,
            relevance,
            partition: None,
        }
    }

    pub fn with_partition(mut self, part_id: u32, distribution_key: u32) -> Self {
        self.partition = Some(PartitionRef {
            part_id,
            distribution_key,
        });
        self
    }
}

/// How many search nodes were asked and how many answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCoverage {
    pub queried: u16,
    pub replied: u16,
}

/// Document coverage counters reported with every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coverage {
    pub docs: u64,
    pub active: u64,
    pub soon_active: u64,
    pub degraded_reason: u32,
}

impl Coverage {
    pub fn full(docs: u64) -> Self {
        Self {
            docs,
            active: docs,
            soon_active: docs,
            degraded_reason: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason != 0
    }
}

/// Reply to a query (code 217).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub offset: u32,
    pub total_document_count: u64,
    pub max_rank: f64,
    pub documents: Vec<Document>,
    /// Per-document sort blobs, one entry per document.
    pub sort_data: Option<Vec<Bytes>>,
    pub nodes: Option<NodeCoverage>,
    pub coverage: Coverage,
    /// Opaque serialized grouping result.
    pub group_data: Option<Bytes>,
}

impl QueryResult {
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn features(&self) -> u32 {
        let mut features = 0;
        if self.documents.iter().any(|doc| doc.partition.is_some()) {
            features |= result_flags::MLD;
        }
        if self.sort_data.is_some() {
            features |= result_flags::SORT_DATA;
        }
        if self.nodes.is_some() {
            features |= result_flags::COVERAGE_NODES;
        }
        if self.group_data.is_some() {
            features |= result_flags::GROUP_DATA;
        }
        features
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        let features = self.features();
        dst.put_u32(features);
        dst.put_u32(self.offset);
        dst.put_u32(self.documents.len() as u32);
        dst.put_u64(self.total_document_count);
        dst.put_f64(self.max_rank);

        if let Some(sort_data) = &self.sort_data {
            // Cumulative end offsets into one blob, then the blob itself.
            let mut end = 0u32;
            for (index, _) in self.documents.iter().enumerate() {
                end += sort_data.get(index).map_or(0, |blob| blob.len() as u32);
                dst.put_u32(end);
            }
            dst.put_u32(end);
            for index in 0..self.documents.len() {
                if let Some(blob) = sort_data.get(index) {
                    dst.put_slice(blob);
                }
            }
        }

        if let Some(nodes) = self.nodes {
            dst.put_u16(nodes.queried);
            dst.put_u16(nodes.replied);
        }

        dst.put_u64(self.coverage.docs);
        dst.put_u64(self.coverage.active);
        dst.put_u64(self.coverage.soon_active);
        dst.put_u32(self.coverage.degraded_reason);

        if let Some(group_data) = &self.group_data {
            put_blob(dst, group_data);
        }

        let mld = features & result_flags::MLD != 0;
        for doc in &self.documents {
            dst.put_slice(doc.gid.as_bytes());
            dst.put_f64(doc.relevance);
            if mld {
                let partition = doc.partition.unwrap_or_default();
                dst.put_u32(partition.part_id);
                dst.put_u32(partition.distribution_key);
            }
        }
    }

    pub(crate) fn decode_body(reader: &mut BodyReader) -> Result<Self> {
        let features = reader.get_u32()?;
        let offset = reader.get_u32()?;
        let document_count = reader.get_u32()? as usize;
        let total_document_count = reader.get_u64()?;
        let max_rank = reader.get_f64()?;

        // Each document needs at least gid + relevance; reject absurd counts
        // before allocating for them.
        if document_count > reader.remaining() / (GlobalId::LENGTH + 8) {
            return Err(reader.malformed(format!(
                "document count {document_count} exceeds body size"
            )));
        }

        let sort_data = if features & result_flags::SORT_DATA != 0 {
            let mut ends = Vec::with_capacity(document_count);
            for _ in 0..document_count {
                ends.push(reader.get_u32()? as usize);
            }
            let blob = reader.get_blob()?;
            let mut slices = Vec::with_capacity(document_count);
            let mut start = 0usize;
            for end in ends {
                if end < start || end > blob.len() {
                    return Err(reader.malformed(format!(
                        "sort data index {end} out of range (start {start}, blob {})",
                        blob.len()
                    )));
                }
                slices.push(blob.slice(start..end));
                start = end;
            }
            Some(slices)
        } else {
            None
        };

        let nodes = if features & result_flags::COVERAGE_NODES != 0 {
            Some(NodeCoverage {
                queried: reader.get_u16()?,
                replied: reader.get_u16()?,
            })
        } else {
            None
        };

        let coverage = Coverage {
            docs: reader.get_u64()?,
            active: reader.get_u64()?,
            soon_active: reader.get_u64()?,
            degraded_reason: reader.get_u32()?,
        };

        let group_data = if features & result_flags::GROUP_DATA != 0 {
            Some(reader.get_blob()?)
        } else {
            None
        };

        let mld = features & result_flags::MLD != 0;
        let mut documents = Vec::with_capacity(document_count);
        for _ in 0..document_count {
            let gid = reader.get_gid()?;
            let relevance = reader.get_f64()?;
            let partition = if mld {
                Some(PartitionRef {
                    part_id: reader.get_u32()?,
                    distribution_key: reader.get_u32()?,
                })
            } else {
                None
            };
            documents.push(Document {
                gid,
                relevance,
                partition,
            });
        }

        Ok(Self {
            offset,
            total_document_count,
            max_rank,
            documents,
            sort_data,
            nodes,
            coverage,
            group_data,
        })
    }
}

/// One document summary (code 205): gid plus the opaque summary blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub gid: GlobalId,
    pub data: Bytes,
}

impl DocumentSummary {
    pub fn new(gid: GlobalId, data: impl Into<Bytes>) -> Self {
        Self {
            gid,
            data: data.into(),
        }
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        dst.put_slice(self.gid.as_bytes());
        dst.put_slice(&self.data);
    }

    pub(crate) fn decode_body(reader: &mut BodyReader) -> Result<Self> {
        let gid = reader.get_gid()?;
        let data = reader.take_rest();
        Ok(Self { gid, data })
    }
}

/// Error reply (code 203).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub error_code: u32,
    pub message: String,
}

impl ErrorReply {
    pub fn new(error_code: u32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        dst.put_u32(self.error_code);
        put_string(dst, &self.message);
    }

    pub(crate) fn decode_body(reader: &mut BodyReader) -> Result<Self> {
        let error_code = reader.get_u32()?;
        let message = reader.get_string()?;
        Ok(Self {
            error_code,
            message,
        })
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend error {}: {}", self.error_code, self.message)
    }
}
