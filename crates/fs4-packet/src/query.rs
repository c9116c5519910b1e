//! Request bodies: queries and summary fetches.
//!
//! The query model itself lives outside this crate. It plugs in through
//! [`QuerySource`], which hands over already-serialized sections; this crate
//! only frames them.
//!
//! Encoding a [`Query`] yields a [`QueryPacketData`] snapshot of the encoded
//! sections that the backend parsed. A follow-up [`GetSummaries`] built from
//! that snapshot reuses those bytes verbatim, so the backend sees exactly the
//! same rank profile, flags, query stack, location and properties.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::body::{put_blob, put_string};
use crate::code::{query_flags, summary_flags};
use crate::result::{Document, GlobalId, PartitionRef};

/// A serializer-produced section: an item count and the opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedItems {
    pub count: u32,
    pub bytes: Bytes,
}

impl SerializedItems {
    pub fn new(count: u32, bytes: impl Into<Bytes>) -> Self {
        Self {
            count,
            bytes: bytes.into(),
        }
    }
}

/// Hook implemented by the request-domain query model.
///
/// Everything except the query stack is optional. Serializer methods write
/// opaque bytes that are framed without interpretation.
pub trait QuerySource {
    fn offset(&self) -> u32;

    fn hits(&self) -> u32;

    fn timeout(&self) -> Duration;

    fn query_flags(&self) -> u32 {
        0
    }

    fn rank_profile(&self) -> Option<String> {
        None
    }

    fn sort_spec(&self) -> Option<String> {
        None
    }

    fn location(&self) -> Option<String> {
        None
    }

    fn session_id(&self) -> Option<Bytes> {
        None
    }

    /// Write the property maps; returns how many maps were written.
    fn encode_property_maps(&self, _dst: &mut BytesMut) -> u32 {
        0
    }

    /// Write the grouping requests; returns false if there are none.
    fn encode_grouping(&self, _dst: &mut BytesMut) -> bool {
        false
    }

    /// Write the parsed query tree; returns the number of stack items.
    fn encode_query_stack(&self, dst: &mut BytesMut) -> u32;
}

/// Query request (code 218, channel-carrying).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub offset: u32,
    pub hits: u32,
    pub timeout: Duration,
    pub query_flags: u32,
    pub rank_profile: Option<String>,
    pub property_maps: Option<SerializedItems>,
    pub sort_spec: Option<String>,
    pub grouping: Option<Bytes>,
    pub session_id: Option<Bytes>,
    pub location: Option<String>,
    pub query_stack: Option<SerializedItems>,
}

impl Query {
    pub fn new(offset: u32, hits: u32, timeout: Duration) -> Self {
        Self {
            offset,
            hits,
            timeout,
            ..Self::default()
        }
    }

    /// Build a query by running the external serializer hooks.
    pub fn from_source<S: QuerySource + ?Sized>(source: &S) -> Self {
        let mut query = Self::new(source.offset(), source.hits(), source.timeout());
        query.query_flags = source.query_flags();
        query.rank_profile = source.rank_profile();
        query.sort_spec = source.sort_spec();
        query.location = source.location();
        query.session_id = source.session_id();

        let mut scratch = BytesMut::new();
        let count = source.encode_property_maps(&mut scratch);
        if count > 0 || !scratch.is_empty() {
            query.property_maps = Some(SerializedItems::new(count, scratch.split().freeze()));
        }

        if source.encode_grouping(&mut scratch) {
            query.grouping = Some(scratch.split().freeze());
        }
        scratch.clear();

        let count = source.encode_query_stack(&mut scratch);
        if count > 0 || !scratch.is_empty() {
            query.query_stack = Some(SerializedItems::new(count, scratch.split().freeze()));
        }
        query
    }

    pub fn with_rank_profile(mut self, profile: impl Into<String>) -> Self {
        self.rank_profile = Some(profile.into());
        self
    }

    pub fn with_query_flags(mut self, flags: u32) -> Self {
        self.query_flags = flags;
        self
    }

    pub fn with_query_stack(mut self, item_count: u32, bytes: impl Into<Bytes>) -> Self {
        self.query_stack = Some(SerializedItems::new(item_count, bytes));
        self
    }

    pub fn with_property_maps(mut self, map_count: u32, bytes: impl Into<Bytes>) -> Self {
        self.property_maps = Some(SerializedItems::new(map_count, bytes));
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_sort_spec(mut self, sort_spec: impl Into<String>) -> Self {
        self.sort_spec = Some(sort_spec.into());
        self
    }

    pub fn with_grouping(mut self, grouping: impl Into<Bytes>) -> Self {
        self.grouping = Some(grouping.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<Bytes>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn features(&self) -> u32 {
        let mut features = 0;
        if self.query_stack.is_some() {
            features |= query_flags::PARSED_QUERY;
        }
        if self.rank_profile.is_some() {
            features |= query_flags::RANK_PROFILE;
        }
        if self.sort_spec.is_some() {
            features |= query_flags::SORT_SPEC;
        }
        if self.location.is_some() {
            features |= query_flags::LOCATION;
        }
        if self.property_maps.is_some() {
            features |= query_flags::PROPERTIES;
        }
        if self.grouping.is_some() {
            features |= query_flags::GROUP_SPEC;
        }
        if self.session_id.is_some() {
            features |= query_flags::SESSION_ID;
        }
        features
    }

    /// Write the body and capture the sections later summary fetches reuse.
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) -> QueryPacketData {
        let mut data = QueryPacketData {
            query_flags: self.query_flags,
            ..QueryPacketData::default()
        };

        dst.put_u32(self.features());
        dst.put_u32(self.offset);
        dst.put_u32(self.hits);
        dst.put_u32(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        dst.put_u32(self.query_flags);

        if let Some(profile) = &self.rank_profile {
            let start = dst.len();
            put_string(dst, profile);
            data.rank_profile = Some(snapshot(dst, start));
        }
        if let Some(maps) = &self.property_maps {
            let start = dst.len();
            dst.put_u32(maps.count);
            dst.put_slice(&maps.bytes);
            data.property_maps = Some(snapshot(dst, start));
        }
        if let Some(sort_spec) = &self.sort_spec {
            put_string(dst, sort_spec);
        }
        if let Some(grouping) = &self.grouping {
            put_blob(dst, grouping);
        }
        if let Some(session_id) = &self.session_id {
            put_blob(dst, session_id);
        }
        if let Some(location) = &self.location {
            let start = dst.len();
            put_string(dst, location);
            data.location = Some(snapshot(dst, start));
        }
        if let Some(stack) = &self.query_stack {
            let start = dst.len();
            dst.put_u32(stack.count);
            put_blob(dst, &stack.bytes);
            data.query_stack = Some(snapshot(dst, start));
        }
        data
    }
}

fn snapshot(dst: &BytesMut, start: usize) -> Bytes {
    Bytes::copy_from_slice(&dst[start..])
}

/// Encoded query sections, exactly as they went out in a query packet.
///
/// Immutable once captured; only the encoder creates non-empty snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryPacketData {
    rank_profile: Option<Bytes>,
    query_flags: u32,
    query_stack: Option<Bytes>,
    location: Option<Bytes>,
    property_maps: Option<Bytes>,
}

impl QueryPacketData {
    /// Length-prefixed rank profile name.
    pub fn rank_profile(&self) -> Option<&Bytes> {
        self.rank_profile.as_ref()
    }

    pub fn query_flags(&self) -> u32 {
        self.query_flags
    }

    /// Item count, byte length and query stack bytes.
    pub fn query_stack(&self) -> Option<&Bytes> {
        self.query_stack.as_ref()
    }

    /// Length-prefixed location string.
    pub fn location(&self) -> Option<&Bytes> {
        self.location.as_ref()
    }

    /// Map count followed by the serialized maps.
    pub fn property_maps(&self) -> Option<&Bytes> {
        self.property_maps.as_ref()
    }
}

/// One hit whose summary should be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryHit {
    pub gid: GlobalId,
    pub partition: Option<PartitionRef>,
}

impl From<&Document> for SummaryHit {
    fn from(doc: &Document) -> Self {
        Self {
            gid: doc.gid,
            partition: doc.partition,
        }
    }
}

/// Summary fetch request (code 219, connectionless).
///
/// Answered by one document summary per hit followed by an eol, or by an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetSummaries {
    pub query: Option<QueryPacketData>,
    pub result_class: Option<String>,
    pub flags: u32,
    pub hits: Vec<SummaryHit>,
}

impl GetSummaries {
    /// Fetch summaries for every document in a result, reusing the snapshot
    /// of the query that produced it.
    pub fn for_documents<'a>(
        query: QueryPacketData,
        documents: impl IntoIterator<Item = &'a Document>,
    ) -> Self {
        Self {
            query: Some(query),
            hits: documents.into_iter().map(SummaryHit::from).collect(),
            ..Self::default()
        }
    }

    pub fn with_result_class(mut self, class: impl Into<String>) -> Self {
        self.result_class = Some(class.into());
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn features(&self) -> u32 {
        let mut features = 0;
        if self.hits.iter().any(|hit| hit.partition.is_some()) {
            features |= summary_flags::MLD;
        }
        if let Some(query) = &self.query {
            features |= summary_flags::RANK_PROFILE_QUERY_FLAGS;
            if query.property_maps.is_some() {
                features |= summary_flags::PROPERTIES;
            }
            if query.query_stack.is_some() {
                features |= summary_flags::QUERY_STACK;
            }
            if query.location.is_some() {
                features |= summary_flags::LOCATION;
            }
        }
        if self.result_class.is_some() {
            features |= summary_flags::RESULT_CLASS_NAME;
        }
        if self.flags != 0 {
            features |= summary_flags::FLAGS;
        }
        features
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        let features = self.features();
        dst.put_u32(features);

        if let Some(query) = &self.query {
            match &query.rank_profile {
                Some(profile) => dst.put_slice(profile),
                None => put_string(dst, ""),
            }
            dst.put_u32(query.query_flags);
        }
        if let Some(class) = &self.result_class {
            put_string(dst, class);
        }
        if let Some(query) = &self.query {
            for section in [&query.property_maps, &query.query_stack, &query.location]
                .into_iter()
                .flatten()
            {
                dst.put_slice(section);
            }
        }
        if self.flags != 0 {
            dst.put_u32(self.flags);
        }

        let mld = features & summary_flags::MLD != 0;
        for hit in &self.hits {
            dst.put_slice(hit.gid.as_bytes());
            if mld {
                let partition = hit.partition.unwrap_or_default();
                dst.put_u32(partition.part_id);
                dst.put_u32(partition.distribution_key);
            }
        }
    }
}
