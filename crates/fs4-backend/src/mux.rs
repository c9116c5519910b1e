//! Channel multiplexer: one connection, one reader thread, many channels.
//!
//! Requests carry their channel id and replies echo it at a fixed header
//! offset, so most inbound frames are routed by sniffing that id before
//! decoding. The monitor and summary protocols are connectionless; their
//! replies are matched to outstanding requests in the order those were sent.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fs4_packet::code::code_name;
use fs4_packet::{
    ChannelId, EncodeSummary, Message, PacketError, PacketReader, PacketWriter, Query,
    QueryPacketData, RawFrame,
};
use fs4_transport::{Endpoint, Fs4Stream};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelKind, ChannelState, Inbox};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::listener::PacketListener;
use crate::stats::{BackendStats, Counter};

#[derive(Debug)]
struct Registry {
    channels: HashMap<ChannelId, Arc<Inbox>>,
    next_id: ChannelId,
    /// Ping channels with a ping in flight, oldest first.
    ping_waiters: VecDeque<ChannelId>,
    /// Channels with a summary request in flight, oldest first.
    summary_waiters: VecDeque<ChannelId>,
    /// Request channels with an unanswered query, oldest first. A
    /// connectionless error with no summary request pending answers these.
    query_waiters: VecDeque<ChannelId>,
    /// Set once the connection is unusable.
    closed: Option<String>,
}

impl Registry {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 1,
            ping_waiters: VecDeque::new(),
            summary_waiters: VecDeque::new(),
            query_waiters: VecDeque::new(),
            closed: None,
        }
    }

    /// Next free id from the monotonic counter. Zero is never handed out.
    fn allocate_id(&mut self) -> ChannelId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    fn owns(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.id())
            .is_some_and(|inbox| Arc::ptr_eq(inbox, channel.inbox()))
    }

    fn forget_waiter(queue: &mut VecDeque<ChannelId>, id: ChannelId) {
        if let Some(pos) = queue.iter().rposition(|waiting| *waiting == id) {
            queue.remove(pos);
        }
    }

    fn forget_all(&mut self, id: ChannelId) {
        self.ping_waiters.retain(|waiting| *waiting != id);
        self.summary_waiters.retain(|waiting| *waiting != id);
        self.query_waiters.retain(|waiting| *waiting != id);
    }

    fn clear_waiters(&mut self) {
        self.ping_waiters.clear();
        self.summary_waiters.clear();
        self.query_waiters.clear();
    }
}

/// State shared between callers and the reader thread.
struct Shared {
    endpoint: Endpoint,
    registry: Mutex<Registry>,
    stats: Arc<BackendStats>,
    listener: Option<Arc<dyn PacketListener>>,
    alive: AtomicBool,
    shutting_down: AtomicBool,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_loop(&self, mut reader: PacketReader<Fs4Stream>) {
        loop {
            match reader.read_raw() {
                Ok(frame) => self.route(frame),
                Err(err) => {
                    self.connection_lost(&err);
                    return;
                }
            }
        }
    }

    fn route(&self, frame: RawFrame) {
        self.stats.bump(Counter::PacketReceived);

        // Result frames: route by the echoed id before paying for a decode.
        if let Some(id) = frame.channel() {
            let inbox = {
                let mut registry = self.registry();
                let inbox = registry.channels.get(&id).cloned();
                if inbox.is_some() {
                    Registry::forget_waiter(&mut registry.query_waiters, id);
                }
                inbox
            };
            let Some(inbox) = inbox else {
                debug!(
                    endpoint = %self.endpoint,
                    channel = id,
                    packet = code_name(frame.packet_code()),
                    "dropping packet for unknown channel"
                );
                self.stats.bump(Counter::DroppedPacket);
                // Only worth decoding when someone is watching.
                if self.listener.is_some() {
                    if let Some(message) = self.decode(&frame) {
                        self.notify_dropped(&message, &frame);
                    }
                }
                return;
            };
            if let Some(message) = self.decode(&frame) {
                self.deliver(id, &inbox, message, &frame);
            }
            return;
        }

        let Some(message) = self.decode(&frame) else {
            return;
        };
        let target = {
            let mut registry = self.registry();
            let id = match &message {
                Message::Pong(_) => registry.ping_waiters.pop_front(),
                Message::DocumentSummary(_) => registry.summary_waiters.front().copied(),
                Message::Eol => registry.summary_waiters.pop_front(),
                Message::Error(_) => registry
                    .summary_waiters
                    .pop_front()
                    .or_else(|| registry.query_waiters.pop_front()),
                _ => None,
            };
            id.and_then(|id| registry.channels.get(&id).cloned().map(|inbox| (id, inbox)))
        };

        match target {
            Some((id, inbox)) => self.deliver(id, &inbox, message, &frame),
            None => {
                self.notify_dropped(&message, &frame);
                match &message {
                    Message::Error(reply) => warn!(
                        endpoint = %self.endpoint,
                        error_code = reply.error_code,
                        message = %reply.message,
                        "dropping backend error with no outstanding request"
                    ),
                    Message::Eol => warn!(
                        endpoint = %self.endpoint,
                        "dropping end-of-list with no outstanding summary request"
                    ),
                    _ => debug!(
                        endpoint = %self.endpoint,
                        packet = message.name(),
                        "dropping connectionless packet with no outstanding request"
                    ),
                }
                self.stats.bump(Counter::DroppedPacket);
            }
        }
    }

    fn notify_dropped(&self, message: &Message, frame: &RawFrame) {
        if let Some(listener) = &self.listener {
            listener.on_receive(None, message, frame.as_bytes());
        }
    }

    fn decode(&self, frame: &RawFrame) -> Option<Message> {
        match frame.decode() {
            Ok(packet) => Some(packet.message),
            Err(err) => {
                warn!(
                    endpoint = %self.endpoint,
                    code = frame.packet_code(),
                    packet = code_name(frame.packet_code()),
                    error = %err,
                    "discarding undecodable packet"
                );
                self.stats.bump(Counter::ProtocolError);
                if let Some(listener) = &self.listener {
                    listener.on_decode_error(frame.as_bytes(), &err);
                }
                None
            }
        }
    }

    fn deliver(&self, id: ChannelId, inbox: &Inbox, message: Message, frame: &RawFrame) {
        if let Some(listener) = &self.listener {
            listener.on_receive(Some(id), &message, frame.as_bytes());
        }
        if !inbox.push(message) {
            debug!(endpoint = %self.endpoint, channel = id, "channel closed; dropping packet");
            self.stats.bump(Counter::DroppedPacket);
        }
    }

    fn connection_lost(&self, err: &PacketError) {
        self.alive.store(false, Ordering::Release);
        let reason = err.to_string();
        if self.shutting_down.load(Ordering::Acquire) {
            debug!(endpoint = %self.endpoint, "reader stopped for shutdown");
        } else {
            warn!(endpoint = %self.endpoint, error = %err, "backend connection lost");
        }

        let mut registry = self.registry();
        registry.closed.get_or_insert(reason.clone());
        registry.clear_waiters();
        for inbox in registry.channels.values() {
            inbox.fail(&reason);
        }
    }
}

/// A live connection to one backend and the channels multiplexed over it.
pub struct Multiplexer {
    shared: Arc<Shared>,
    writer: Mutex<PacketWriter<Fs4Stream>>,
    stream: Fs4Stream,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Take over a connected stream and start the reader thread.
    pub fn start(
        stream: Fs4Stream,
        endpoint: Endpoint,
        config: &BackendConfig,
        stats: Arc<BackendStats>,
    ) -> Result<Arc<Self>> {
        let reader = PacketReader::with_config_stream(stream.try_clone()?, config.reader_config())?;
        let writer = PacketWriter::with_config_stream(stream.try_clone()?, config.packet.clone())?;

        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            registry: Mutex::new(Registry::new()),
            stats,
            listener: config.listener.clone(),
            alive: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("fs4-reader-{endpoint}"))
                .spawn(move || shared.read_loop(reader))
                .map_err(fs4_transport::TransportError::Io)?
        };
        info!(%endpoint, "backend connection up");

        Ok(Arc::new(Self {
            shared,
            writer: Mutex::new(writer),
            stream,
            reader: Mutex::new(Some(handle)),
        }))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// False once the reader thread has stopped.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Open a request channel with a fresh id.
    pub fn open_channel(self: &Arc<Self>) -> Result<Channel> {
        self.open(ChannelKind::Request)
    }

    /// Open a channel that claims inbound pongs for the pings it sends.
    pub fn open_ping_channel(self: &Arc<Self>) -> Result<Channel> {
        self.open(ChannelKind::Ping)
    }

    fn open(self: &Arc<Self>, kind: ChannelKind) -> Result<Channel> {
        let mut registry = self.shared.registry();
        if let Some(reason) = &registry.closed {
            return Err(BackendError::NotConnected(reason.clone()));
        }
        let id = registry.allocate_id();
        let inbox = Arc::new(Inbox::new(id));
        registry.channels.insert(id, Arc::clone(&inbox));
        drop(registry);

        self.shared.stats.bump(Counter::ChannelOpened);
        debug!(endpoint = %self.shared.endpoint, channel = id, ?kind, "channel opened");
        Ok(Channel::new(id, kind, inbox, Arc::clone(self)))
    }

    /// Encode and write `message` tagged with the channel's id.
    ///
    /// I/O failures yield `Ok(false)`; only misuse (closed channel, packet
    /// too large to ever encode) is an error.
    pub fn send(&self, channel: &Channel, message: &Message) -> Result<bool> {
        Ok(self.transmit(channel, message)?.is_some())
    }

    /// Like [`Multiplexer::send`], returning the encoded-section snapshot a
    /// later summary fetch reuses. `Ok(None)` means the write failed.
    pub fn send_query(&self, channel: &Channel, query: &Query) -> Result<Option<QueryPacketData>> {
        let sent = self.transmit(channel, &Message::Query(query.clone()))?;
        Ok(sent.map(|summary| summary.query_data.unwrap_or_default()))
    }

    fn transmit(&self, channel: &Channel, message: &Message) -> Result<Option<EncodeSummary>> {
        let id = channel.id();
        let waiter = match (channel.kind(), message) {
            (ChannelKind::Ping, Message::Ping(_)) => Some(Waiter::Ping),
            (ChannelKind::Request, Message::Query(_)) => Some(Waiter::Query),
            (_, Message::GetSummaries(_)) => Some(Waiter::Summary),
            _ => None,
        };

        {
            let mut registry = self.shared.registry();
            match channel.state() {
                ChannelState::Closed => return Err(BackendError::InvalidChannel(id)),
                ChannelState::Failed(reason) => {
                    debug!(channel = id, %reason, "send on failed channel");
                    self.shared.stats.bump(Counter::SendFailure);
                    return Ok(None);
                }
                ChannelState::Open | ChannelState::AwaitingResponse => {}
            }
            if !registry.owns(channel) {
                return Err(BackendError::InvalidChannel(id));
            }
            // Register before writing: the reply may beat us back.
            match waiter {
                Some(Waiter::Ping) => registry.ping_waiters.push_back(id),
                Some(Waiter::Summary) => registry.summary_waiters.push_back(id),
                Some(Waiter::Query) => registry.query_waiters.push_back(id),
                None => {}
            }
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.send(message, id) {
            Ok(summary) => {
                if let Some(listener) = &self.shared.listener {
                    listener.on_send(id, message, writer.last_frame());
                }
                drop(writer);
                self.shared.stats.bump(Counter::PacketSent);
                if channel.kind() == ChannelKind::Request {
                    channel.inbox().mark_awaiting();
                }
                Ok(Some(summary))
            }
            Err(err) => {
                drop(writer);
                self.unregister_waiter(waiter, id);
                match err {
                    PacketError::Io(_) | PacketError::ConnectionClosed => {
                        warn!(
                            endpoint = %self.shared.endpoint,
                            channel = id,
                            packet = message.name(),
                            error = %err,
                            "send failed"
                        );
                        self.shared.stats.bump(Counter::SendFailure);
                        // A partial frame may be on the wire; the stream is
                        // unusable. The reader sees the shutdown and fails
                        // every channel.
                        if let Err(err) = self.stream.shutdown() {
                            debug!(
                                endpoint = %self.shared.endpoint,
                                error = %err,
                                "socket shutdown failed"
                            );
                        }
                        Ok(None)
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    fn unregister_waiter(&self, waiter: Option<Waiter>, id: ChannelId) {
        let mut registry = self.shared.registry();
        match waiter {
            Some(Waiter::Ping) => Registry::forget_waiter(&mut registry.ping_waiters, id),
            Some(Waiter::Summary) => Registry::forget_waiter(&mut registry.summary_waiters, id),
            Some(Waiter::Query) => Registry::forget_waiter(&mut registry.query_waiters, id),
            None => {}
        }
    }

    /// Wait for at least `min_count` messages on the channel.
    pub fn receive(
        &self,
        channel: &Channel,
        timeout: Duration,
        min_count: usize,
    ) -> Result<Vec<Message>> {
        let result = channel.inbox().receive(timeout, min_count);
        if let Err(BackendError::ChannelTimeout { .. }) = &result {
            self.shared.stats.bump(Counter::ChannelTimeout);
            debug!(
                endpoint = %self.shared.endpoint,
                channel = channel.id(),
                ?timeout,
                "receive timed out"
            );
        }
        result
    }

    /// Deregister the channel and drop anything still queued for it.
    pub fn close(&self, channel: &Channel) {
        let id = channel.id();
        let mut registry = self.shared.registry();
        if registry.owns(channel) {
            registry.channels.remove(&id);
            registry.forget_all(id);
            debug!(endpoint = %self.shared.endpoint, channel = id, "channel closed");
        }
        drop(registry);
        channel.inbox().close();
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.shared.registry().channels.len()
    }

    /// Close every channel, shut the socket down and join the reader thread.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut registry = self.shared.registry();
            registry.closed.get_or_insert_with(|| "shut down".to_string());
            registry.clear_waiters();
            for (_, inbox) in registry.channels.drain() {
                inbox.close();
            }
        }

        if let Err(err) = self.stream.shutdown() {
            debug!(endpoint = %self.shared.endpoint, error = %err, "socket shutdown failed");
        }

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(endpoint = %self.shared.endpoint, "reader thread panicked");
            }
        }
        self.shared.alive.store(false, Ordering::Release);
        info!(endpoint = %self.shared.endpoint, "backend connection closed");
    }
}

#[derive(Debug, Clone, Copy)]
enum Waiter {
    Ping,
    Summary,
    Query,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoint", &self.shared.endpoint)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use fs4_packet::{
        encode, CompressionConfig, Document, DocumentSummary, ErrorReply, GetSummaries, GlobalId,
        PacketConfig, Ping, Pong, Query, QueryPacketData, QueryResult,
    };
    use fs4_transport::Fs4Listener;

    use super::*;

    struct Peer {
        reader: PacketReader<Fs4Stream>,
        writer: PacketWriter<Fs4Stream>,
    }

    impl Peer {
        fn recv(&mut self) -> fs4_packet::RawFrame {
            self.reader.read_raw().unwrap()
        }

        fn reply(&mut self, message: impl Into<Message>, channel: ChannelId) {
            self.writer.send(&message.into(), channel).unwrap();
        }

        fn reply_compressed(&mut self, message: impl Into<Message>, channel: ChannelId) {
            let frame = encode(&message.into(), channel, &CompressionConfig::lz4(256)).unwrap();
            std::io::Write::write_all(self.writer.get_mut(), &frame).unwrap();
        }
    }

    fn connected(config: BackendConfig) -> (Arc<Multiplexer>, Peer) {
        let listener = Fs4Listener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = listener.local_endpoint().clone();
        let client = fs4_transport::connect(&endpoint, Duration::from_secs(1)).unwrap();
        let server = listener.accept().unwrap();
        let peer = Peer {
            reader: PacketReader::new(server.try_clone().unwrap()),
            writer: PacketWriter::new(server),
        };
        let mux = Multiplexer::start(client, endpoint, &config, Arc::default()).unwrap();
        (mux, peer)
    }

    fn result_with(docs: u8) -> QueryResult {
        QueryResult {
            total_document_count: u64::from(docs),
            documents: (0..docs)
                .map(|i| Document::new(GlobalId::new([i; 12]), 1.0))
                .collect(),
            ..QueryResult::default()
        }
    }

    fn query() -> Message {
        Message::from(Query::new(0, 10, Duration::from_millis(500)))
    }

    #[test]
    fn ids_are_monotonic_and_reused_after_close() {
        let mut registry = Registry::new();
        assert_eq!(registry.allocate_id(), 1);
        assert_eq!(registry.allocate_id(), 2);
        registry.channels.insert(3, Arc::new(Inbox::new(3)));
        assert_eq!(registry.allocate_id(), 4);

        registry.next_id = u32::MAX;
        assert_eq!(registry.allocate_id(), u32::MAX);
        // Wraps past zero and skips the id still in use.
        assert_eq!(registry.allocate_id(), 1);
        assert_eq!(registry.allocate_id(), 2);
        assert_eq!(registry.allocate_id(), 4);
    }

    #[test]
    fn query_roundtrip_routes_by_channel() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        assert!(channel.send(&query()).unwrap());
        assert_eq!(channel.state(), ChannelState::AwaitingResponse);
        let request = peer.recv();
        assert_eq!(request.packet_code(), 218);

        peer.reply(result_with(2), channel.id());
        let messages = channel.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code(), 217);
        assert_eq!(messages[0].document_count(), Some(2));
    }

    #[test]
    fn send_query_returns_snapshot() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        let query = Query::new(0, 10, Duration::from_millis(500)).with_rank_profile("default");

        let data = channel.send_query(&query).unwrap().unwrap();
        assert!(data.rank_profile().is_some());
        assert_eq!(peer.recv().packet_code(), 218);
    }

    #[test]
    fn interleaved_replies_reach_their_channels_in_order() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let channels: Vec<_> = (0..4).map(|_| mux.open_channel().unwrap()).collect();

        for round in 0..3u8 {
            for channel in channels.iter().rev() {
                let mut result = result_with(1);
                result.offset = u32::from(round);
                result.total_document_count = u64::from(channel.id());
                peer.reply(result, channel.id());
            }
        }

        for channel in &channels {
            let messages = channel.receive(Duration::from_secs(2), 3).unwrap();
            let offsets: Vec<_> = messages
                .iter()
                .map(|m| m.as_query_result().unwrap())
                .inspect(|r| assert_eq!(r.total_document_count, u64::from(channel.id())))
                .map(|r| r.offset)
                .collect();
            assert_eq!(offsets, vec![0, 1, 2]);
        }
    }

    #[test]
    fn pong_goes_to_ping_channel() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let ping = mux.open_ping_channel().unwrap();
        let other = mux.open_channel().unwrap();

        for round in 0..2u64 {
            assert!(ping.send(&Message::from(Ping::default())).unwrap());
            assert_eq!(peer.recv().packet_code(), 220);
            peer.reply(
                Pong {
                    active_documents: Some(round + 1),
                    ..Pong::default()
                },
                0,
            );
            let messages = ping.receive(Duration::from_secs(2), 1).unwrap();
            assert_eq!(messages[0].code(), 221);
            assert_eq!(messages[0].active_documents(), Some(round + 1));
        }
        // Ping channels skip the awaiting state.
        assert_eq!(ping.state(), ChannelState::Open);
        assert_eq!(other.pending(), 0);
    }

    #[test]
    fn unsolicited_pong_is_dropped() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let stats = Arc::clone(&mux.shared.stats);
        let ping = mux.open_ping_channel().unwrap();

        peer.reply(Pong::default(), 0);
        let err = ping.receive(Duration::from_millis(100), 1).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(stats.snapshot().dropped_packets, 1);
    }

    #[test]
    fn summaries_go_to_requesting_channel_until_eol() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let first = mux.open_channel().unwrap();
        let second = mux.open_channel().unwrap();

        let docs = [Document::new(GlobalId::default(), 1.0)];
        let request = GetSummaries::for_documents(QueryPacketData::default(), &docs);
        assert!(first.send(&Message::from(request.clone())).unwrap());
        assert!(second.send(&Message::from(request)).unwrap());
        assert_eq!(peer.recv().packet_code(), 219);
        assert_eq!(peer.recv().packet_code(), 219);

        peer.reply(DocumentSummary::new(GlobalId::new([1; 12]), "a"), 0);
        peer.reply(DocumentSummary::new(GlobalId::new([2; 12]), "b"), 0);
        peer.reply(Message::Eol, 0);
        peer.reply(ErrorReply::new(12, "summary failed"), 0);

        let got = first.receive(Duration::from_secs(2), 3).unwrap();
        assert_eq!(
            got.iter().map(Message::code).collect::<Vec<_>>(),
            vec![205, 205, 200]
        );
        let got = second.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got[0].as_error().map(|e| e.error_code), Some(12));
    }

    #[test]
    fn reply_for_closed_channel_is_dropped() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let stats = Arc::clone(&mux.shared.stats);
        let closed = mux.open_channel().unwrap();
        let open = mux.open_channel().unwrap();
        let closed_id = closed.id();
        closed.close();

        peer.reply(result_with(1), closed_id);
        peer.reply(result_with(2), open.id());
        let got = open.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got[0].document_count(), Some(2));
        assert_eq!(stats.snapshot().dropped_packets, 1);
    }

    #[test]
    fn closed_channel_rejects_send_and_receive() {
        let (mux, _peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        let id = channel.id();
        channel.close();
        channel.close();

        assert!(matches!(
            channel.send(&query()),
            Err(BackendError::InvalidChannel(got)) if got == id
        ));
        assert!(matches!(
            channel.receive(Duration::from_secs(1), 1),
            Err(BackendError::InvalidChannel(_))
        ));
        assert_eq!(mux.channel_count(), 0);
    }

    #[test]
    fn stale_handle_cannot_use_reused_id() {
        let (mux, _peer) = connected(BackendConfig::default());
        let stale = mux.open_channel().unwrap();
        let id = stale.id();
        stale.close();
        mux.shared.registry().next_id = id;
        let fresh = mux.open_channel().unwrap();
        assert_eq!(fresh.id(), id);

        // The old handle stays closed even though its id is live again.
        assert!(stale.send(&query()).is_err());
        stale.close();
        assert_eq!(mux.channel_count(), 1);
        assert_eq!(fresh.state(), ChannelState::Open);
    }

    #[test]
    fn timeout_is_bounded() {
        let (mux, _peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        let started = Instant::now();
        let err = channel.receive(Duration::from_millis(100), 1).unwrap_err();
        let elapsed = started.elapsed();
        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(mux.shared.stats.snapshot().channel_timeouts, 1);
    }

    #[test]
    fn peer_disconnect_fails_pending_receives() {
        let (mux, peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        let waiter = {
            let mux = Arc::clone(&mux);
            std::thread::spawn(move || {
                let channel = mux.open_channel().unwrap();
                channel.receive(Duration::from_secs(10), 1)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(peer);

        assert!(matches!(
            waiter.join().unwrap(),
            Err(BackendError::ConnectionLost(_))
        ));
        assert!(matches!(
            channel.receive(Duration::from_secs(1), 1),
            Err(BackendError::ConnectionLost(_))
        ));
        assert!(!mux.is_alive());
        assert!(!channel.send(&query()).unwrap());
        assert!(matches!(
            mux.open_channel(),
            Err(BackendError::NotConnected(_))
        ));
    }

    #[test]
    fn undecodable_frame_is_skipped() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let stats = Arc::clone(&mux.shared.stats);
        let channel = mux.open_channel().unwrap();

        // Result code with a body far too short to decode.
        let mut bad = Vec::new();
        bad.extend_from_slice(&8u32.to_be_bytes());
        bad.extend_from_slice(&217u32.to_be_bytes());
        bad.extend_from_slice(&channel.id().to_be_bytes());
        std::io::Write::write_all(peer.writer.get_mut(), &bad).unwrap();
        peer.reply(result_with(1), channel.id());

        let got = channel.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(stats.snapshot().protocol_errors, 1);
        assert!(mux.is_alive());
    }

    #[test]
    fn stalled_peer_fails_send_and_connection() {
        let config = BackendConfig::default().with_packet_config(
            PacketConfig::default().with_write_timeout(Some(Duration::from_millis(100))),
        );
        // The peer never reads, so the socket buffers fill up.
        let (mux, _peer) = connected(config);
        let channel = mux.open_channel().unwrap();
        let big = Message::from(DocumentSummary::new(
            GlobalId::default(),
            vec![0u8; 15 * 1024 * 1024],
        ));

        let started = Instant::now();
        assert!(!channel.send(&big).unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mux.shared.stats.snapshot().send_failures, 1);

        assert!(matches!(
            channel.receive(Duration::from_secs(5), 1),
            Err(BackendError::ConnectionLost(_))
        ));
        assert!(!mux.is_alive());
        assert!(!channel.send(&query()).unwrap());
    }

    #[test]
    fn connectionless_error_answers_oldest_query() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let first = mux.open_channel().unwrap();
        let second = mux.open_channel().unwrap();
        assert!(first.send(&query()).unwrap());
        assert!(second.send(&query()).unwrap());
        peer.recv();
        peer.recv();

        // The first query is answered normally, the second with an error.
        peer.reply(result_with(1), first.id());
        peer.reply(ErrorReply::new(7, "query timed out"), 0);

        let got = first.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got[0].code(), 217);
        let got = second.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got[0].as_error().map(|e| e.error_code), Some(7));
        assert_eq!(first.pending(), 0);
    }

    #[test]
    fn connectionless_error_without_request_is_dropped() {
        let (mux, mut peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();

        peer.reply(ErrorReply::new(7, "nobody asked"), 0);
        peer.reply(Message::Eol, 0);
        let err = channel.receive(Duration::from_millis(100), 1).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mux.shared.stats.snapshot().dropped_packets, 2);
    }

    #[derive(Debug, Default)]
    struct Recorder {
        received: Mutex<Vec<(Option<ChannelId>, u32)>>,
        undecodable: Mutex<Vec<usize>>,
    }

    impl PacketListener for Recorder {
        fn on_receive(&self, channel: Option<ChannelId>, message: &Message, _frame: &[u8]) {
            self.received.lock().unwrap().push((channel, message.code()));
        }

        fn on_decode_error(&self, frame: &[u8], _error: &PacketError) {
            self.undecodable.lock().unwrap().push(frame.len());
        }
    }

    #[test]
    fn listener_sees_dropped_and_undecodable_frames() {
        let recorder = Arc::new(Recorder::default());
        let config = BackendConfig::default().with_listener(recorder.clone());
        let (mux, mut peer) = connected(config);
        let channel = mux.open_channel().unwrap();

        peer.reply(result_with(1), 0xdead);
        let mut bad = Vec::new();
        bad.extend_from_slice(&8u32.to_be_bytes());
        bad.extend_from_slice(&217u32.to_be_bytes());
        bad.extend_from_slice(&channel.id().to_be_bytes());
        std::io::Write::write_all(peer.writer.get_mut(), &bad).unwrap();
        peer.reply(result_with(2), channel.id());

        channel.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(
            *recorder.received.lock().unwrap(),
            vec![(None, 217), (Some(channel.id()), 217)]
        );
        assert_eq!(*recorder.undecodable.lock().unwrap(), vec![12]);
    }

    #[test]
    fn large_compressed_reply_grows_receive_buffer() {
        let config = BackendConfig::default().with_receive_buffer_size(64);
        let (mux, mut peer) = connected(config);
        let channel = mux.open_channel().unwrap();

        peer.reply_compressed(result_with(200), channel.id());
        let got = channel.receive(Duration::from_secs(2), 1).unwrap();
        assert_eq!(got[0].document_count(), Some(200));
    }

    #[test]
    fn shutdown_closes_channels_and_joins_reader() {
        let (mux, _peer) = connected(BackendConfig::default());
        let channel = mux.open_channel().unwrap();
        mux.shutdown();
        mux.shutdown();

        assert!(!mux.is_alive());
        assert!(channel.is_closed());
        assert!(matches!(
            mux.open_channel(),
            Err(BackendError::NotConnected(_))
        ));
    }
}
