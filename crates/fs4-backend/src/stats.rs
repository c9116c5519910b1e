use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters a backend bumps as it works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    ConnectionOpened,
    ConnectionFailure,
    ChannelOpened,
    ChannelTimeout,
    PacketSent,
    PacketReceived,
    SendFailure,
    DroppedPacket,
    ProtocolError,
}

/// Live per-backend counters, shared with the connection's reader thread.
///
/// Purely observational: nothing in the client makes decisions on them.
#[derive(Debug, Default)]
pub struct BackendStats {
    connections_opened: AtomicU64,
    connection_failures: AtomicU64,
    channels_opened: AtomicU64,
    channel_timeouts: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_failures: AtomicU64,
    dropped_packets: AtomicU64,
    protocol_errors: AtomicU64,
}

impl BackendStats {
    pub(crate) fn bump(&self, counter: Counter) {
        let cell = match counter {
            Counter::ConnectionOpened => &self.connections_opened,
            Counter::ConnectionFailure => &self.connection_failures,
            Counter::ChannelOpened => &self.channels_opened,
            Counter::ChannelTimeout => &self.channel_timeouts,
            Counter::PacketSent => &self.packets_sent,
            Counter::PacketReceived => &self.packets_received,
            Counter::SendFailure => &self.send_failures,
            Counter::DroppedPacket => &self.dropped_packets,
            Counter::ProtocolError => &self.protocol_errors,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channel_timeouts: self.channel_timeouts.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BackendStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connection_failures: u64,
    pub channels_opened: u64,
    pub channel_timeouts: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_failures: u64,
    pub dropped_packets: u64,
    pub protocol_errors: u64,
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.connections_opened += other.connections_opened;
        self.connection_failures += other.connection_failures;
        self.channels_opened += other.channels_opened;
        self.channel_timeouts += other.channel_timeouts;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.send_failures += other.send_failures;
        self.dropped_packets += other.dropped_packets;
        self.protocol_errors += other.protocol_errors;
    }
}
