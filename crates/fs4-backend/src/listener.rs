//! Packet observation hooks.

use std::fmt::{self, Write as _};

use fs4_packet::{ChannelId, Message, PacketError};
use tracing::trace;

/// Observer notified of every packet sent and received on a connection.
///
/// Hooks run inline on the sending thread and on the reader thread, so they
/// must be quick. They cannot influence routing or delivery.
pub trait PacketListener: Send + Sync + fmt::Debug {
    /// Called after a frame has been written. `frame` is the exact wire bytes.
    fn on_send(&self, channel: ChannelId, message: &Message, frame: &[u8]) {
        let _ = (channel, message, frame);
    }

    /// Called for every decoded inbound frame. `channel` is the destination
    /// the frame was routed to, `None` if it was dropped: addressed to an
    /// unknown channel, or connectionless with no outstanding request.
    fn on_receive(&self, channel: Option<ChannelId>, message: &Message, frame: &[u8]) {
        let _ = (channel, message, frame);
    }

    /// Called for an inbound frame that failed to decode and was skipped.
    fn on_decode_error(&self, frame: &[u8], error: &PacketError) {
        let _ = (frame, error);
    }
}

/// Dumps every packet as a `trace` event, with a hex prefix of the frame.
#[derive(Debug, Clone)]
pub struct TracingListener {
    dump_bytes: usize,
}

impl TracingListener {
    pub fn new(dump_bytes: usize) -> Self {
        Self { dump_bytes }
    }
}

impl Default for TracingListener {
    fn default() -> Self {
        Self::new(32)
    }
}

impl PacketListener for TracingListener {
    fn on_send(&self, channel: ChannelId, message: &Message, frame: &[u8]) {
        trace!(
            direction = "send",
            channel,
            packet = message.name(),
            code = message.code(),
            len = frame.len(),
            bytes = %hex_prefix(frame, self.dump_bytes),
            "fs4 packet"
        );
    }

    fn on_receive(&self, channel: Option<ChannelId>, message: &Message, frame: &[u8]) {
        trace!(
            direction = "receive",
            channel = ?channel,
            packet = message.name(),
            code = message.code(),
            len = frame.len(),
            bytes = %hex_prefix(frame, self.dump_bytes),
            "fs4 packet"
        );
    }

    fn on_decode_error(&self, frame: &[u8], error: &PacketError) {
        trace!(
            direction = "receive",
            %error,
            len = frame.len(),
            bytes = %hex_prefix(frame, self.dump_bytes),
            "undecodable fs4 packet"
        );
    }
}

fn hex_prefix(bytes: &[u8], limit: usize) -> String {
    let shown = &bytes[..bytes.len().min(limit)];
    let mut out = String::with_capacity(shown.len() * 2 + 3);
    for byte in shown {
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > limit {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn hex_prefix_truncates() {
        assert_eq!(hex_prefix(&[0x00, 0xab, 0x10], 8), "00ab10");
        assert_eq!(hex_prefix(&[0x00, 0xab, 0x10], 2), "00ab...");
        assert_eq!(hex_prefix(&[], 4), "");
    }

    #[derive(Debug, Default)]
    struct Counting {
        seen: Mutex<Vec<u32>>,
    }

    impl PacketListener for Counting {
        fn on_receive(&self, _channel: Option<ChannelId>, message: &Message, _frame: &[u8]) {
            self.seen.lock().unwrap().push(message.code());
        }
    }

    #[test]
    fn default_hooks_are_no_ops() {
        let listener = Counting::default();
        listener.on_send(1, &Message::Eol, &[]);
        listener.on_receive(None, &Message::Eol, &[]);
        assert_eq!(*listener.seen.lock().unwrap(), vec![200]);

        listener.on_decode_error(&[], &PacketError::ConnectionClosed);

        let tracing = TracingListener::default();
        tracing.on_send(1, &Message::Eol, &[0, 0, 0, 4, 0, 0, 0, 200]);
        tracing.on_decode_error(&[0, 0, 0, 4], &PacketError::ConnectionClosed);
    }
}
