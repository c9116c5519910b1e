use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use fs4_transport::Fs4Stream;
use tracing::debug;

use crate::codec::{encode_packet, grown_capacity, ChannelId, EncodeSummary, PacketConfig};
use crate::error::{PacketError, Result};
use crate::message::Message;

/// Writes complete FS4 frames to any `Write` stream.
///
/// The encode buffer starts at `initial_buffer_size`; a packet that does not
/// fit is re-encoded into a buffer of double size, up to `max_packet_size`.
pub struct PacketWriter<T> {
    inner: T,
    buf: BytesMut,
    capacity: usize,
    config: PacketConfig,
}

impl<T: Write> PacketWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, PacketConfig::default())
    }

    pub fn with_config(inner: T, config: PacketConfig) -> Self {
        let capacity = config.starting_capacity();
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            config,
        }
    }

    /// Encode and send one packet (blocking).
    ///
    /// `channel` is ignored for connectionless packet types.
    pub fn send(&mut self, message: &Message, channel: ChannelId) -> Result<EncodeSummary> {
        let summary = self.encode(message, channel)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(PacketError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // A write timeout surfaces as WouldBlock or TimedOut; either
                // means the peer stopped reading.
                Err(err) => return Err(PacketError::Io(err)),
            }
        }

        self.flush()?;
        Ok(summary)
    }

    fn encode(&mut self, message: &Message, channel: ChannelId) -> Result<EncodeSummary> {
        loop {
            self.buf.clear();
            match encode_packet(
                message,
                channel,
                &self.config.compression,
                &mut self.buf,
                self.capacity,
            ) {
                Ok(summary) => return Ok(summary),
                Err(PacketError::BufferTooSmall { needed, .. }) => {
                    let max = self.config.max_packet_size;
                    let Some(capacity) = grown_capacity(self.capacity, needed, max) else {
                        return Err(PacketError::BufferTooSmall {
                            needed,
                            capacity: max,
                        });
                    };
                    debug!(
                        packet = message.name(),
                        from = self.capacity,
                        to = capacity,
                        "growing encode buffer"
                    );
                    self.capacity = capacity;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bytes of the most recently encoded frame, as written to the wire.
    pub fn last_frame(&self) -> &[u8] {
        &self.buf
    }

    /// Current encode buffer limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(PacketError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &PacketConfig {
        &self.config
    }
}

impl PacketWriter<Fs4Stream> {
    /// Create a packet writer for `Fs4Stream` and apply write timeout from config.
    pub fn with_config_stream(inner: Fs4Stream, config: PacketConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
