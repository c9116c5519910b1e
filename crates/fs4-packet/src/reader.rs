use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use fs4_transport::Fs4Stream;
use tracing::debug;

use crate::codec::{extract_raw_frame, grown_capacity, Packet, PacketConfig, RawFrame};
use crate::error::{PacketError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete FS4 frames from any `Read` stream.
///
/// Handles partial reads internally: callers always get complete frames.
/// The receive buffer starts at `initial_buffer_size` and doubles whenever a
/// frame announces a larger size, up to `max_packet_size`.
pub struct PacketReader<T> {
    inner: T,
    buf: BytesMut,
    capacity: usize,
    config: PacketConfig,
}

impl<T: Read> PacketReader<T> {
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

    /// Read the next complete frame without decoding it (blocking).
    ///
    /// Returns `Err(PacketError::ConnectionClosed)` when EOF is reached, and
    /// `BufferTooSmall` when a frame exceeds `max_packet_size`; after the
    /// latter the stream is no longer aligned and must be dropped.
    pub fn read_raw(&mut self) -> Result<RawFrame> {
        loop {
            match extract_raw_frame(&mut self.buf, self.capacity) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(PacketError::BufferTooSmall { needed, .. }) => {
                    let max = self.config.max_packet_size;
                    let Some(capacity) = grown_capacity(self.capacity, needed, max) else {
                        return Err(PacketError::BufferTooSmall {
                            needed,
                            capacity: max,
                        });
                    };
                    debug!(from = self.capacity, to = capacity, "growing receive buffer");
                    self.capacity = capacity;
                    continue;
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(PacketError::Io(err)),
            };

            if read == 0 {
                return Err(PacketError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read and decode the next packet (blocking).
    ///
    /// A frame-local decode error (see [`PacketError::is_frame_local`])
    /// consumes only that frame; the next call continues with the next one.
    pub fn read_packet(&mut self) -> Result<Packet> {
        self.read_raw()?.decode()
    }

    /// Current receive buffer limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
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

impl PacketReader<Fs4Stream> {
    /// Create a packet reader for `Fs4Stream` and apply read timeout from config.
    pub fn with_config_stream(inner: Fs4Stream, config: PacketConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
