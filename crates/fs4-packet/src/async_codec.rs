//! `tokio_util::codec` adapter for FS4 framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::codec::{
    encode_packet, extract_raw_frame, grown_capacity, ChannelId, Packet, PacketConfig,
};
use crate::error::PacketError;
use crate::message::Message;

/// A packet to encode, with the channel id for channel-carrying types.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    pub channel: ChannelId,
    pub message: Message,
}

impl OutboundPacket {
    pub fn new(channel: ChannelId, message: impl Into<Message>) -> Self {
        Self {
            channel,
            message: message.into(),
        }
    }
}

/// Stateful FS4 decoder/encoder for `Framed` streams.
///
/// Frames that fail to decode but leave the stream aligned are logged and
/// skipped, so one bad packet does not end the stream.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    capacity: usize,
    config: PacketConfig,
}

impl PacketCodec {
    pub fn new(config: PacketConfig) -> Self {
        Self {
            capacity: config.starting_capacity(),
            config,
        }
    }

    pub fn config(&self) -> &PacketConfig {
        &self.config
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(PacketConfig::default())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let frame = match extract_raw_frame(src, self.capacity) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
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
            };

            match frame.decode() {
                Ok(packet) => return Ok(Some(packet)),
                Err(err) if err.is_frame_local() => {
                    warn!(
                        code = frame.packet_code(),
                        error = %err,
                        "skipping undecodable packet"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Encoder<OutboundPacket> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: OutboundPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_packet(
            &item.message,
            item.channel,
            &self.config.compression,
            dst,
            self.config.max_packet_size,
        )?;
        Ok(())
    }
}
