use std::time::Duration;

use fs4_packet::ChannelId;

/// Errors that can occur in channel, backend and pool operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport-level error, including failure to connect.
    #[error("transport error: {0}")]
    Transport(#[from] fs4_transport::TransportError),

    /// Packet encode/decode error.
    #[error("packet error: {0}")]
    Packet(#[from] fs4_packet::PacketError),

    /// `receive` did not collect enough messages before the deadline.
    #[error("channel {channel} timed out after {timeout:?}")]
    ChannelTimeout { channel: ChannelId, timeout: Duration },

    /// The channel is closed or was never opened on this connection.
    #[error("invalid channel {0}")]
    InvalidChannel(ChannelId),

    /// The connection died while the channel was waiting.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No usable connection to open a channel on.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The backend or pool has been shut down.
    #[error("backend shut down")]
    ShutDown,
}

impl BackendError {
    /// Timeouts are the only outcome a caller is expected to retry as-is.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::ChannelTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
