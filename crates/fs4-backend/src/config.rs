use std::sync::Arc;
use std::time::Duration;

use fs4_packet::{CompressionConfig, PacketConfig, DEFAULT_BUFFER_SIZE};

use crate::listener::PacketListener;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for one backend connection.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Framing, compression and write-timeout settings. The read timeout is
    /// ignored: the reader thread blocks until data or shutdown.
    pub packet: PacketConfig,
    pub connect_timeout: Duration,
    /// Initial receive buffer; doubled on demand up to `packet.max_packet_size`.
    pub receive_buffer_size: usize,
    /// Optional packet observer.
    pub listener: Option<Arc<dyn PacketListener>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            packet: PacketConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            listener: None,
        }
    }
}

impl BackendConfig {
    pub fn with_packet_config(mut self, packet: PacketConfig) -> Self {
        self.packet = packet;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.packet.compression = compression;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PacketListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Packet settings for the reader side of a connection.
    pub(crate) fn reader_config(&self) -> PacketConfig {
        self.packet
            .clone()
            .with_initial_buffer_size(self.receive_buffer_size)
            .with_read_timeout(None)
    }
}

/// Configuration shared by every backend a pool creates.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub backend: BackendConfig,
}

impl PoolConfig {
    pub fn with_backend_config(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::TracingListener;

    #[test]
    fn defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.receive_buffer_size, 8 * 1024);
        assert!(cfg.listener.is_none());
        assert!(!cfg.packet.compression.is_enabled());
    }

    #[test]
    fn reader_config_uses_receive_buffer_and_no_timeout() {
        let cfg = BackendConfig::default()
            .with_packet_config(
                PacketConfig::default().with_read_timeout(Some(Duration::from_millis(5))),
            )
            .with_receive_buffer_size(512)
            .with_compression(CompressionConfig::lz4(1024))
            .with_listener(Arc::new(TracingListener::default()));

        let reader = cfg.reader_config();
        assert_eq!(reader.initial_buffer_size, 512);
        assert_eq!(reader.read_timeout, None);
        assert_eq!(reader.compression.limit, 1024);
        assert!(cfg.listener.is_some());
    }
}
