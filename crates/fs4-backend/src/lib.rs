//! Channel multiplexing and connection pooling for FS4 search backends.
//!
//! A [`Backend`] owns one TCP connection and a reader thread that routes
//! inbound packets to [`Channel`] inboxes. A [`BackendPool`] shares one
//! backend per endpoint across callers.

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod listener;
pub mod mux;
pub mod pool;
pub mod stats;

pub use backend::Backend;
pub use channel::{Channel, ChannelKind, ChannelState};
pub use config::{BackendConfig, PoolConfig, DEFAULT_CONNECT_TIMEOUT};
pub use error::{BackendError, Result};
pub use listener::{PacketListener, TracingListener};
pub use mux::Multiplexer;
pub use pool::{BackendPool, PoolStatistics};
pub use stats::{BackendStats, StatsSnapshot};
