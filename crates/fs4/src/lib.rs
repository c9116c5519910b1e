//! Client for the FS4 binary protocol spoken by search backends.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP connections and endpoints
//! - [`packet`]: framing, LZ4 body compression and typed packet decoding
//! - [`backend`]: channel multiplexing, backends and the backend pool
//!
//! The `async` feature adds a `tokio_util::codec` implementation of the
//! framing in [`packet::async_codec`].

/// Re-export transport types.
pub mod transport {
    pub use fs4_transport::*;
}

/// Re-export packet types.
pub mod packet {
    pub use fs4_packet::*;
}

/// Re-export backend types.
pub mod backend {
    pub use fs4_backend::*;
}
