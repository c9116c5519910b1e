//! TCP transport for FS4 search-backend connections.
//!
//! This is the lowest layer of the fs4 workspace. Everything else builds on
//! top of the [`Fs4Stream`] type provided here:
//! - [`Endpoint`] names a backend (`host:port`) and keys the backend pool
//! - [`connect`] opens a stream with a connect timeout
//! - [`Fs4Listener`] accepts streams, mostly for mock backends in tests

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use stream::Fs4Stream;
pub use tcp::{connect, Fs4Listener};
