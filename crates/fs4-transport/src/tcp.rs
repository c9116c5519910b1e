use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::Fs4Stream;

/// Connect to a backend endpoint (blocking), trying each resolved address.
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Fs4Stream> {
    let mut last_err = None;
    for addr in endpoint.resolve()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!(%endpoint, %addr, "connected to backend");
                return Fs4Stream::from_tcp(stream);
            }
            Err(err) => {
                debug!(%endpoint, %addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(TransportError::Connect {
        endpoint: endpoint.clone(),
        source: last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
        }),
    })
}

/// TCP listener handing out [`Fs4Stream`]s.
///
/// The client side never listens; this exists for mock backends and tests.
pub struct Fs4Listener {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl Fs4Listener {
    /// Bind and listen. Port 0 picks an ephemeral port; see [`Self::local_endpoint`].
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = TcpListener::bind((endpoint.host(), endpoint.port())).map_err(|e| {
            TransportError::Bind {
                endpoint: endpoint.clone(),
                source: e,
            }
        })?;
        let local = listener.local_addr().map_err(|e| TransportError::Bind {
            endpoint: endpoint.clone(),
            source: e,
        })?;
        let endpoint = Endpoint::from(local);

        info!(%endpoint, "listening for fs4 connections");

        Ok(Self { listener, endpoint })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<Fs4Stream> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%addr, "accepted connection");
        Fs4Stream::from_tcp(stream)
    }

    /// The endpoint actually bound, with the ephemeral port resolved.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
