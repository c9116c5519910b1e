use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fs4_transport::Endpoint;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::mux::Multiplexer;
use crate::stats::{BackendStats, Counter, StatsSnapshot};

/// One search backend: owns the connection and hands out channels on it.
///
/// Connects lazily on the first channel request and reconnects on the next
/// request after the connection dies.
#[derive(Debug)]
pub struct Backend {
    endpoint: Endpoint,
    config: BackendConfig,
    stats: Arc<BackendStats>,
    connection: Mutex<Option<Arc<Multiplexer>>>,
    /// Serializes connect attempts without blocking `connection` readers.
    connecting: Mutex<()>,
    shut_down: AtomicBool,
}

impl Backend {
    pub fn new(endpoint: Endpoint, config: BackendConfig) -> Self {
        Self {
            endpoint,
            config,
            stats: Arc::default(),
            connection: Mutex::new(None),
            connecting: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn open_channel(&self) -> Result<Channel> {
        self.multiplexer()?.open_channel()
    }

    pub fn open_ping_channel(&self) -> Result<Channel> {
        self.multiplexer()?.open_ping_channel()
    }

    /// True if a live connection exists. Never connects.
    pub fn is_connected(&self) -> bool {
        self.connection()
            .as_ref()
            .is_some_and(|mux| mux.is_alive())
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Close all channels and the connection. Later requests fail with
    /// [`BackendError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = self.connection().take();
        if let Some(mux) = current {
            mux.shutdown();
        }
        debug!(endpoint = %self.endpoint, "backend shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn connection(&self) -> MutexGuard<'_, Option<Arc<Multiplexer>>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The live connection, if any. Takes and shuts down a dead one.
    fn live_connection(&self) -> Result<Option<Arc<Multiplexer>>> {
        let mut connection = self.connection();
        if self.is_shut_down() {
            return Err(BackendError::ShutDown);
        }
        if let Some(mux) = connection.as_ref().filter(|mux| mux.is_alive()) {
            return Ok(Some(Arc::clone(mux)));
        }
        let dead = connection.take();
        drop(connection);
        if let Some(dead) = dead {
            debug!(endpoint = %self.endpoint, "replacing dead connection");
            dead.shutdown();
        }
        Ok(None)
    }

    fn multiplexer(&self) -> Result<Arc<Multiplexer>> {
        if let Some(mux) = self.live_connection()? {
            return Ok(mux);
        }

        // One connect at a time; whoever waited here may find it done.
        let _connecting = self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mux) = self.live_connection()? {
            return Ok(mux);
        }

        let stream = match fs4_transport::connect(&self.endpoint, self.config.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                self.stats.bump(Counter::ConnectionFailure);
                warn!(endpoint = %self.endpoint, error = %err, "backend connect failed");
                return Err(err.into());
            }
        };
        let mux = Multiplexer::start(
            stream,
            self.endpoint.clone(),
            &self.config,
            Arc::clone(&self.stats),
        )?;

        let mut connection = self.connection();
        // Shutdown may have run while connecting.
        if self.is_shut_down() {
            drop(connection);
            mux.shutdown();
            return Err(BackendError::ShutDown);
        }
        self.stats.bump(Counter::ConnectionOpened);
        *connection = Some(Arc::clone(&mux));
        Ok(mux)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
