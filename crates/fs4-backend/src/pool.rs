use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fs4_transport::Endpoint;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::channel::Channel;
use crate::config::PoolConfig;
use crate::error::{BackendError, Result};
use crate::stats::StatsSnapshot;

/// Shares one [`Backend`] per endpoint across all callers.
#[derive(Debug, Default)]
pub struct BackendPool {
    config: PoolConfig,
    backends: RwLock<HashMap<Endpoint, Arc<Backend>>>,
    shut_down: AtomicBool,
}

/// Statistics for every backend in a pool, plus their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub total: StatsSnapshot,
    pub backends: BTreeMap<String, StatsSnapshot>,
}

impl BackendPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            backends: RwLock::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The backend for `endpoint`, created on first use. Creating a backend
    /// does not connect it.
    pub fn backend(&self, endpoint: &Endpoint) -> Result<Arc<Backend>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BackendError::ShutDown);
        }
        if let Some(backend) = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
        {
            return Ok(Arc::clone(backend));
        }

        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the write lock: shutdown may have drained the map.
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BackendError::ShutDown);
        }
        let backend = backends.entry(endpoint.clone()).or_insert_with(|| {
            debug!(%endpoint, "adding backend to pool");
            Arc::new(Backend::new(endpoint.clone(), self.config.backend.clone()))
        });
        Ok(Arc::clone(backend))
    }

    pub fn open_channel(&self, endpoint: &Endpoint) -> Result<Channel> {
        self.backend(endpoint)?.open_channel()
    }

    pub fn open_ping_channel(&self, endpoint: &Endpoint) -> Result<Channel> {
        self.backend(endpoint)?.open_ping_channel()
    }

    pub fn len(&self) -> usize {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn statistics(&self) -> PoolStatistics {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = PoolStatistics::default();
        for (endpoint, backend) in backends.iter() {
            let snapshot = backend.statistics();
            stats.total += snapshot;
            stats.backends.insert(endpoint.to_string(), snapshot);
        }
        stats
    }

    /// Shut down every backend. Later requests fail with [`BackendError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, backend)| backend)
            .collect();
        for backend in &drained {
            backend.shutdown();
        }
        info!(backends = drained.len(), "backend pool shut down");
    }
}

impl Drop for BackendPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
