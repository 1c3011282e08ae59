//! Application state management

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::convert::{BackendInvoker, BackendTable, WorkAreaManager};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to prepare work directory {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    backends: BackendTable,
    work_areas: WorkAreaManager,
    invoker: BackendInvoker,
    conversion_permits: Semaphore,
}

impl AppState {
    /// Create a new application state
    ///
    /// Builds the routing table and makes sure the work root exists.
    pub async fn new(config: Config) -> Result<Self, StateError> {
        let work_areas = WorkAreaManager::new(&config.server.work_dir)
            .await
            .map_err(|source| StateError::WorkDir {
                path: config.server.work_dir.display().to_string(),
                source,
            })?;

        let backends = BackendTable::from_config(&config.backends);
        let invoker = BackendInvoker::new(config.limits.max_diagnostic_bytes);
        let conversion_permits = Semaphore::new(config.limits.max_concurrent_conversions.max(1));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                backends,
                work_areas,
                invoker,
                conversion_permits,
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the routing table
    pub fn backends(&self) -> &BackendTable {
        &self.inner.backends
    }

    /// Get the work area manager
    pub fn work_areas(&self) -> &WorkAreaManager {
        &self.inner.work_areas
    }

    pub fn invoker(&self) -> &BackendInvoker {
        &self.inner.invoker
    }

    /// Ceiling on concurrently running backends
    pub fn conversion_permits(&self) -> &Semaphore {
        &self.inner.conversion_permits
    }
}
