//! Per-job work areas
//!
//! Every conversion runs inside its own directory under the configured work
//! root. The directory is named after a fresh v4 UUID and removed when the
//! [`WorkArea`] guard is released or dropped, whichever comes first.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

use crate::error::{ConvertError, Result};

/// Allocation counters shared by all work areas of a manager
#[derive(Debug, Default)]
struct WorkAreaStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Allocates and tears down work areas under a single root directory
#[derive(Debug, Clone)]
pub struct WorkAreaManager {
    root: PathBuf,
    stats: Arc<WorkAreaStats>,
}

impl WorkAreaManager {
    /// Create the manager, creating `root` if needed
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            stats: Arc::new(WorkAreaStats::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh, empty work area
    pub async fn acquire(&self) -> Result<WorkArea> {
        let id = Uuid::new_v4();
        let path = self.root.join(id.to_string());

        // create_dir (not create_dir_all) so an existing directory is an error
        tokio::fs::create_dir(&path).await.map_err(|e| {
            ConvertError::Internal(format!(
                "Failed to allocate work area {}: {}",
                path.display(),
                e
            ))
        })?;

        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(work_area = %id, path = %path.display(), "Work area acquired");

        Ok(WorkArea {
            id,
            path,
            stats: Arc::clone(&self.stats),
            released: false,
        })
    }

    /// Release a work area. Never fails; problems are logged.
    pub async fn release(&self, area: WorkArea) {
        area.release().await;
    }

    /// Number of work areas handed out so far
    pub fn acquired(&self) -> usize {
        self.stats.acquired.load(Ordering::SeqCst)
    }

    /// Number of work areas torn down so far
    pub fn released(&self) -> usize {
        self.stats.released.load(Ordering::SeqCst)
    }

    /// Work areas currently alive
    pub fn active(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// Guard over one job's directory
#[derive(Debug)]
pub struct WorkArea {
    id: Uuid,
    path: PathBuf,
    stats: Arc<WorkAreaStats>,
    released: bool,
}

impl WorkArea {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file directly inside this work area
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it
    pub async fn release(mut self) {
        self.released = true;
        let result = tokio::fs::remove_dir_all(&self.path).await;
        self.finish(result);
    }

    fn finish(&self, result: io::Result<()>) {
        match result {
            Ok(()) => {
                tracing::debug!(work_area = %self.id, "Work area released");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(work_area = %self.id, "Work area already removed");
            }
            Err(e) => {
                tracing::warn!(
                    work_area = %self.id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove work area"
                );
            }
        }
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Drop can run on a runtime worker (e.g. a client abandoning the download),
        // so the blocking removal tells the scheduler to move other tasks off it
        let result = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| std::fs::remove_dir_all(&self.path))
            }
            _ => std::fs::remove_dir_all(&self.path),
        };
        self.finish(result);
    }
}
