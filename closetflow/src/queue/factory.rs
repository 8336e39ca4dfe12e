//! Construction of per-queue backing stores.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{FileQueueStore, MemoryQueueStore, QueueStore};
use crate::errors::Result;

/// Opens the backing store of a named queue.
#[async_trait]
pub trait QueueStoreFactory: Send + Sync {
    /// Opens (or creates) the store of `queue`.
    async fn open(&self, queue: &str) -> Result<Arc<dyn QueueStore>>;
}

/// Volatile stores; jobs are lost on restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStoreFactory;

#[async_trait]
impl QueueStoreFactory for MemoryStoreFactory {
    async fn open(&self, _queue: &str) -> Result<Arc<dyn QueueStore>> {
        Ok(Arc::new(MemoryQueueStore::new()))
    }
}

/// One JSON file per queue under a directory.
#[derive(Debug, Clone)]
pub struct FileStoreFactory {
    dir: PathBuf,
}

impl FileStoreFactory {
    /// Creates a factory writing under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the queue files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `queue`.
    #[must_use]
    pub fn path_for(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{queue}.json"))
    }
}

#[async_trait]
impl QueueStoreFactory for FileStoreFactory {
    async fn open(&self, queue: &str) -> Result<Arc<dyn QueueStore>> {
        Ok(Arc::new(FileQueueStore::open(self.path_for(queue)).await?))
    }
}
