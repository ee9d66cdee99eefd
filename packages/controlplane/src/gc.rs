use std::sync::Arc;

use common::blocks::{BlockStore, BlockStoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::repo::{ObjectRepo, RepoError};

#[derive(Debug, Error)]
pub enum GcError {
    #[error("block store error: {0}")]
    Store(#[from] BlockStoreError),

    #[error("repository error: {0}")]
    Db(#[from] RepoError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub scanned: usize,
    pub deleted: usize,
    pub reclaimed_bytes: u64,
}

/// Best-effort sweep of the local block store.
///
/// Every key with no Object row is deleted. There is deliberately no lock
/// between the reference check and the delete: a pin racing the sweep may
/// lose a block it just wrote, and repairs that by re-writing it. Taking
/// that small risk beats locking the store against all writers for the
/// duration of a sweep.
pub struct GarbageCollector {
    store: Arc<dyn BlockStore>,
    objects: Arc<dyn ObjectRepo>,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn BlockStore>, objects: Arc<dyn ObjectRepo>) -> Self {
        Self { store, objects }
    }

    pub async fn run(&self) -> Result<GcStats, GcError> {
        let keys = self.store.all_keys().await?;
        let mut stats = GcStats::default();

        for cid in keys {
            stats.scanned += 1;

            match self.objects.is_referenced(&cid).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(%cid, error = %e, "Reference check failed, keeping block");
                    continue;
                }
            }

            let size = self.store.size(&cid).await.unwrap_or(0);
            match self.store.delete(&cid).await {
                Ok(true) => {
                    stats.deleted += 1;
                    stats.reclaimed_bytes += size;
                }
                // Already gone; someone else reclaimed it.
                Ok(false) => {}
                Err(e) => warn!(%cid, error = %e, "Block delete failed"),
            }
        }

        info!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            reclaimed_bytes = stats.reclaimed_bytes,
            "Garbage collection finished"
        );
        Ok(stats)
    }
}
