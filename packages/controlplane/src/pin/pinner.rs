use std::sync::Arc;

use async_trait::async_trait;
use common::Cid;
use common::blocks::BlockStore;
use tracing::debug;

use super::{PinError, PinJob, PinWorker};
use crate::repo::ObjectRepo;

/// A block retrieved from the network, addressed by the CID the remote
/// claims for it. Claims are verified before anything is persisted.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub cid: Cid,
    pub data: Vec<u8>,
}

/// Retrieves the full block graph for a root CID from the network.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_graph(&self, root: &Cid) -> Result<Vec<FetchedBlock>, PinError>;
}

/// Default pin worker: fetch the graph, verify every block against its
/// CID, persist blocks, then record object references.
pub struct Pinner {
    fetcher: Arc<dyn ContentFetcher>,
    store: Arc<dyn BlockStore>,
    objects: Arc<dyn ObjectRepo>,
}

impl Pinner {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        store: Arc<dyn BlockStore>,
        objects: Arc<dyn ObjectRepo>,
    ) -> Self {
        Self {
            fetcher,
            store,
            objects,
        }
    }
}

#[async_trait]
impl PinWorker for Pinner {
    async fn execute(&self, job: &PinJob) -> Result<i64, PinError> {
        let blocks = self.fetcher.fetch_graph(&job.cid).await?;

        if blocks.is_empty() {
            return Err(PinError::Validation(format!(
                "empty graph for root {}",
                job.cid
            )));
        }
        if !blocks.iter().any(|b| b.cid == job.cid) {
            return Err(PinError::Validation(format!(
                "fetched graph does not contain root {}",
                job.cid
            )));
        }

        let mut total_size = 0i64;
        let mut recorded = Vec::with_capacity(blocks.len());

        for block in &blocks {
            if Cid::compute(&block.data) != block.cid {
                return Err(PinError::Validation(format!(
                    "block does not hash to claimed cid {}",
                    block.cid
                )));
            }
            self.store.put(&block.data).await?;
            total_size += block.data.len() as i64;
            recorded.push((block.cid, block.data.len() as i64));
        }

        self.objects.add_objects(job.content_id, &recorded).await?;

        debug!(
            content_id = job.content_id,
            blocks = recorded.len(),
            size = total_size,
            "Pinned content"
        );
        Ok(total_size)
    }
}

#[cfg(test)]
mod tests {
    use common::blocks::MemoryBlockStore;

    use super::*;
    use crate::repo::memory::MemoryRepos;

    struct StaticFetcher {
        blocks: Vec<FetchedBlock>,
    }

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch_graph(&self, _root: &Cid) -> Result<Vec<FetchedBlock>, PinError> {
            Ok(self.blocks.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl ContentFetcher for FailingFetcher {
        async fn fetch_graph(&self, _root: &Cid) -> Result<Vec<FetchedBlock>, PinError> {
            Err(PinError::Fetch("connection reset".into()))
        }
    }

    fn block(data: &[u8]) -> FetchedBlock {
        FetchedBlock {
            cid: Cid::compute(data),
            data: data.to_vec(),
        }
    }

    fn job_for(root: &FetchedBlock) -> PinJob {
        PinJob {
            content_id: 1,
            owner: 1,
            cid: root.cid,
        }
    }

    #[tokio::test]
    async fn stores_blocks_and_records_objects() {
        let root = block(b"root node");
        let leaf = block(b"leaf node");
        let store = Arc::new(MemoryBlockStore::new());
        let repos = Arc::new(MemoryRepos::new());
        let pinner = Pinner::new(
            Arc::new(StaticFetcher {
                blocks: vec![root.clone(), leaf.clone()],
            }),
            store.clone(),
            repos.clone(),
        );

        let size = pinner.execute(&job_for(&root)).await.unwrap();

        assert_eq!(size, (root.data.len() + leaf.data.len()) as i64);
        assert!(store.has(&root.cid).await.unwrap());
        assert!(store.has(&leaf.cid).await.unwrap());
        assert!(repos.is_referenced(&root.cid).await.unwrap());
        assert!(repos.is_referenced(&leaf.cid).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_block_fails_validation() {
        let root = block(b"root");
        let mut corrupt = block(b"good bytes");
        corrupt.data = b"tampered bytes".to_vec();

        let store = Arc::new(MemoryBlockStore::new());
        let pinner = Pinner::new(
            Arc::new(StaticFetcher {
                blocks: vec![root.clone(), corrupt],
            }),
            store.clone(),
            Arc::new(MemoryRepos::new()),
        );

        let err = pinner.execute(&job_for(&root)).await.unwrap_err();
        assert!(matches!(err, PinError::Validation(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn missing_root_fails_validation() {
        let root = block(b"the root");
        let unrelated = block(b"unrelated");

        let pinner = Pinner::new(
            Arc::new(StaticFetcher {
                blocks: vec![unrelated],
            }),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryRepos::new()),
        );

        let err = pinner.execute(&job_for(&root)).await.unwrap_err();
        assert!(matches!(err, PinError::Validation(_)));
    }

    #[tokio::test]
    async fn fetch_error_is_retryable() {
        let root = block(b"whatever");
        let pinner = Pinner::new(
            Arc::new(FailingFetcher),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryRepos::new()),
        );

        let err = pinner.execute(&job_for(&root)).await.unwrap_err();
        assert!(err.retryable());
    }
}
