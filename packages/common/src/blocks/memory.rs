use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::BlockStoreError;
use super::traits::BlockStore;
use crate::cid::Cid;

/// In-memory block store for tests and ephemeral staging.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, data: &[u8]) -> Result<Cid, BlockStoreError> {
        let cid = Cid::compute(data);
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cid, data.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockStoreError> {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .cloned()
            .ok_or_else(|| BlockStoreError::NotFound(cid.to_hex()))
    }

    async fn has(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(cid))
    }

    async fn delete(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cid)
            .is_some())
    }

    async fn size(&self, cid: &Cid) -> Result<u64, BlockStoreError> {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .map(|b| b.len() as u64)
            .ok_or_else(|| BlockStoreError::NotFound(cid.to_hex()))
    }

    async fn all_keys(&self) -> Result<Vec<Cid>, BlockStoreError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_delete() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"data").await.unwrap();
        assert!(store.has(&cid).await.unwrap());
        assert_eq!(store.get(&cid).await.unwrap(), b"data");
        assert_eq!(store.size(&cid).await.unwrap(), 4);

        assert!(store.delete(&cid).await.unwrap());
        assert!(!store.has(&cid).await.unwrap());
        assert!(!store.delete(&cid).await.unwrap());
    }
}
