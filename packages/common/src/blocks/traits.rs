use async_trait::async_trait;

use super::error::BlockStoreError;
use crate::cid::Cid;

/// Content-addressed block storage.
///
/// Reference accounting lives in the database (Object/ObjRef rows); the
/// store itself only knows about raw blocks keyed by CID.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block and return its CID.
    async fn put(&self, data: &[u8]) -> Result<Cid, BlockStoreError>;

    /// Retrieve the bytes of a block.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockStoreError>;

    /// Check whether a block is present.
    async fn has(&self, cid: &Cid) -> Result<bool, BlockStoreError>;

    /// Delete a block.
    ///
    /// Returns `true` if the block was deleted, `false` if it did not exist.
    async fn delete(&self, cid: &Cid) -> Result<bool, BlockStoreError>;

    /// Size of a block in bytes.
    async fn size(&self, cid: &Cid) -> Result<u64, BlockStoreError>;

    /// Enumerate every CID physically present in the store.
    ///
    /// Used by the garbage collector; the snapshot is not required to be
    /// consistent with concurrent writes.
    async fn all_keys(&self) -> Result<Vec<Cid>, BlockStoreError>;
}
