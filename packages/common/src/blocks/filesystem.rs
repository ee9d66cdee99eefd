use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use super::error::BlockStoreError;
use super::traits::BlockStore;
use crate::cid::Cid;

/// Filesystem-backed content-addressed block store.
///
/// Blocks are stored in a Git-style sharded directory layout:
/// `{base_path}/{first 2 hex chars}/{remaining 62 hex chars}`
pub struct FilesystemBlockStore {
    base_path: PathBuf,
    max_block_size: u64,
}

impl FilesystemBlockStore {
    pub async fn new(base_path: PathBuf, max_block_size: u64) -> Result<Self, BlockStoreError> {
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(base_path.join(".tmp")).await?;
        Ok(Self {
            base_path,
            max_block_size,
        })
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        self.base_path
            .join(cid.shard_prefix())
            .join(cid.shard_suffix())
    }

    /// Path for a temporary file during writes.
    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }
}

#[async_trait]
impl BlockStore for FilesystemBlockStore {
    async fn put(&self, data: &[u8]) -> Result<Cid, BlockStoreError> {
        if data.len() as u64 > self.max_block_size {
            return Err(BlockStoreError::SizeLimitExceeded {
                actual: data.len() as u64,
                limit: self.max_block_size,
            });
        }

        let cid = Cid::compute(data);
        let block_path = self.block_path(&cid);

        if block_path.exists() {
            return Ok(cid);
        }

        // Write to a temp file, then rename into place so readers never
        // observe a partially written block.
        let temp_path = self.temp_path();
        if let Err(e) = fs::write(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Some(parent) = block_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = fs::rename(&temp_path, &block_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockStoreError> {
        let block_path = self.block_path(cid);
        match fs::read(&block_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockStoreError::NotFound(cid.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        Ok(fs::try_exists(&self.block_path(cid)).await?)
    }

    async fn delete(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        match fs::remove_file(&self.block_path(cid)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, cid: &Cid) -> Result<u64, BlockStoreError> {
        match fs::metadata(&self.block_path(cid)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockStoreError::NotFound(cid.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn all_keys(&self) -> Result<Vec<Cid>, BlockStoreError> {
        let mut keys = Vec::new();

        let mut shards = fs::read_dir(&self.base_path).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let prefix = shard.file_name();
            let prefix = prefix.to_string_lossy();
            if prefix.len() != 2 {
                // skip .tmp and anything else that is not a shard dir
                continue;
            }

            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let hex = format!("{}{}", prefix, name.to_string_lossy());
                if let Ok(cid) = Cid::from_hex(&hex) {
                    keys.push(cid);
                }
            }
        }

        Ok(keys)
    }
}
