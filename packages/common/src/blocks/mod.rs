pub mod error;
pub mod filesystem;
pub mod memory;
pub mod traits;

pub use error::BlockStoreError;
pub use filesystem::FilesystemBlockStore;
pub use memory::MemoryBlockStore;
pub use traits::BlockStore;
