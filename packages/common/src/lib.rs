pub mod blocks;
pub mod cid;
pub mod retry;

pub use cid::Cid;
