pub mod channel;
pub mod error;
pub mod message;

pub use channel::ChannelId;
pub use error::RpcError;
pub use message::{Command, Heartbeat, Message, PinnedObject, TransferStatus};
