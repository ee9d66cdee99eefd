use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid transfer channel id: {0}")]
    InvalidChannelId(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
