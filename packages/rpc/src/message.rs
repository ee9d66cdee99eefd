use chrono::{DateTime, Utc};
use common::Cid;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::RpcError;

/// Status of a data transfer as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferStatus {
    Requested,
    Ongoing,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TransferStatus {
    /// Whether the transfer has reached a terminal state.
    pub fn terminated(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed { .. } | TransferStatus::Cancelled
        )
    }
}

/// A command sent from the control plane to a shuttle (or executed locally
/// when the target location is the local node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum Command {
    /// Pin the given content on the shuttle.
    AddContent {
        content_id: i64,
        cid: Cid,
        owner: i64,
    },
    /// Unpin and forget the given content.
    RemoveContent { content_id: i64 },
    /// Restart a legacy push-style transfer.
    RestartTransfer { channel_id: ChannelId },
}

impl Command {
    /// Operation tag, used for logging and error reporting.
    pub fn op(&self) -> &'static str {
        match self {
            Command::AddContent { .. } => "AddContent",
            Command::RemoveContent { .. } => "RemoveContent",
            Command::RestartTransfer { .. } => "RestartTransfer",
        }
    }

    pub fn to_wire(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self, RpcError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Heartbeat payload carrying shuttle identity and reachability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub handle: String,
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

/// One block pinned as part of a content's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedObject {
    pub cid: Cid,
    pub size: i64,
}

/// A message received from a shuttle: either an event or the outcome of a
/// previously sent command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum Message {
    Heartbeat(Heartbeat),
    /// A pin completed successfully on the shuttle.
    PinComplete {
        content_id: i64,
        size: i64,
        objects: Vec<PinnedObject>,
    },
    /// A pin failed terminally on the shuttle.
    PinFailed { content_id: i64, reason: String },
    /// Transfer status report for a deal's channel.
    TransferStatus {
        deal_id: i64,
        channel_id: ChannelId,
        status: TransferStatus,
    },
    /// A command could not be executed; carries the op tag and a description.
    CommandError { op: String, error: String },
}

impl Message {
    pub fn op(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "Heartbeat",
            Message::PinComplete { .. } => "PinComplete",
            Message::PinFailed { .. } => "PinFailed",
            Message::TransferStatus { .. } => "TransferStatus",
            Message::CommandError { .. } => "CommandError",
        }
    }

    pub fn to_wire(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self, RpcError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape() {
        let cmd = Command::RestartTransfer {
            channel_id: ChannelId::new("a", "b", 3),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "RestartTransfer");
        assert_eq!(json["params"]["channel_id"]["transfer_id"], 3);
    }

    #[test]
    fn message_wire_shape() {
        let msg = Message::PinFailed {
            content_id: 9,
            reason: "unfetchable".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "PinFailed");
        assert_eq!(json["params"]["content_id"], 9);
    }

    #[test]
    fn wire_round_trip() {
        let msg = Message::TransferStatus {
            deal_id: 5,
            channel_id: ChannelId::new("a", "b", 7),
            status: TransferStatus::Ongoing,
        };
        let decoded = Message::from_wire(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, msg);

        assert!(matches!(
            Message::from_wire("{not json"),
            Err(RpcError::Serialization(_))
        ));
    }

    #[test]
    fn transfer_status_terminality() {
        assert!(!TransferStatus::Requested.terminated());
        assert!(!TransferStatus::Ongoing.terminated());
        assert!(TransferStatus::Completed.terminated());
        assert!(TransferStatus::Cancelled.terminated());
        assert!(
            TransferStatus::Failed {
                reason: "rejected".into()
            }
            .terminated()
        );
    }
}
