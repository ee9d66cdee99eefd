use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Minimum length of a base58 peer id; real ones are 46 or 52 characters.
const MIN_PEER_ID_LEN: usize = 32;

fn is_peer_id(s: &str) -> bool {
    s.len() >= MIN_PEER_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() && !matches!(b, b'0' | b'O' | b'I' | b'l'))
}

/// Identifier of a legacy (push-style) data-transfer channel.
///
/// Stored in the deal row as `{initiator}-{responder}-{transfer_id}`, where
/// both peers are base58 peer ids. Deals using pull-style transfers record an
/// opaque token instead, which does not parse as a `ChannelId` — that is how
/// the engine tells the two apart: only push channels are ours to restart.
/// Parsing requires the peer segments to actually look like peer ids, so a
/// token that merely ends in `-<digits>` is not misread as a push channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub initiator: String,
    pub responder: String,
    pub transfer_id: u64,
}

impl ChannelId {
    pub fn new(
        initiator: impl Into<String>,
        responder: impl Into<String>,
        transfer_id: u64,
    ) -> Self {
        Self {
            initiator: initiator.into(),
            responder: responder.into(),
            transfer_id,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.initiator, self.responder, self.transfer_id
        )
    }
}

impl FromStr for ChannelId {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '-');

        let transfer_id = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| RpcError::InvalidChannelId(s.into()))?;
        let responder = parts
            .next()
            .filter(|p| is_peer_id(p))
            .ok_or_else(|| RpcError::InvalidChannelId(s.into()))?;
        let initiator = parts
            .next()
            .filter(|p| is_peer_id(p))
            .ok_or_else(|| RpcError::InvalidChannelId(s.into()))?;

        Ok(Self {
            initiator: initiator.into(),
            responder: responder.into(),
            transfer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_A: &str = "12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA";
    const PEER_B: &str = "12D3KooWGRYbzvQu8sVxkBFTDQksGtXtMzCDGiQcEdyQ1WMAVmrp";

    #[test]
    fn display_parse_round_trip() {
        let chan = ChannelId::new(PEER_A, PEER_B, 42);
        let parsed: ChannelId = chan.to_string().parse().unwrap();
        assert_eq!(parsed, chan);
    }

    #[test]
    fn rejects_pull_transfer_tokens() {
        // Pull transfers record opaque tokens, e.g. a UUID.
        assert!(ChannelId::from_str("e2f7c3f0-13ce-4d07-9a43-0fd0c1f23c41").is_err());
        assert!(ChannelId::from_str("").is_err());
        assert!(ChannelId::from_str("no-transfer-id-here").is_err());
        // A token ending in digits is still not a push channel unless both
        // peer segments look like peer ids.
        assert!(ChannelId::from_str("no-5").is_err());
        assert!(ChannelId::from_str(&format!("{PEER_A}-short-5")).is_err());
        assert!(ChannelId::from_str("e2f7c3f0-13ce-4d07-9a43-123456789012").is_err());
    }
}
