use std::str::FromStr;

use rpc::ChannelId;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One storage-provider commitment for one content.
///
/// `deal_id` stays 0 until the provider acknowledges the deal on-chain; a
/// nonzero value is terminal success for orchestration purposes. `failed`
/// plus `failed_at` are always written together.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deals")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub content_id: i64,
    /// Storage-provider address.
    pub provider: String,

    /// External deal id; 0 until the provider acknowledges.
    pub deal_id: i64,

    /// Transfer-channel token. Legacy push channels parse as a
    /// [`ChannelId`]; pull-style transfers record an opaque token.
    pub transfer_channel: Option<String>,
    pub proposal_cid: Option<String>,

    pub failed: bool,
    pub failed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A transfer channel is recorded but the provider has not acknowledged
    /// the deal yet.
    pub fn in_flight(&self) -> bool {
        !self.failed && self.deal_id == 0 && self.transfer_channel.is_some()
    }

    /// The legacy push-style channel id, if this deal uses one.
    ///
    /// Pull-style transfer tokens do not parse; those transfers are
    /// restarted by the storage provider, not by this engine.
    pub fn legacy_channel(&self) -> Option<ChannelId> {
        self.transfer_channel
            .as_deref()
            .and_then(|s| ChannelId::from_str(s).ok())
    }
}
