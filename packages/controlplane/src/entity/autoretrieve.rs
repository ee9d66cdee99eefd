use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// An autoretrieve server that announces our content to the indexer so
/// clients can fetch it over bitswap without touching this node.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "autoretrieves")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub handle: String,
    pub token: String,

    pub last_heartbeat: Option<DateTimeUtc>,

    pub peer_id: String,
    /// JSON-encoded multiaddress list.
    pub addresses: String,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
