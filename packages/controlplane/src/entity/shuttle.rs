use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A remote agent node holding a local shard of content.
///
/// A shuttle is online iff a heartbeat arrived within the configured
/// liveness window.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shuttles")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub handle: String,
    pub token: String,

    pub last_heartbeat: Option<DateTimeUtc>,
    /// Closed shuttles are drained and never receive new content.
    pub open: bool,

    pub peer_id: String,
    /// JSON-encoded multiaddress list from the last heartbeat.
    pub addresses: String,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn online(&self, now: DateTime<Utc>, liveness_window: chrono::Duration) -> bool {
        self.last_heartbeat
            .map(|hb| now - hb < liveness_window)
            .unwrap_or(false)
    }
}
