pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Cid;
use thiserror::Error;

use crate::entity::{autoretrieve, content, deal, shuttle};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, i64),
}

/// Fields for a new content record; lifecycle flags start as pinning.
#[derive(Debug, Clone)]
pub struct NewContent {
    pub cid: Cid,
    pub name: String,
    pub owner: i64,
    pub size: i64,
    pub replication: i32,
    pub location: String,
}

/// Fields for a freshly proposed deal; `deal_id` starts at 0.
#[derive(Debug, Clone)]
pub struct NewDeal {
    pub content_id: i64,
    pub provider: String,
    pub proposal_cid: Option<String>,
    pub transfer_channel: Option<String>,
}

/// Typed CRUD over content records. The repository is the source of truth
/// for all lifecycle state; callers never cache transitions.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    async fn create(&self, new: NewContent) -> Result<content::Model, RepoError>;

    async fn get(&self, id: i64) -> Result<Option<content::Model>, RepoError>;

    /// pinning -> active; records the verified size.
    async fn mark_active(&self, id: i64, size: i64) -> Result<(), RepoError>;

    /// pinning -> failed (terminal).
    async fn mark_failed(&self, id: i64) -> Result<(), RepoError>;

    /// Explicit soft delete; blocks are reclaimed later by the GC.
    async fn soft_delete(&self, id: i64) -> Result<(), RepoError>;

    /// All non-deleted content still in `pinning` state at a location.
    async fn pinning_at(&self, location: &str) -> Result<Vec<content::Model>, RepoError>;

    /// All content eligible for a replication pass: active, not offloaded,
    /// not an aggregate parent or dag-split root, not deleted.
    async fn deal_candidates(&self) -> Result<Vec<content::Model>, RepoError>;
}

#[async_trait]
pub trait DealRepo: Send + Sync {
    async fn create(&self, new: NewDeal) -> Result<deal::Model, RepoError>;

    async fn get(&self, id: i64) -> Result<Option<deal::Model>, RepoError>;

    async fn non_failed_for_content(&self, content_id: i64)
    -> Result<Vec<deal::Model>, RepoError>;

    /// Whether a non-failed in-flight deal already exists for this
    /// (content, provider) pair.
    async fn has_in_flight(&self, content_id: i64, provider: &str) -> Result<bool, RepoError>;

    /// Set `failed` and `failed_at` in a single atomic update.
    async fn mark_failed(&self, id: i64) -> Result<(), RepoError>;

    /// Record the external deal id once the provider acknowledges.
    async fn set_deal_id(&self, id: i64, external_deal_id: i64) -> Result<(), RepoError>;

    /// Record the transfer channel opened for a proposed deal.
    async fn set_transfer_channel(&self, id: i64, channel: &str) -> Result<(), RepoError>;

    /// Deals with a non-terminal transfer (not failed, deal id 0, channel
    /// recorded) whose content lives at `location`.
    async fn restart_candidates(&self, location: &str) -> Result<Vec<deal::Model>, RepoError>;
}

/// Physical block accounting: Object rows with ObjRef links per content.
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Record the blocks making up a content's graph, creating Object rows
    /// as needed and one ObjRef per (content, object).
    async fn add_objects(&self, content_id: i64, blocks: &[(Cid, i64)]) -> Result<(), RepoError>;

    /// Whether any Object row references this CID.
    async fn is_referenced(&self, cid: &Cid) -> Result<bool, RepoError>;

    /// Drop all ObjRef rows for a content and delete Object rows left with
    /// zero references; their blocks become GC-eligible.
    async fn drop_refs_for_content(&self, content_id: i64) -> Result<(), RepoError>;
}

#[async_trait]
pub trait ShuttleRepo: Send + Sync {
    /// Update liveness info from a heartbeat, creating the row on first
    /// contact.
    async fn record_heartbeat(&self, hb: &rpc::Heartbeat) -> Result<(), RepoError>;

    async fn get_by_handle(&self, handle: &str) -> Result<Option<shuttle::Model>, RepoError>;
}

#[async_trait]
pub trait AutoretrieveRepo: Send + Sync {
    /// Autoretrieve servers with a heartbeat newer than `cutoff`.
    async fn online_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<autoretrieve::Model>, RepoError>;
}
