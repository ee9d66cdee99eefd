use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Cid;

use super::{
    AutoretrieveRepo, ContentRepo, DealRepo, NewContent, NewDeal, ObjectRepo, RepoError,
    ShuttleRepo,
};
use crate::entity::{autoretrieve, content, deal, obj_ref, object, shuttle};

#[derive(Default)]
struct Tables {
    contents: HashMap<i64, content::Model>,
    deals: HashMap<i64, deal::Model>,
    objects: HashMap<i64, object::Model>,
    obj_refs: HashMap<i64, obj_ref::Model>,
    shuttles: HashMap<i64, shuttle::Model>,
    autoretrieves: HashMap<i64, autoretrieve::Model>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory repository set for unit tests and local experimentation.
///
/// Mirrors the Postgres implementation's semantics; not meant for durable
/// use.
#[derive(Default)]
pub struct MemoryRepos {
    tables: Mutex<Tables>,
}

impl MemoryRepos {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut tables)
    }

    /// Insert a content row as-is (test fixture helper). Returns the row
    /// with an assigned id when `model.id` is 0.
    pub fn insert_content(&self, mut model: content::Model) -> content::Model {
        self.with(|t| {
            if model.id == 0 {
                model.id = t.next_id();
            }
            t.contents.insert(model.id, model.clone());
            model
        })
    }

    /// Insert a deal row as-is (test fixture helper).
    pub fn insert_deal(&self, mut model: deal::Model) -> deal::Model {
        self.with(|t| {
            if model.id == 0 {
                model.id = t.next_id();
            }
            t.deals.insert(model.id, model.clone());
            model
        })
    }

    /// Insert an autoretrieve row as-is (test fixture helper).
    pub fn insert_autoretrieve(&self, mut model: autoretrieve::Model) -> autoretrieve::Model {
        self.with(|t| {
            if model.id == 0 {
                model.id = t.next_id();
            }
            t.autoretrieves.insert(model.id, model.clone());
            model
        })
    }

    /// Count of all deal rows, failed or not (test assertion helper).
    pub fn deal_count(&self) -> usize {
        self.with(|t| t.deals.len())
    }

    /// Count of live ObjRef rows for a content (test assertion helper).
    pub fn ref_count(&self, content_id: i64) -> usize {
        self.with(|t| {
            t.obj_refs
                .values()
                .filter(|r| r.content_id == content_id)
                .count()
        })
    }
}

#[async_trait]
impl ContentRepo for MemoryRepos {
    async fn create(&self, new: NewContent) -> Result<content::Model, RepoError> {
        let now = Utc::now();
        Ok(self.with(|t| {
            let id = t.next_id();
            let model = content::Model {
                id,
                cid: new.cid.to_hex(),
                name: new.name,
                owner: new.owner,
                size: new.size,
                active: false,
                pinning: true,
                failed: false,
                offloaded: false,
                replication: new.replication,
                location: new.location,
                aggregated_in: None,
                aggregate: false,
                dag_split: false,
                split_from: None,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            };
            t.contents.insert(id, model.clone());
            model
        }))
    }

    async fn get(&self, id: i64) -> Result<Option<content::Model>, RepoError> {
        Ok(self.with(|t| t.contents.get(&id).cloned()))
    }

    async fn mark_active(&self, id: i64, size: i64) -> Result<(), RepoError> {
        self.with(|t| match t.contents.get_mut(&id) {
            Some(c) => {
                c.active = true;
                c.pinning = false;
                c.failed = false;
                c.size = size;
                c.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RepoError::NotFound("content", id)),
        })
    }

    async fn mark_failed(&self, id: i64) -> Result<(), RepoError> {
        self.with(|t| match t.contents.get_mut(&id) {
            Some(c) => {
                c.active = false;
                c.pinning = false;
                c.failed = true;
                c.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RepoError::NotFound("content", id)),
        })
    }

    async fn soft_delete(&self, id: i64) -> Result<(), RepoError> {
        self.with(|t| match t.contents.get_mut(&id) {
            Some(c) => {
                if c.deleted_at.is_none() {
                    c.deleted_at = Some(Utc::now());
                    c.updated_at = Utc::now();
                }
                Ok(())
            }
            None => Err(RepoError::NotFound("content", id)),
        })
    }

    async fn pinning_at(&self, location: &str) -> Result<Vec<content::Model>, RepoError> {
        Ok(self.with(|t| {
            let mut rows: Vec<_> = t
                .contents
                .values()
                .filter(|c| {
                    c.location == location && c.pinning && !c.failed && c.deleted_at.is_none()
                })
                .cloned()
                .collect();
            rows.sort_by_key(|c| c.id);
            rows
        }))
    }

    async fn deal_candidates(&self) -> Result<Vec<content::Model>, RepoError> {
        Ok(self.with(|t| {
            let mut rows: Vec<_> = t
                .contents
                .values()
                .filter(|c| c.deal_eligible())
                .cloned()
                .collect();
            rows.sort_by_key(|c| c.id);
            rows
        }))
    }
}

#[async_trait]
impl DealRepo for MemoryRepos {
    async fn create(&self, new: NewDeal) -> Result<deal::Model, RepoError> {
        let now = Utc::now();
        Ok(self.with(|t| {
            let id = t.next_id();
            let model = deal::Model {
                id,
                content_id: new.content_id,
                provider: new.provider,
                deal_id: 0,
                transfer_channel: new.transfer_channel,
                proposal_cid: new.proposal_cid,
                failed: false,
                failed_at: None,
                created_at: now,
                updated_at: now,
            };
            t.deals.insert(id, model.clone());
            model
        }))
    }

    async fn get(&self, id: i64) -> Result<Option<deal::Model>, RepoError> {
        Ok(self.with(|t| t.deals.get(&id).cloned()))
    }

    async fn non_failed_for_content(
        &self,
        content_id: i64,
    ) -> Result<Vec<deal::Model>, RepoError> {
        Ok(self.with(|t| {
            let mut rows: Vec<_> = t
                .deals
                .values()
                .filter(|d| d.content_id == content_id && !d.failed)
                .cloned()
                .collect();
            rows.sort_by_key(|d| d.id);
            rows
        }))
    }

    async fn has_in_flight(&self, content_id: i64, provider: &str) -> Result<bool, RepoError> {
        Ok(self.with(|t| {
            t.deals.values().any(|d| {
                d.content_id == content_id && d.provider == provider && !d.failed && d.deal_id == 0
            })
        }))
    }

    async fn mark_failed(&self, id: i64) -> Result<(), RepoError> {
        self.with(|t| match t.deals.get_mut(&id) {
            Some(d) => {
                let now = Utc::now();
                d.failed = true;
                d.failed_at = Some(now);
                d.updated_at = now;
                Ok(())
            }
            None => Err(RepoError::NotFound("deal", id)),
        })
    }

    async fn set_deal_id(&self, id: i64, external_deal_id: i64) -> Result<(), RepoError> {
        self.with(|t| match t.deals.get_mut(&id) {
            Some(d) => {
                d.deal_id = external_deal_id;
                d.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RepoError::NotFound("deal", id)),
        })
    }

    async fn set_transfer_channel(&self, id: i64, channel: &str) -> Result<(), RepoError> {
        self.with(|t| match t.deals.get_mut(&id) {
            Some(d) => {
                d.transfer_channel = Some(channel.to_string());
                d.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RepoError::NotFound("deal", id)),
        })
    }

    async fn restart_candidates(&self, location: &str) -> Result<Vec<deal::Model>, RepoError> {
        Ok(self.with(|t| {
            let mut rows: Vec<_> = t
                .deals
                .values()
                .filter(|d| {
                    d.in_flight()
                        && t.contents
                            .get(&d.content_id)
                            .map(|c| c.location == location && c.deleted_at.is_none())
                            .unwrap_or(false)
                })
                .cloned()
                .collect();
            rows.sort_by_key(|d| d.id);
            rows
        }))
    }
}

#[async_trait]
impl ObjectRepo for MemoryRepos {
    async fn add_objects(&self, content_id: i64, blocks: &[(Cid, i64)]) -> Result<(), RepoError> {
        self.with(|t| {
            for (cid, size) in blocks {
                let hex = cid.to_hex();
                let object_id = match t.objects.values().find(|o| o.cid == hex) {
                    Some(obj) => obj.id,
                    None => {
                        let id = t.next_id();
                        t.objects.insert(
                            id,
                            object::Model {
                                id,
                                cid: hex,
                                size: *size,
                            },
                        );
                        id
                    }
                };

                let ref_exists = t
                    .obj_refs
                    .values()
                    .any(|r| r.content_id == content_id && r.object_id == object_id);
                if !ref_exists {
                    let id = t.next_id();
                    t.obj_refs.insert(
                        id,
                        obj_ref::Model {
                            id,
                            content_id,
                            object_id,
                        },
                    );
                }
            }
            Ok(())
        })
    }

    async fn is_referenced(&self, cid: &Cid) -> Result<bool, RepoError> {
        let hex = cid.to_hex();
        Ok(self.with(|t| t.objects.values().any(|o| o.cid == hex)))
    }

    async fn drop_refs_for_content(&self, content_id: i64) -> Result<(), RepoError> {
        self.with(|t| {
            let dropped: Vec<i64> = t
                .obj_refs
                .values()
                .filter(|r| r.content_id == content_id)
                .map(|r| r.object_id)
                .collect();

            t.obj_refs.retain(|_, r| r.content_id != content_id);

            for object_id in dropped {
                let still_referenced =
                    t.obj_refs.values().any(|r| r.object_id == object_id);
                if !still_referenced {
                    t.objects.remove(&object_id);
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ShuttleRepo for MemoryRepos {
    async fn record_heartbeat(&self, hb: &rpc::Heartbeat) -> Result<(), RepoError> {
        let addresses =
            serde_json::to_string(&hb.addresses).unwrap_or_else(|_| "[]".to_string());
        self.with(|t| {
            if let Some(existing) = t.shuttles.values_mut().find(|s| s.handle == hb.handle) {
                existing.last_heartbeat = Some(hb.sent_at);
                existing.peer_id = hb.peer_id.clone();
                existing.addresses = addresses;
                existing.updated_at = Utc::now();
            } else {
                let now = Utc::now();
                let id = t.next_id();
                t.shuttles.insert(
                    id,
                    shuttle::Model {
                        id,
                        handle: hb.handle.clone(),
                        token: uuid::Uuid::new_v4().to_string(),
                        last_heartbeat: Some(hb.sent_at),
                        open: true,
                        peer_id: hb.peer_id.clone(),
                        addresses,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
            Ok(())
        })
    }

    async fn get_by_handle(&self, handle: &str) -> Result<Option<shuttle::Model>, RepoError> {
        Ok(self.with(|t| t.shuttles.values().find(|s| s.handle == handle).cloned()))
    }
}

#[async_trait]
impl AutoretrieveRepo for MemoryRepos {
    async fn online_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<autoretrieve::Model>, RepoError> {
        Ok(self.with(|t| {
            t.autoretrieves
                .values()
                .filter(|a| a.last_heartbeat.map(|hb| hb > cutoff).unwrap_or(false))
                .cloned()
                .collect()
        }))
    }
}
