use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Cid;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};

use super::{ContentRepo, DealRepo, NewContent, NewDeal, ObjectRepo, RepoError, ShuttleRepo};
use crate::entity::{autoretrieve, content, deal, obj_ref, object, shuttle};
use crate::repo::AutoretrieveRepo;

/// Postgres-backed repository set sharing one connection pool.
#[derive(Clone)]
pub struct PgRepos {
    db: DatabaseConnection,
}

impl PgRepos {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ContentRepo for PgRepos {
    async fn create(&self, new: NewContent) -> Result<content::Model, RepoError> {
        let now = Utc::now();
        let model = content::ActiveModel {
            id: NotSet,
            cid: Set(new.cid.to_hex()),
            name: Set(new.name),
            owner: Set(new.owner),
            size: Set(new.size),
            active: Set(false),
            pinning: Set(true),
            failed: Set(false),
            offloaded: Set(false),
            replication: Set(new.replication),
            location: Set(new.location),
            aggregated_in: Set(None),
            aggregate: Set(false),
            dag_split: Set(false),
            split_from: Set(None),
            deleted_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(&self.db).await?)
    }

    async fn get(&self, id: i64) -> Result<Option<content::Model>, RepoError> {
        Ok(content::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn mark_active(&self, id: i64, size: i64) -> Result<(), RepoError> {
        content::Entity::update_many()
            .col_expr(content::Column::Active, Expr::value(true))
            .col_expr(content::Column::Pinning, Expr::value(false))
            .col_expr(content::Column::Failed, Expr::value(false))
            .col_expr(content::Column::Size, Expr::value(size))
            .col_expr(content::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(content::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64) -> Result<(), RepoError> {
        content::Entity::update_many()
            .col_expr(content::Column::Active, Expr::value(false))
            .col_expr(content::Column::Pinning, Expr::value(false))
            .col_expr(content::Column::Failed, Expr::value(true))
            .col_expr(content::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(content::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn soft_delete(&self, id: i64) -> Result<(), RepoError> {
        let now = Utc::now();
        content::Entity::update_many()
            .col_expr(content::Column::DeletedAt, Expr::value(now))
            .col_expr(content::Column::UpdatedAt, Expr::value(now))
            .filter(content::Column::Id.eq(id))
            .filter(content::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn pinning_at(&self, location: &str) -> Result<Vec<content::Model>, RepoError> {
        Ok(content::Entity::find()
            .filter(content::Column::Location.eq(location))
            .filter(content::Column::Pinning.eq(true))
            .filter(content::Column::Failed.eq(false))
            .filter(content::Column::DeletedAt.is_null())
            .all(&self.db)
            .await?)
    }

    async fn deal_candidates(&self) -> Result<Vec<content::Model>, RepoError> {
        // Aggregate parents and dag-split roots are filtered in memory;
        // both are rare and the split-root predicate spans two columns.
        let rows = content::Entity::find()
            .filter(content::Column::Active.eq(true))
            .filter(content::Column::Offloaded.eq(false))
            .filter(content::Column::Aggregate.eq(false))
            .filter(content::Column::DeletedAt.is_null())
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().filter(|c| c.deal_eligible()).collect())
    }
}

#[async_trait]
impl DealRepo for PgRepos {
    async fn create(&self, new: NewDeal) -> Result<deal::Model, RepoError> {
        let now = Utc::now();
        let model = deal::ActiveModel {
            id: NotSet,
            content_id: Set(new.content_id),
            provider: Set(new.provider),
            deal_id: Set(0),
            transfer_channel: Set(new.transfer_channel),
            proposal_cid: Set(new.proposal_cid),
            failed: Set(false),
            failed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(&self.db).await?)
    }

    async fn get(&self, id: i64) -> Result<Option<deal::Model>, RepoError> {
        Ok(deal::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn non_failed_for_content(
        &self,
        content_id: i64,
    ) -> Result<Vec<deal::Model>, RepoError> {
        Ok(deal::Entity::find()
            .filter(deal::Column::ContentId.eq(content_id))
            .filter(deal::Column::Failed.eq(false))
            .all(&self.db)
            .await?)
    }

    async fn has_in_flight(&self, content_id: i64, provider: &str) -> Result<bool, RepoError> {
        let count = deal::Entity::find()
            .filter(deal::Column::ContentId.eq(content_id))
            .filter(deal::Column::Provider.eq(provider))
            .filter(deal::Column::Failed.eq(false))
            .filter(deal::Column::DealId.eq(0))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    async fn mark_failed(&self, id: i64) -> Result<(), RepoError> {
        // One statement so readers never observe failed=true without
        // failed_at set.
        let now = Utc::now();
        deal::Entity::update_many()
            .col_expr(deal::Column::Failed, Expr::value(true))
            .col_expr(deal::Column::FailedAt, Expr::value(now))
            .col_expr(deal::Column::UpdatedAt, Expr::value(now))
            .filter(deal::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_deal_id(&self, id: i64, external_deal_id: i64) -> Result<(), RepoError> {
        deal::Entity::update_many()
            .col_expr(deal::Column::DealId, Expr::value(external_deal_id))
            .col_expr(deal::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(deal::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_transfer_channel(&self, id: i64, channel: &str) -> Result<(), RepoError> {
        deal::Entity::update_many()
            .col_expr(deal::Column::TransferChannel, Expr::value(channel))
            .col_expr(deal::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(deal::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn restart_candidates(&self, location: &str) -> Result<Vec<deal::Model>, RepoError> {
        let content_ids: Vec<i64> = content::Entity::find()
            .select_only()
            .column(content::Column::Id)
            .filter(content::Column::Location.eq(location))
            .filter(content::Column::DeletedAt.is_null())
            .into_tuple()
            .all(&self.db)
            .await?;

        if content_ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(deal::Entity::find()
            .filter(deal::Column::ContentId.is_in(content_ids))
            .filter(deal::Column::Failed.eq(false))
            .filter(deal::Column::DealId.eq(0))
            .filter(deal::Column::TransferChannel.is_not_null())
            .all(&self.db)
            .await?)
    }
}

#[async_trait]
impl ObjectRepo for PgRepos {
    async fn add_objects(&self, content_id: i64, blocks: &[(Cid, i64)]) -> Result<(), RepoError> {
        let txn = self.db.begin().await?;

        for (cid, size) in blocks {
            let hex = cid.to_hex();
            let existing = object::Entity::find()
                .filter(object::Column::Cid.eq(hex.clone()))
                .one(&txn)
                .await?;

            let object_id = match existing {
                Some(obj) => obj.id,
                None => {
                    let model = object::ActiveModel {
                        id: NotSet,
                        cid: Set(hex),
                        size: Set(*size),
                    };
                    model.insert(&txn).await?.id
                }
            };

            let ref_exists = obj_ref::Entity::find()
                .filter(obj_ref::Column::ContentId.eq(content_id))
                .filter(obj_ref::Column::ObjectId.eq(object_id))
                .count(&txn)
                .await?
                > 0;

            if !ref_exists {
                let model = obj_ref::ActiveModel {
                    id: NotSet,
                    content_id: Set(content_id),
                    object_id: Set(object_id),
                };
                model.insert(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }

    async fn is_referenced(&self, cid: &Cid) -> Result<bool, RepoError> {
        let count = object::Entity::find()
            .filter(object::Column::Cid.eq(cid.to_hex()))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    async fn drop_refs_for_content(&self, content_id: i64) -> Result<(), RepoError> {
        let txn = self.db.begin().await?;

        let refs = obj_ref::Entity::find()
            .filter(obj_ref::Column::ContentId.eq(content_id))
            .all(&txn)
            .await?;

        obj_ref::Entity::delete_many()
            .filter(obj_ref::Column::ContentId.eq(content_id))
            .exec(&txn)
            .await?;

        for r in refs {
            let remaining = obj_ref::Entity::find()
                .filter(obj_ref::Column::ObjectId.eq(r.object_id))
                .count(&txn)
                .await?;
            if remaining == 0 {
                object::Entity::delete_by_id(r.object_id).exec(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ShuttleRepo for PgRepos {
    async fn record_heartbeat(&self, hb: &rpc::Heartbeat) -> Result<(), RepoError> {
        let addresses =
            serde_json::to_string(&hb.addresses).unwrap_or_else(|_| "[]".to_string());

        match shuttle::Entity::find()
            .filter(shuttle::Column::Handle.eq(hb.handle.clone()))
            .one(&self.db)
            .await?
        {
            Some(existing) => {
                let mut active: shuttle::ActiveModel = existing.into();
                active.last_heartbeat = Set(Some(hb.sent_at));
                active.peer_id = Set(hb.peer_id.clone());
                active.addresses = Set(addresses);
                active.updated_at = Set(Utc::now());
                active.update(&self.db).await?;
            }
            None => {
                let now = Utc::now();
                let model = shuttle::ActiveModel {
                    id: NotSet,
                    handle: Set(hb.handle.clone()),
                    token: Set(uuid::Uuid::new_v4().to_string()),
                    last_heartbeat: Set(Some(hb.sent_at)),
                    open: Set(true),
                    peer_id: Set(hb.peer_id.clone()),
                    addresses: Set(addresses),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                model.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn get_by_handle(&self, handle: &str) -> Result<Option<shuttle::Model>, RepoError> {
        Ok(shuttle::Entity::find()
            .filter(shuttle::Column::Handle.eq(handle))
            .one(&self.db)
            .await?)
    }
}

#[async_trait]
impl AutoretrieveRepo for PgRepos {
    async fn online_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<autoretrieve::Model>, RepoError> {
        Ok(autoretrieve::Entity::find()
            .filter(autoretrieve::Column::LastHeartbeat.gt(cutoff))
            .all(&self.db)
            .await?)
    }
}
