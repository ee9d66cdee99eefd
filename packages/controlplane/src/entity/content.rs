use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A logical unit of stored data.
///
/// Exactly one of `pinning`, `active`, `failed` describes the current
/// lifecycle stage. `deleted_at` is an explicit soft delete checked by all
/// queries; block reclamation is deferred to the garbage collector.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "contents")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Root CID of the content's block graph (hex).
    pub cid: String,
    pub name: String,
    pub owner: i64,
    /// Declared size in bytes; confirmed on pin success.
    pub size: i64,

    pub active: bool,
    pub pinning: bool,
    pub failed: bool,
    /// Data moved off hot storage; excluded from replication passes.
    pub offloaded: bool,

    /// Target number of storage-provider deals.
    pub replication: i32,

    /// `"local"` or the handle of the shuttle holding the data.
    pub location: String,

    /// Set when this content is bundled into an aggregate; points at the
    /// parent aggregate content.
    pub aggregated_in: Option<i64>,
    /// An aggregate parent never receives direct deals, only its children do.
    pub aggregate: bool,

    /// Part of a split DAG. The split root is never deal-targeted; its
    /// children (with `split_from` set) are.
    pub dag_split: bool,
    pub split_from: Option<i64>,

    pub deleted_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this content is a candidate for storage deals.
    ///
    /// Aggregate parents and dag-split roots are excluded; for both, deals
    /// are made for the children instead.
    pub fn deal_eligible(&self) -> bool {
        self.active
            && !self.failed
            && !self.offloaded
            && !self.aggregate
            && !(self.dag_split && self.split_from.is_none())
            && self.deleted_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base() -> Model {
        Model {
            id: 1,
            cid: "aa".repeat(32),
            name: "c".into(),
            owner: 1,
            size: 100,
            active: true,
            pinning: false,
            failed: false,
            offloaded: false,
            replication: 3,
            location: "local".into(),
            aggregated_in: None,
            aggregate: false,
            dag_split: false,
            split_from: None,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn active_plain_content_is_eligible() {
        assert!(base().deal_eligible());
    }

    #[test]
    fn aggregate_parent_is_not_eligible() {
        let c = Model {
            aggregate: true,
            ..base()
        };
        assert!(!c.deal_eligible());
    }

    #[test]
    fn aggregate_child_is_eligible() {
        let c = Model {
            aggregated_in: Some(7),
            ..base()
        };
        assert!(c.deal_eligible());
    }

    #[test]
    fn dag_split_root_is_not_eligible_but_children_are() {
        let root = Model {
            dag_split: true,
            split_from: None,
            ..base()
        };
        assert!(!root.deal_eligible());

        let child = Model {
            dag_split: true,
            split_from: Some(1),
            ..base()
        };
        assert!(child.deal_eligible());
    }

    #[test]
    fn inactive_offloaded_or_deleted_is_not_eligible() {
        assert!(
            !Model {
                active: false,
                pinning: true,
                ..base()
            }
            .deal_eligible()
        );
        assert!(
            !Model {
                offloaded: true,
                ..base()
            }
            .deal_eligible()
        );
        assert!(
            !Model {
                deleted_at: Some(Utc::now()),
                ..base()
            }
            .deal_eligible()
        );
    }
}
