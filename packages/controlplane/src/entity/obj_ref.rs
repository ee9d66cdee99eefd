use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Links a content to one of the objects making up its block graph.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "obj_refs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub content_id: i64,
    pub object_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
