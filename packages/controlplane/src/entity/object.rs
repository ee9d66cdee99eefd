use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One content-addressed block tracked in the database.
///
/// An object with zero live [`super::obj_ref`] rows is deleted together
/// with the last reference, which makes its block eligible for garbage
/// collection.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "objects")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Block CID (hex).
    pub cid: String,
    pub size: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
