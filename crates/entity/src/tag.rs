use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, Default)]
#[sea_orm(table_name = "tag")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub tag_type: String,
    pub tag_name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::jobtag::Entity")]
    Jobtag,
}

impl Related<super::jobtag::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Jobtag.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
