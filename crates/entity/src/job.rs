use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Default)]
#[sea_orm(table_name = "job")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub job_id: i64,
    pub cluster: String,
    pub subcluster: String,
    /// unix timestamp
    pub start_time: i64,
    pub user: String,
    pub project: String,
    pub partition: String,
    pub array_job_id: i64,
    pub duration: i32,
    pub walltime: i64,
    pub job_state: String,
    /// json encoded string map
    #[sea_orm(column_type = "Text", nullable)]
    pub meta_data: Option<String>,
    /// json encoded list of resources
    #[sea_orm(column_type = "Text")]
    pub resources: String,
    pub num_nodes: i32,
    pub num_hwthreads: i32,
    pub num_acc: i32,
    pub smt: i8,
    pub exclusive: i8,
    pub monitoring_status: i8,
    #[sea_orm(column_type = "Double")]
    pub mem_used_max: f64,
    #[sea_orm(column_type = "Double")]
    pub flops_any_avg: f64,
    #[sea_orm(column_type = "Double")]
    pub mem_bw_avg: f64,
    #[sea_orm(column_type = "Double")]
    pub load_avg: f64,
    #[sea_orm(column_type = "Double")]
    pub net_bw_avg: f64,
    #[sea_orm(column_type = "Double")]
    pub net_data_vol_total: f64,
    #[sea_orm(column_type = "Double")]
    pub file_bw_avg: f64,
    #[sea_orm(column_type = "Double")]
    pub file_data_vol_total: f64,
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
