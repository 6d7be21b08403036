use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Audit row written for every manual priority override.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "allocation_priority_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_item_id: i64,
    pub old_score: Option<f64>,
    pub new_score: f64,
    pub reason: String,
    pub adjusted_by: Uuid,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
