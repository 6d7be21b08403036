use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Stock of one product variant at one store.
///
/// `quantity` never goes negative and `version` increases on every write.
/// A row whose variant was deleted keeps its history with
/// `product_variant_id` cleared.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventories")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub product_variant_id: Option<i64>,
    pub store_id: i64,
    pub quantity: i32,
    pub low_stock_threshold: i32,
    pub version: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::inventory_transaction::Entity")]
    Transactions,
}

impl Related<super::inventory_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_low_stock(&self) -> bool {
        self.quantity > 0 && self.quantity <= self.low_stock_threshold
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.quantity <= 0
    }

    pub fn is_orphaned(&self) -> bool {
        self.product_variant_id.is_none()
    }
}
