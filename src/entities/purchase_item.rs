use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Supplier-side line. `allocated_quantity` went to backorders and
/// `stocked_quantity` was booked into store inventory; together they never
/// exceed `quantity`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub product_variant_id: i64,
    pub store_id: i64,
    pub quantity: i32,
    pub allocated_quantity: i32,
    pub stocked_quantity: i32,
    pub status: String,
    pub received_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PurchaseItemStatus {
    Ordered,
    Received,
    Completed,
}

impl Model {
    /// Units not yet allocated to backorders nor booked to stock.
    pub fn unassigned_quantity(&self) -> i32 {
        (self.quantity - self.allocated_quantity - self.stocked_quantity).max(0)
    }

    pub fn is_received(&self) -> bool {
        self.status == PurchaseItemStatus::Received.as_ref()
            || self.status == PurchaseItemStatus::Completed.as_ref()
    }
}
