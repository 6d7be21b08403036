use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_id: i64,
    pub product_variant_id: i64,
    pub store_id: i64,
    pub quantity: i32,
    pub fulfilled_quantity: i32,
    pub is_stocked_sale: bool,
    pub is_backorder: bool,
    pub is_custom: bool,
    pub is_fulfilled: bool,
    pub fulfilled_at: Option<DateTimeUtc>,
    pub fulfillment_status: String,
    pub purchase_item_id: Option<i64>,
    pub allocation_priority_score: Option<f64>,
    pub priority_score_overridden: bool,
    pub priority_deadline: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Backordered,
    TransferPending,
    Fulfilled,
    Cancelled,
}

/// Result of applying a fulfilment increment to an order line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FulfillmentProgress {
    pub fulfilled_quantity: i32,
    pub is_fulfilled: bool,
    pub fulfilled_at: Option<DateTimeUtc>,
    /// Units actually applied after capping at the line quantity.
    pub applied: i32,
}

impl Model {
    pub fn remaining_quantity(&self) -> i32 {
        (self.quantity - self.fulfilled_quantity).max(0)
    }

    /// Computes the line state after adding `qty` fulfilled units.
    ///
    /// The total is capped at `quantity`, never decreases, and `fulfilled_at`
    /// is stamped exactly when the line first becomes complete.
    pub fn add_fulfilled_quantity(&self, qty: i32, now: DateTimeUtc) -> FulfillmentProgress {
        let current = self.fulfilled_quantity.clamp(0, self.quantity.max(0));
        let target = current.saturating_add(qty.max(0)).min(self.quantity.max(0));
        let is_fulfilled = target == self.quantity;
        let fulfilled_at = match (is_fulfilled, self.fulfilled_at) {
            (true, Some(at)) => Some(at),
            (true, None) => Some(now),
            (false, _) => None,
        };
        FulfillmentProgress {
            fulfilled_quantity: target,
            is_fulfilled,
            fulfilled_at,
            applied: target - current,
        }
    }

    pub fn status(&self) -> Option<FulfillmentStatus> {
        self.fulfillment_status.parse().ok()
    }
}
