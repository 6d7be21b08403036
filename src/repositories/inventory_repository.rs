use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::concurrency::{conditional_update, lock_rows};
use crate::entities::inventory::{
    ActiveModel as InventoryActiveModel, Column, Entity as Inventory, Model as InventoryModel,
};
use crate::entities::inventory_transaction::{
    self, ActiveModel as TransactionActiveModel, Entity as InventoryTransaction,
    Model as TransactionModel, TransactionType,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// Attributes applied when `first_or_create` has to insert a row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewInventory {
    pub low_stock_threshold: i32,
}

/// One ledger movement to be appended for an inventory row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub transaction_type: TransactionType,
    /// Signed delta
    pub quantity: i32,
    pub reference_type: Option<String>,
    pub reference_id: Option<i64>,
    pub notes: Option<String>,
    pub created_by: Uuid,
}

/// Data access over the `inventories` table and its ledger. No business rules
/// live here beyond the structural invariants of a single write.
#[derive(Debug)]
pub struct InventoryRepository {
    base: BaseRepository,
}

impl InventoryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find(&self, id: i64) -> Result<Option<InventoryModel>, ServiceError> {
        Ok(Inventory::find_by_id(id).one(self.base.get_db()).await?)
    }

    pub async fn find_by_variant_and_store(
        &self,
        variant_id: i64,
        store_id: i64,
    ) -> Result<Option<InventoryModel>, ServiceError> {
        Self::find_by_variant_and_store_in(self.base.get_db(), variant_id, store_id).await
    }

    /// Same lookup on an explicit connection or transaction.
    pub async fn find_by_variant_and_store_in<C: ConnectionTrait>(
        conn: &C,
        variant_id: i64,
        store_id: i64,
    ) -> Result<Option<InventoryModel>, ServiceError> {
        Ok(Inventory::find()
            .filter(Column::ProductVariantId.eq(variant_id))
            .filter(Column::StoreId.eq(store_id))
            .one(conn)
            .await?)
    }

    /// Rows for the given variants at one store, keyed by variant id.
    pub async fn find_by_variant_ids(
        &self,
        variant_ids: &[i64],
        store_id: i64,
    ) -> Result<HashMap<i64, InventoryModel>, ServiceError> {
        if variant_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = Inventory::find()
            .filter(Column::ProductVariantId.is_in(variant_ids.to_vec()))
            .filter(Column::StoreId.eq(store_id))
            .all(self.base.get_db())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.product_variant_id.map(|variant| (variant, row)))
            .collect())
    }

    /// Rows of a variant across all stores holding positive stock.
    pub async fn find_in_stock_for_variant(
        &self,
        variant_id: i64,
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        Ok(Inventory::find()
            .filter(Column::ProductVariantId.eq(variant_id))
            .filter(Column::Quantity.gt(0))
            .order_by_asc(Column::StoreId)
            .all(self.base.get_db())
            .await?)
    }

    pub async fn find_all_for_variant(
        &self,
        variant_id: i64,
        store_id: Option<i64>,
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        let mut query = Inventory::find().filter(Column::ProductVariantId.eq(variant_id));
        if let Some(store_id) = store_id {
            query = query.filter(Column::StoreId.eq(store_id));
        }
        Ok(query
            .order_by_asc(Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Positive quantity at or below the row's own threshold.
    pub async fn get_low_stock_items(
        &self,
        store_id: Option<i64>,
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        let mut query = Inventory::find()
            .filter(Column::ProductVariantId.is_not_null())
            .filter(Column::Quantity.gt(0))
            .filter(Expr::col(Column::Quantity).lte(Expr::col(Column::LowStockThreshold)));
        if let Some(store_id) = store_id {
            query = query.filter(Column::StoreId.eq(store_id));
        }
        Ok(query
            .order_by_asc(Column::Quantity)
            .order_by_asc(Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    pub async fn get_out_of_stock_items(
        &self,
        store_id: Option<i64>,
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        let mut query = Inventory::find()
            .filter(Column::ProductVariantId.is_not_null())
            .filter(Column::Quantity.lte(0));
        if let Some(store_id) = store_id {
            query = query.filter(Column::StoreId.eq(store_id));
        }
        Ok(query
            .order_by_asc(Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Rows whose quantity is strictly below a caller-supplied threshold.
    pub async fn get_items_below_threshold(
        &self,
        threshold: i32,
        store_id: Option<i64>,
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        let mut query = Inventory::find()
            .filter(Column::ProductVariantId.is_not_null())
            .filter(Column::Quantity.lt(threshold));
        if let Some(store_id) = store_id {
            query = query.filter(Column::StoreId.eq(store_id));
        }
        Ok(query
            .order_by_asc(Column::Quantity)
            .order_by_asc(Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Rows whose product variant was deleted from the catalogue.
    pub async fn get_orphaned_items(&self) -> Result<Vec<InventoryModel>, ServiceError> {
        Ok(Inventory::find()
            .filter(Column::ProductVariantId.is_null())
            .order_by_asc(Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Ledger of a variant up to `until`, oldest first.
    pub async fn transactions_for_variant(
        &self,
        variant_id: i64,
        store_id: Option<i64>,
        until: DateTime<Utc>,
    ) -> Result<Vec<TransactionModel>, ServiceError> {
        let mut query = InventoryTransaction::find()
            .filter(inventory_transaction::Column::ProductVariantId.eq(variant_id))
            .filter(inventory_transaction::Column::CreatedAt.lte(until));
        if let Some(store_id) = store_id {
            query = query.filter(inventory_transaction::Column::StoreId.eq(store_id));
        }
        Ok(query
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .order_by_asc(inventory_transaction::Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Earliest ledger entry after `after` for each of `inventory_ids` that
    /// has one.
    pub async fn first_transactions_after(
        &self,
        inventory_ids: &[i64],
        after: DateTime<Utc>,
    ) -> Result<HashMap<i64, TransactionModel>, ServiceError> {
        if inventory_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = InventoryTransaction::find()
            .filter(inventory_transaction::Column::InventoryId.is_in(inventory_ids.to_vec()))
            .filter(inventory_transaction::Column::CreatedAt.gt(after))
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .order_by_asc(inventory_transaction::Column::Id)
            .all(self.base.get_db())
            .await?;

        let mut earliest = HashMap::new();
        for row in rows {
            earliest.entry(row.inventory_id).or_insert(row);
        }
        Ok(earliest)
    }

    pub async fn transactions_for_inventory(
        &self,
        inventory_id: i64,
    ) -> Result<Vec<TransactionModel>, ServiceError> {
        Ok(InventoryTransaction::find()
            .filter(inventory_transaction::Column::InventoryId.eq(inventory_id))
            .order_by_asc(inventory_transaction::Column::Id)
            .all(self.base.get_db())
            .await?)
    }

    /// Returns the row for `(variant, store)`, inserting it with quantity 0
    /// when absent. Concurrent callers converge on the same row through the
    /// unique `(store_id, product_variant_id)` index.
    pub async fn first_or_create<C: ConnectionTrait>(
        conn: &C,
        variant_id: i64,
        store_id: i64,
        attrs: NewInventory,
    ) -> Result<InventoryModel, ServiceError> {
        if let Some(existing) = Self::find_by_variant_and_store_in(conn, variant_id, store_id).await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let row = InventoryActiveModel {
            id: ActiveValue::NotSet,
            product_variant_id: Set(Some(variant_id)),
            store_id: Set(store_id),
            quantity: Set(0),
            low_stock_threshold: Set(attrs.low_stock_threshold.max(0)),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = Inventory::insert(row)
            .on_conflict(
                OnConflict::columns([Column::StoreId, Column::ProductVariantId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        if inserted == 0 {
            debug!(variant_id, store_id, "Inventory row created concurrently");
        }

        Self::find_by_variant_and_store_in(conn, variant_id, store_id)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "inventory row for variant {} at store {} vanished after insert",
                    variant_id, store_id
                ))
            })
    }

    pub async fn lock_for_update<C: ConnectionTrait>(
        conn: &C,
        id: i64,
    ) -> Result<Option<InventoryModel>, ServiceError> {
        Ok(lock_rows::<Inventory, C>(conn, &[id]).await?.into_iter().next())
    }

    pub async fn lock_by_variant_and_store<C: ConnectionTrait>(
        conn: &C,
        variant_id: i64,
        store_id: i64,
    ) -> Result<Option<InventoryModel>, ServiceError> {
        Ok(Inventory::find()
            .filter(Column::ProductVariantId.eq(variant_id))
            .filter(Column::StoreId.eq(store_id))
            .lock_exclusive()
            .one(conn)
            .await?)
    }

    /// Locks every row in ascending id order. Callers must never lock
    /// inventory rows in any other order.
    pub async fn lock_multiple_for_update<C: ConnectionTrait>(
        conn: &C,
        ids: &[i64],
    ) -> Result<Vec<InventoryModel>, ServiceError> {
        lock_rows::<Inventory, C>(conn, ids).await
    }

    /// Writes a new quantity if the row still carries `current.version`,
    /// bumping the version. A lost race surfaces as `ConcurrencyConflict`.
    pub async fn update_quantity<C: ConnectionTrait>(
        conn: &C,
        current: &InventoryModel,
        new_quantity: i32,
    ) -> Result<InventoryModel, ServiceError> {
        if new_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "inventory {} cannot go negative ({})",
                current.id, new_quantity
            )));
        }

        let now = Utc::now();
        let next_version = current.version + 1;
        let applied = conditional_update::<Inventory, C>(
            conn,
            current.id,
            vec![(Column::Version, Value::from(current.version))],
            vec![
                (Column::Quantity, Value::from(new_quantity)),
                (Column::Version, Value::from(next_version)),
                (Column::UpdatedAt, Value::from(now)),
            ],
        )
        .await?;

        if !applied {
            warn!(
                inventory_id = current.id,
                expected_version = current.version,
                "Inventory version mismatch"
            );
            return Err(ServiceError::ConcurrencyConflict(format!(
                "inventory {} was modified concurrently",
                current.id
            )));
        }

        Ok(InventoryModel {
            quantity: new_quantity,
            version: next_version,
            updated_at: now,
            ..current.clone()
        })
    }

    /// Appends a ledger row for a movement that took `updated` from
    /// `before_quantity` to its current quantity.
    pub async fn record_transaction<C: ConnectionTrait>(
        conn: &C,
        updated: &InventoryModel,
        before_quantity: i32,
        entry: &LedgerEntry,
    ) -> Result<TransactionModel, ServiceError> {
        let after_quantity = before_quantity + entry.quantity;
        if after_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "ledger entry would leave inventory {} at {}",
                updated.id, after_quantity
            )));
        }
        if after_quantity != updated.quantity {
            return Err(ServiceError::InternalError(format!(
                "ledger mismatch for inventory {}: {} + {} != {}",
                updated.id, before_quantity, entry.quantity, updated.quantity
            )));
        }

        let row = TransactionActiveModel {
            id: ActiveValue::NotSet,
            inventory_id: Set(updated.id),
            product_variant_id: Set(updated.product_variant_id),
            store_id: Set(updated.store_id),
            transaction_type: Set(entry.transaction_type.to_string()),
            quantity: Set(entry.quantity),
            before_quantity: Set(before_quantity),
            after_quantity: Set(after_quantity),
            reference_type: Set(entry.reference_type.clone()),
            reference_id: Set(entry.reference_id),
            notes: Set(entry.notes.clone()),
            created_by: Set(entry.created_by),
            created_at: Set(Utc::now()),
        };
        let result = InventoryTransaction::insert(row).exec(conn).await?;

        InventoryTransaction::find_by_id(result.last_insert_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("ledger row not readable".to_string()))
    }

    /// Clears the variant reference on every row of `variant_id`. The rows
    /// and their ledger stay in place.
    pub async fn orphan_variant<C: ConnectionTrait>(
        conn: &C,
        variant_id: i64,
    ) -> Result<u64, ServiceError> {
        let result = Inventory::update_many()
            .col_expr(Column::ProductVariantId, Expr::value(Value::BigInt(None)))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::ProductVariantId.eq(variant_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }
}

impl Repository for InventoryRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
