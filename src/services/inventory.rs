use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, histogram};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::ActorContext;
use crate::concurrency::{with_deadlock_prevention, ConcurrencyHelper};
use crate::config::InventoryConfig;
use crate::db::begin_locked_transaction;
use crate::entities::inventory::Model as InventoryModel;
use crate::entities::inventory_transaction::{Model as TransactionModel, TransactionType};
use crate::entities::order_item::{self, FulfillmentStatus};
use crate::entities::stock_transfer::{self, TransferStatus};
use crate::entities::store;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::{InventoryRepository, LedgerEntry, NewInventory};
use crate::services::stock_transfer::StockTransferService;

/// Longest period a time series may cover.
const MAX_SERIES_DAYS: i64 = 3_660;

/// One line of an order as seen by batch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub variant_id: i64,
    pub quantity: i32,
    pub is_stocked_sale: bool,
}

impl StockLine {
    pub fn stocked(variant_id: i64, quantity: i32) -> Self {
        Self {
            variant_id,
            quantity,
            is_stocked_sale: true,
        }
    }
}

/// Advisory availability of one line. May be stale by the time a mutating
/// call commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAvailability {
    pub variant_id: i64,
    pub requested: i32,
    pub available: i32,
    pub is_available: bool,
}

/// Optional note and business reference stamped on ledger entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementMeta {
    pub notes: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<i64>,
}

impl MovementMeta {
    pub fn note(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Default::default()
        }
    }

    pub fn reference(reference_type: impl Into<String>, reference_id: i64) -> Self {
        Self {
            reference_type: Some(reference_type.into()),
            reference_id: Some(reference_id),
            ..Default::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// A signed quantity change for one (store, variant) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockMovement {
    pub store_id: i64,
    pub variant_id: i64,
    pub delta: i32,
}

/// Ledger attributes shared by every movement of one logical operation.
#[derive(Debug, Clone)]
pub struct MovementContext {
    pub kind: TransactionType,
    pub actor_id: Uuid,
    pub meta: MovementMeta,
}

/// State of one inventory row after a committed movement.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementOutcome {
    pub inventory: InventoryModel,
    pub before_quantity: i32,
    pub delta: i32,
    pub transaction_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub quantity: i64,
}

/// Ledger row reduced to what the daily replay needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerMovement {
    pub inventory_id: i64,
    pub date: NaiveDate,
    pub before_quantity: i32,
    pub quantity: i32,
}

impl From<&TransactionModel> for LedgerMovement {
    fn from(row: &TransactionModel) -> Self {
        Self {
            inventory_id: row.inventory_id,
            date: row.created_at.date_naive(),
            before_quantity: row.before_quantity,
            quantity: row.quantity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockReport {
    pub store_id: Option<i64>,
    pub low_stock: Vec<InventoryModel>,
    pub out_of_stock: Vec<InventoryModel>,
    pub generated_at: DateTime<Utc>,
}

/// Rebuilds a daily quantity curve from ledger movements.
///
/// Each inventory row starts from the `before_quantity` of its earliest
/// movement and replays deltas forward; the value for a day includes every
/// movement dated on or before it. `untracked` holds rows without movements
/// in range, each contributing a constant baseline to every day. Movements
/// must be ordered oldest first per row.
pub fn replay_daily_series(
    movements: &[LedgerMovement],
    untracked: &HashMap<i64, i32>,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<TimeSeriesPoint> {
    let mut per_row: BTreeMap<i64, Vec<&LedgerMovement>> = BTreeMap::new();
    for movement in movements {
        per_row.entry(movement.inventory_id).or_default().push(movement);
    }

    let constant: i64 = untracked
        .iter()
        .filter(|(id, _)| !per_row.contains_key(id))
        .map(|(_, qty)| i64::from(*qty))
        .sum();

    // (balance, cursor) per row
    let mut state: BTreeMap<i64, (i64, usize)> = per_row
        .iter()
        .map(|(id, rows)| (*id, (i64::from(rows[0].before_quantity), 0)))
        .collect();

    let mut points = Vec::new();
    let mut day = from;
    while day <= to {
        let mut total = constant;
        for (id, rows) in &per_row {
            if let Some((balance, cursor)) = state.get_mut(id) {
                while *cursor < rows.len() && rows[*cursor].date <= day {
                    *balance += i64::from(rows[*cursor].quantity);
                    *cursor += 1;
                }
                total += *balance;
            }
        }
        points.push(TimeSeriesPoint {
            date: day,
            quantity: total,
        });
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    points
}

/// Stock mutation API. Every mutating operation requires an authenticated
/// actor, runs in one database transaction and takes row locks in ascending
/// inventory id order.
#[derive(Debug, Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    repository: Arc<InventoryRepository>,
    concurrency: ConcurrencyHelper,
    transfers: Arc<StockTransferService>,
    event_sender: Arc<EventSender>,
    config: InventoryConfig,
}

impl InventoryService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        concurrency: ConcurrencyHelper,
        transfers: Arc<StockTransferService>,
        config: InventoryConfig,
    ) -> Self {
        Self {
            repository: Arc::new(InventoryRepository::new(db.clone())),
            db,
            concurrency,
            transfers,
            event_sender,
            config,
        }
    }

    pub fn repository(&self) -> &InventoryRepository {
        &self.repository
    }

    /// Resolves an optional store id.
    ///
    /// An explicit id must exist. Without one, the configured default store
    /// is used, else the earliest-created active store. With no store at all
    /// the call fails with `NoStoreConfigured`.
    #[instrument(skip(self))]
    pub async fn resolve_store(&self, store_id: Option<i64>) -> Result<i64, ServiceError> {
        let db = &*self.db;
        if let Some(id) = store_id.or(self.config.default_store_id) {
            return match store::Entity::find_by_id(id).one(db).await? {
                Some(store) => Ok(store.id),
                None => Err(ServiceError::InvalidStore(id)),
            };
        }

        store::Entity::find()
            .filter(store::Column::IsActive.eq(true))
            .order_by_asc(store::Column::CreatedAt)
            .order_by_asc(store::Column::Id)
            .one(db)
            .await?
            .map(|store| store.id)
            .ok_or_else(|| {
                warn!("No store configured; refusing to pick a default");
                ServiceError::NoStoreConfigured
            })
    }

    /// True iff the current quantity covers `quantity`. Takes no lock.
    #[instrument(skip(self))]
    pub async fn check_stock(
        &self,
        variant_id: i64,
        quantity: i32,
        store_id: Option<i64>,
    ) -> Result<bool, ServiceError> {
        validate_positive(quantity)?;
        let store_id = self.resolve_store(store_id).await?;
        let available = self
            .repository
            .find_by_variant_and_store(variant_id, store_id)
            .await?
            .map(|row| row.quantity)
            .unwrap_or(0);
        Ok(available >= quantity)
    }

    /// Advisory pre-flight for a list of lines. Reads without locking, so the
    /// answer can be stale by the time a mutating call commits.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn batch_check_stock(
        &self,
        items: &[StockLine],
        store_id: Option<i64>,
    ) -> Result<Vec<StockAvailability>, ServiceError> {
        for item in items {
            validate_positive(item.quantity)?;
        }
        let store_id = self.resolve_store(store_id).await?;
        let variant_ids: Vec<i64> = items.iter().map(|item| item.variant_id).collect();
        let rows = self
            .repository
            .find_by_variant_ids(&variant_ids, store_id)
            .await?;

        Ok(items
            .iter()
            .map(|item| {
                let available = rows.get(&item.variant_id).map(|r| r.quantity).unwrap_or(0);
                StockAvailability {
                    variant_id: item.variant_id,
                    requested: item.quantity,
                    available,
                    is_available: available >= item.quantity,
                }
            })
            .collect())
    }

    /// Removes `quantity` units under a row lock. Fails with
    /// `InsufficientStock` and leaves the row untouched when short.
    #[instrument(skip(self, actor, meta))]
    pub async fn deduct_stock(
        &self,
        actor: &ActorContext,
        variant_id: i64,
        quantity: i32,
        store_id: Option<i64>,
        meta: MovementMeta,
    ) -> Result<bool, ServiceError> {
        let actor_id = actor.require()?;
        validate_positive(quantity)?;
        let store_id = self.resolve_store(store_id).await?;

        self.run_movements(
            vec![StockMovement {
                store_id,
                variant_id,
                delta: -quantity,
            }],
            MovementContext {
                kind: TransactionType::Deduct,
                actor_id,
                meta,
            },
        )
        .await?;

        info!(variant_id, store_id, quantity, actor = %actor_id, "Stock deducted");
        Ok(true)
    }

    /// Adds `quantity` units back. Never violates non-negativity, so it only
    /// fails on infrastructure errors.
    #[instrument(skip(self, actor, meta))]
    pub async fn return_stock(
        &self,
        actor: &ActorContext,
        variant_id: i64,
        quantity: i32,
        store_id: Option<i64>,
        meta: MovementMeta,
    ) -> Result<bool, ServiceError> {
        let actor_id = actor.require()?;
        validate_positive(quantity)?;
        let store_id = self.resolve_store(store_id).await?;

        self.run_movements(
            vec![StockMovement {
                store_id,
                variant_id,
                delta: quantity,
            }],
            MovementContext {
                kind: TransactionType::Return,
                actor_id,
                meta,
            },
        )
        .await?;

        info!(variant_id, store_id, quantity, actor = %actor_id, "Stock returned");
        Ok(true)
    }

    /// All-or-nothing deduction of every stocked-sale line.
    #[instrument(skip(self, actor, items, meta), fields(lines = items.len()))]
    pub async fn batch_deduct_stock(
        &self,
        actor: &ActorContext,
        items: &[StockLine],
        store_id: Option<i64>,
        meta: MovementMeta,
    ) -> Result<bool, ServiceError> {
        self.batch_movement(actor, items, store_id, meta, TransactionType::Deduct)
            .await
    }

    /// All-or-nothing return of every stocked-sale line.
    #[instrument(skip(self, actor, items, meta), fields(lines = items.len()))]
    pub async fn batch_return_stock(
        &self,
        actor: &ActorContext,
        items: &[StockLine],
        store_id: Option<i64>,
        meta: MovementMeta,
    ) -> Result<bool, ServiceError> {
        self.batch_movement(actor, items, store_id, meta, TransactionType::Return)
            .await
    }

    async fn batch_movement(
        &self,
        actor: &ActorContext,
        items: &[StockLine],
        store_id: Option<i64>,
        meta: MovementMeta,
        kind: TransactionType,
    ) -> Result<bool, ServiceError> {
        let actor_id = actor.require()?;
        let stocked: Vec<&StockLine> = items.iter().filter(|i| i.is_stocked_sale).collect();
        for item in &stocked {
            validate_positive(item.quantity)?;
        }
        if stocked.is_empty() {
            return Ok(true);
        }
        let store_id = self.resolve_store(store_id).await?;

        let sign = if kind == TransactionType::Deduct { -1 } else { 1 };
        let movements = stocked
            .iter()
            .map(|item| StockMovement {
                store_id,
                variant_id: item.variant_id,
                delta: sign * item.quantity,
            })
            .collect();

        let outcomes = self
            .run_movements(
                movements,
                MovementContext {
                    kind,
                    actor_id,
                    meta,
                },
            )
            .await?;

        info!(
            store_id,
            kind = %kind,
            rows = outcomes.len(),
            skipped = items.len() - stocked.len(),
            "Batch stock movement committed"
        );
        Ok(true)
    }

    /// Sets the absolute quantity of a row through the optimistic path: a
    /// version-checked write retried on conflict.
    #[instrument(skip(self, actor))]
    pub async fn set_stock_level(
        &self,
        actor: &ActorContext,
        variant_id: i64,
        store_id: i64,
        new_quantity: i32,
        note: Option<String>,
    ) -> Result<InventoryModel, ServiceError> {
        let actor_id = actor.require()?;
        if new_quantity < 0 {
            return Err(ServiceError::ValidationError(
                "stock level cannot be negative".to_string(),
            ));
        }
        let store_id = self.resolve_store(Some(store_id)).await?;

        let service = self;
        let note = &note;
        let (row, outcome) = self
            .concurrency
            .with_optimistic_lock(move || async move {
                let txn = service.db.begin().await?;
                let current = InventoryRepository::first_or_create(
                    &txn,
                    variant_id,
                    store_id,
                    NewInventory::default(),
                )
                .await?;
                if current.quantity == new_quantity {
                    txn.commit().await?;
                    return Ok((current, None));
                }

                let before = current.quantity;
                let delta = new_quantity - before;
                let updated =
                    InventoryRepository::update_quantity(&txn, &current, new_quantity).await?;
                let entry = LedgerEntry {
                    transaction_type: TransactionType::Adjustment,
                    quantity: delta,
                    reference_type: None,
                    reference_id: None,
                    notes: note.clone(),
                    created_by: actor_id,
                };
                let ledger =
                    InventoryRepository::record_transaction(&txn, &updated, before, &entry).await?;
                txn.commit().await?;
                Ok((
                    updated.clone(),
                    Some(MovementOutcome {
                        inventory: updated,
                        before_quantity: before,
                        delta,
                        transaction_id: ledger.id,
                    }),
                ))
            })
            .await?;

        if let Some(outcome) = outcome {
            self.notify_movements(std::slice::from_ref(&outcome)).await;
        }
        info!(variant_id, store_id, new_quantity, "Stock level set");
        Ok(row)
    }

    /// Updates the alerting threshold of a row, creating the row if needed.
    #[instrument(skip(self, actor))]
    pub async fn set_low_stock_threshold(
        &self,
        actor: &ActorContext,
        variant_id: i64,
        store_id: i64,
        threshold: i32,
    ) -> Result<InventoryModel, ServiceError> {
        actor.require()?;
        if threshold < 0 {
            return Err(ServiceError::ValidationError(
                "low stock threshold cannot be negative".to_string(),
            ));
        }
        let store_id = self.resolve_store(Some(store_id)).await?;

        let txn = self.db.begin().await?;
        let row =
            InventoryRepository::first_or_create(&txn, variant_id, store_id, NewInventory::default())
                .await?;
        let mut active: crate::entities::inventory::ActiveModel = row.into();
        active.low_stock_threshold = Set(threshold);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Daily quantity curve of a variant between two dates (inclusive),
    /// summed across stores when `store_id` is omitted.
    #[instrument(skip(self))]
    pub async fn get_inventory_time_series(
        &self,
        variant_id: i64,
        from: NaiveDate,
        to: NaiveDate,
        store_id: Option<i64>,
    ) -> Result<Vec<TimeSeriesPoint>, ServiceError> {
        if from > to {
            return Err(ServiceError::ValidationError(
                "time series start must not be after its end".to_string(),
            ));
        }
        if (to - from).num_days() > MAX_SERIES_DAYS {
            return Err(ServiceError::ValidationError(format!(
                "time series may span at most {} days",
                MAX_SERIES_DAYS
            )));
        }

        let until = to
            .and_hms_milli_opt(23, 59, 59, 999)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| ServiceError::ValidationError("invalid end date".to_string()))?;

        let ledger = self
            .repository
            .transactions_for_variant(variant_id, store_id, until)
            .await?;
        let movements: Vec<LedgerMovement> = ledger.iter().map(LedgerMovement::from).collect();

        // Rows without movements up to `to` held, throughout the window,
        // what their first later movement started from. Only rows with no
        // ledger at all fall back to their current quantity.
        let tracked: HashSet<i64> = movements.iter().map(|m| m.inventory_id).collect();
        let idle: Vec<InventoryModel> = self
            .repository
            .find_all_for_variant(variant_id, store_id)
            .await?
            .into_iter()
            .filter(|row| !tracked.contains(&row.id))
            .collect();
        let idle_ids: Vec<i64> = idle.iter().map(|row| row.id).collect();
        let later = self
            .repository
            .first_transactions_after(&idle_ids, until)
            .await?;
        let untracked: HashMap<i64, i32> = idle
            .into_iter()
            .map(|row| {
                let baseline = later
                    .get(&row.id)
                    .map_or(row.quantity, |entry| entry.before_quantity);
                (row.id, baseline)
            })
            .collect();

        Ok(replay_daily_series(&movements, &untracked, from, to))
    }

    /// Tries to cover an order line from another store.
    ///
    /// When no source can cover the whole remaining quantity, the line is
    /// marked backordered and `false` is returned. Otherwise a pending
    /// transfer is recorded and the line becomes `transfer_pending`.
    #[instrument(skip(self, actor))]
    pub async fn initiate_automated_transfer(
        &self,
        actor: &ActorContext,
        order_item_id: i64,
        target_store_id: i64,
    ) -> Result<bool, ServiceError> {
        let actor_id = actor.require()?;
        let target_store_id = self.resolve_store(Some(target_store_id)).await?;

        let item = order_item::Entity::find_by_id(order_item_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order item {}", order_item_id)))?;
        let needed = item.remaining_quantity();
        if needed <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "order item {} has nothing left to fulfil",
                order_item_id
            )));
        }

        let options = self
            .transfers
            .find_optimal_transfer_stores(target_store_id, item.product_variant_id, needed)
            .await?;
        let best = options.first().filter(|best| best.available_qty >= needed);

        let txn = self.db.begin().await?;
        let Some(best) = best else {
            mark_fulfillment_status(&txn, &item, FulfillmentStatus::Backordered, true).await?;
            txn.commit().await?;
            info!(
                order_item_id,
                target_store_id, needed, "No transfer source; item backordered"
            );
            return Ok(false);
        };

        let now = Utc::now();
        let transfer = stock_transfer::ActiveModel {
            product_variant_id: Set(item.product_variant_id),
            from_store_id: Set(best.store_id),
            to_store_id: Set(target_store_id),
            quantity: Set(needed),
            status: Set(TransferStatus::Pending.to_string()),
            order_item_id: Set(Some(item.id)),
            distance_km: Set(best.distance_km),
            requested_by: Set(actor_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        mark_fulfillment_status(&txn, &item, FulfillmentStatus::TransferPending, item.is_backorder)
            .await?;
        txn.commit().await?;

        counter!("inventory.transfer.requested", 1);
        info!(
            transfer_id = transfer.id,
            from_store_id = best.store_id,
            target_store_id,
            quantity = needed,
            "Inter-store transfer requested"
        );
        self.event_sender
            .send_or_log(Event::TransferRequested {
                transfer_id: transfer.id,
                order_item_id: Some(item.id),
                from_store_id: best.store_id,
                to_store_id: target_store_id,
                quantity: needed,
            })
            .await;
        Ok(true)
    }

    /// Clears the catalogue reference of a deleted variant. Rows and ledger
    /// stay in place and show up in [`Self::get_orphaned_items`].
    #[instrument(skip(self, actor))]
    pub async fn detach_variant(
        &self,
        actor: &ActorContext,
        variant_id: i64,
    ) -> Result<u64, ServiceError> {
        actor.require()?;
        let txn = self.db.begin().await?;
        let detached = InventoryRepository::orphan_variant(&txn, variant_id).await?;
        txn.commit().await?;
        info!(variant_id, rows = detached, "Variant detached from inventory");
        Ok(detached)
    }

    pub async fn get_orphaned_items(&self) -> Result<Vec<InventoryModel>, ServiceError> {
        self.repository.get_orphaned_items().await
    }

    #[instrument(skip(self))]
    pub async fn low_stock_report(
        &self,
        store_id: Option<i64>,
    ) -> Result<LowStockReport, ServiceError> {
        if let Some(id) = store_id {
            self.resolve_store(Some(id)).await?;
        }
        let low_stock = self.repository.get_low_stock_items(store_id).await?;
        let out_of_stock = self.repository.get_out_of_stock_items(store_id).await?;
        Ok(LowStockReport {
            store_id,
            low_stock,
            out_of_stock,
            generated_at: Utc::now(),
        })
    }

    /// Runs movements in their own locked transaction, retrying conflicts,
    /// and emits notifications once committed.
    async fn run_movements(
        &self,
        movements: Vec<StockMovement>,
        ctx: MovementContext,
    ) -> Result<Vec<MovementOutcome>, ServiceError> {
        let started = Instant::now();
        Self::ensure_rows(
            &self.db,
            movements.iter().map(|m| (m.store_id, m.variant_id)),
        )
        .await?;
        let service = self;
        let movements = &movements;
        let ctx = &ctx;

        let outcomes = self
            .concurrency
            .with_optimistic_lock(move || async move {
                let txn =
                    begin_locked_transaction(&service.db, service.concurrency.lock_wait_timeout())
                        .await?;
                let outcomes = Self::apply_movements_in(&txn, movements, ctx).await?;
                txn.commit().await?;
                Ok(outcomes)
            })
            .await?;

        histogram!("inventory.mutation.duration", started.elapsed());
        counter!("inventory.movements", outcomes.len() as u64);
        self.notify_movements(&outcomes).await;
        Ok(outcomes)
    }

    /// Creates missing `(store, variant)` rows at 0 in a short transaction of
    /// their own, so the locked pass that follows only takes row locks in
    /// ascending id order.
    pub(crate) async fn ensure_rows(
        db: &DatabaseConnection,
        pairs: impl IntoIterator<Item = (i64, i64)>,
    ) -> Result<(), ServiceError> {
        let pairs: BTreeSet<(i64, i64)> = pairs.into_iter().collect();
        if pairs.is_empty() {
            return Ok(());
        }
        let txn = db.begin().await?;
        for (store_id, variant_id) in pairs {
            InventoryRepository::first_or_create(&txn, variant_id, store_id, NewInventory::default())
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Applies movements inside the caller's transaction.
    ///
    /// Deltas are netted per (store, variant), rows still missing are created
    /// at 0 (callers run `ensure_rows` beforehand), every row is locked in
    /// ascending id order before the first write, and rows are then checked
    /// and mutated in that same order. The first
    /// shortfall aborts with `InsufficientStock`; the caller's rollback
    /// discards earlier writes.
    pub(crate) async fn apply_movements_in<C: ConnectionTrait>(
        conn: &C,
        movements: &[StockMovement],
        ctx: &MovementContext,
    ) -> Result<Vec<MovementOutcome>, ServiceError> {
        let mut net: BTreeMap<(i64, i64), i32> = BTreeMap::new();
        for movement in movements {
            let entry = net.entry((movement.store_id, movement.variant_id)).or_insert(0);
            *entry = entry.checked_add(movement.delta).ok_or_else(|| {
                ServiceError::ValidationError("movement quantity overflow".to_string())
            })?;
        }

        let mut planned: HashMap<i64, StockMovement> = HashMap::new();
        for ((store_id, variant_id), delta) in net {
            if delta == 0 {
                continue;
            }
            let row = InventoryRepository::first_or_create(
                conn,
                variant_id,
                store_id,
                NewInventory::default(),
            )
            .await?;
            planned.insert(
                row.id,
                StockMovement {
                    store_id,
                    variant_id,
                    delta,
                },
            );
        }

        let ids: Vec<i64> = planned.keys().copied().collect();
        let locked: HashMap<i64, InventoryModel> =
            InventoryRepository::lock_multiple_for_update(conn, &ids)
                .await?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();
        let planned = &planned;
        let locked = &locked;

        let outcomes = with_deadlock_prevention(&ids, |id| async move {
            let (row, movement) = match (locked.get(&id), planned.get(&id)) {
                (Some(row), Some(movement)) => (row, *movement),
                _ => {
                    return Err(ServiceError::ConcurrencyConflict(format!(
                        "inventory {} disappeared while locking",
                        id
                    )))
                }
            };

            let before = row.quantity;
            let after = before.checked_add(movement.delta).ok_or_else(|| {
                ServiceError::ValidationError("inventory quantity overflow".to_string())
            })?;
            if after < 0 {
                counter!("inventory.deduct.rejected", 1);
                return Err(ServiceError::InsufficientStock {
                    variant_id: movement.variant_id,
                    store_id: movement.store_id,
                    requested: -movement.delta,
                    available: before,
                });
            }

            let updated = InventoryRepository::update_quantity(conn, row, after).await?;
            let entry = LedgerEntry {
                transaction_type: ctx.kind,
                quantity: movement.delta,
                reference_type: ctx.meta.reference_type.clone(),
                reference_id: ctx.meta.reference_id,
                notes: ctx.meta.notes.clone(),
                created_by: ctx.actor_id,
            };
            let ledger = InventoryRepository::record_transaction(conn, &updated, before, &entry)
                .await?;

            Ok(MovementOutcome {
                inventory: updated,
                before_quantity: before,
                delta: movement.delta,
                transaction_id: ledger.id,
            })
        })
        .await?;

        Ok(outcomes.into_values().collect())
    }

    /// Emits threshold, exhaustion and anomaly notifications for committed
    /// movements.
    pub(crate) async fn notify_movements(&self, outcomes: &[MovementOutcome]) {
        for event in movement_events(outcomes, self.config.anomaly_quantity_threshold) {
            self.event_sender.send_or_log(event).await;
        }
    }
}

/// Notifications implied by a set of committed movements.
pub fn movement_events(outcomes: &[MovementOutcome], anomaly_threshold: i32) -> Vec<Event> {
    let mut events = Vec::new();
    for outcome in outcomes {
        let row = &outcome.inventory;
        let before = outcome.before_quantity;
        let after = row.quantity;

        if after == 0 && before > 0 {
            events.push(Event::StockExhausted {
                inventory_id: row.id,
                product_variant_id: row.product_variant_id,
                store_id: row.store_id,
            });
        } else if after > 0 && after <= row.low_stock_threshold && before > row.low_stock_threshold
        {
            events.push(Event::LowStock {
                inventory_id: row.id,
                product_variant_id: row.product_variant_id,
                store_id: row.store_id,
                quantity: after,
                threshold: row.low_stock_threshold,
            });
        }

        if outcome.delta.unsigned_abs() >= anomaly_threshold.unsigned_abs() {
            events.push(Event::AnomalyDetected {
                inventory_id: row.id,
                product_variant_id: row.product_variant_id,
                store_id: row.store_id,
                quantity: after,
                movement: outcome.delta,
                detail: format!(
                    "single movement of {} units (threshold {})",
                    outcome.delta, anomaly_threshold
                ),
            });
        }
    }
    events
}

fn validate_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be greater than zero, got {}",
            quantity
        )));
    }
    Ok(())
}

async fn mark_fulfillment_status<C: ConnectionTrait>(
    conn: &C,
    item: &order_item::Model,
    status: FulfillmentStatus,
    is_backorder: bool,
) -> Result<(), ServiceError> {
    let mut active: order_item::ActiveModel = item.clone().into();
    active.fulfillment_status = Set(status.to_string());
    active.is_backorder = Set(is_backorder);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn outcome(before: i32, delta: i32, threshold: i32) -> MovementOutcome {
        let now = Utc::now();
        MovementOutcome {
            inventory: InventoryModel {
                id: 1,
                product_variant_id: Some(7),
                store_id: 3,
                quantity: before + delta,
                low_stock_threshold: threshold,
                version: 2,
                created_at: now,
                updated_at: now,
            },
            before_quantity: before,
            delta,
            transaction_id: 1,
        }
    }

    #[test]
    fn replay_starts_from_earliest_known_balance() {
        let movements = vec![
            LedgerMovement {
                inventory_id: 1,
                date: date(2024, 1, 2),
                before_quantity: 10,
                quantity: -3,
            },
            LedgerMovement {
                inventory_id: 1,
                date: date(2024, 1, 4),
                before_quantity: 7,
                quantity: 5,
            },
        ];
        let series =
            replay_daily_series(&movements, &HashMap::new(), date(2024, 1, 1), date(2024, 1, 5));
        let quantities: Vec<i64> = series.iter().map(|p| p.quantity).collect();
        assert_eq!(quantities, vec![10, 7, 7, 12, 12]);
    }

    #[test]
    fn replay_sums_rows_and_untracked_stock() {
        let movements = vec![
            LedgerMovement {
                inventory_id: 1,
                date: date(2024, 1, 1),
                before_quantity: 0,
                quantity: 4,
            },
            LedgerMovement {
                inventory_id: 2,
                date: date(2024, 1, 2),
                before_quantity: 0,
                quantity: 6,
            },
        ];
        let untracked = HashMap::from([(1, 4), (2, 6), (3, 20)]);
        let series = replay_daily_series(&movements, &untracked, date(2024, 1, 1), date(2024, 1, 2));
        assert_eq!(series[0].quantity, 24);
        assert_eq!(series[1].quantity, 30);
    }

    #[test]
    fn replay_covers_every_day_inclusive() {
        let series = replay_daily_series(&[], &HashMap::new(), date(2024, 2, 27), date(2024, 3, 1));
        assert_eq!(series.len(), 4);
        assert_eq!(series[2].date, date(2024, 2, 29));
        assert!(series.iter().all(|p| p.quantity == 0));
    }

    #[test]
    fn exhaustion_and_low_stock_fire_on_crossing_only() {
        let events = movement_events(&[outcome(5, -5, 2)], 100);
        assert!(matches!(events.as_slice(), [Event::StockExhausted { .. }]));

        let events = movement_events(&[outcome(5, -3, 2)], 100);
        assert!(matches!(events.as_slice(), [Event::LowStock { quantity: 2, .. }]));

        // Already below the threshold: no repeated alert.
        let events = movement_events(&[outcome(2, -1, 2)], 100);
        assert!(events.is_empty());
    }

    #[test]
    fn large_movements_raise_anomalies() {
        let events = movement_events(&[outcome(0, 150, 5)], 100);
        assert!(matches!(
            events.as_slice(),
            [Event::AnomalyDetected { movement: 150, .. }]
        ));
    }

    #[test]
    fn movement_meta_builders() {
        let meta = MovementMeta::reference("order", 42).with_notes("checkout");
        assert_eq!(meta.reference_id, Some(42));
        assert_eq!(meta.notes.as_deref(), Some("checkout"));
        assert!(validate_positive(0).is_err());
    }
}
