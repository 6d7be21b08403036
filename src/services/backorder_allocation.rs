//! Distribution of received supplier stock across waiting backorder lines.
//!
//! Ranking and planning are pure functions ([`rank_candidates`],
//! [`plan_allocation`]) so simulations and the real pass share one code path.
//! The real pass runs under a per-variant distributed lock and a single
//! database transaction.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{info, instrument, warn};

use crate::auth::ActorContext;
use crate::concurrency::{conditional_update, lock_rows, ConcurrencyHelper};
use crate::db::begin_locked_transaction;
use crate::entities::allocation_priority_log;
use crate::entities::customer::{self, PriorityTier};
use crate::entities::inventory::Model as InventoryModel;
use crate::entities::inventory_transaction::TransactionType;
use crate::entities::order::{self, OrderPriority, OrderStatus};
use crate::entities::order_item::{self, FulfillmentStatus};
use crate::entities::purchase_item::{self, PurchaseItemStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{
    InventoryService, MovementContext, MovementMeta, MovementOutcome, StockMovement,
};

const TIER_VIP_BONUS: f64 = 100.0;
const TIER_HIGH_BONUS: f64 = 50.0;
const PRIORITY_URGENT_BONUS: f64 = 40.0;
const PRIORITY_HIGH_BONUS: f64 = 20.0;
const PRIORITY_LOW_PENALTY: f64 = -10.0;
const AGE_POINTS_PER_DAY: f64 = 2.0;
const AGE_POINTS_CAP: f64 = 30.0;
const DEADLINE_OVERDUE_BONUS: f64 = 40.0;
const DEADLINE_TWO_DAYS_BONUS: f64 = 30.0;
const DEADLINE_WEEK_BONUS: f64 = 15.0;
const VIP_CHANNEL_BONUS: f64 = 20.0;

/// Number of lines listed as next in line by the allocation report.
const REPORT_QUEUE_PREVIEW: usize = 5;

/// Ordering policy for backorder lines.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AllocationStrategy {
    /// Oldest order first.
    Fifo,
    /// Customer tier, then order age.
    CustomerPriority,
    /// Earliest deadline first; lines without one go last.
    DeadlinePriority,
    /// Weighted score over tier, order priority, age, deadline and channel.
    #[default]
    SmartPriority,
}

/// Scope and policy of one allocation or simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOptions {
    pub strategy: Option<AllocationStrategy>,
    /// Restricts candidates to lines of one store.
    pub store_id: Option<i64>,
}

/// A waiting backorder line with everything the ranking needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationCandidate {
    pub order_item_id: i64,
    pub order_id: i64,
    pub quantity: i32,
    pub fulfilled_quantity: i32,
    pub order_created_at: DateTime<Utc>,
    pub customer_tier: PriorityTier,
    pub order_priority: OrderPriority,
    pub sales_channel: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub stored_score: Option<f64>,
    pub score_overridden: bool,
}

impl AllocationCandidate {
    pub fn remaining(&self) -> i32 {
        (self.quantity - self.fulfilled_quantity).max(0)
    }

    /// Score used by the smart strategy. A manually overridden score is
    /// taken as is.
    pub fn effective_score(&self, now: DateTime<Utc>) -> f64 {
        match (self.score_overridden, self.stored_score) {
            (true, Some(score)) => score,
            _ => smart_priority_score(self, now),
        }
    }
}

/// Weighted priority of a line; higher allocates first.
pub fn smart_priority_score(candidate: &AllocationCandidate, now: DateTime<Utc>) -> f64 {
    let mut score = match candidate.customer_tier {
        PriorityTier::Vip => TIER_VIP_BONUS,
        PriorityTier::High => TIER_HIGH_BONUS,
        PriorityTier::Normal => 0.0,
    };

    score += match candidate.order_priority {
        OrderPriority::Urgent => PRIORITY_URGENT_BONUS,
        OrderPriority::High => PRIORITY_HIGH_BONUS,
        OrderPriority::Normal => 0.0,
        OrderPriority::Low => PRIORITY_LOW_PENALTY,
    };

    let age_days = (now - candidate.order_created_at).num_minutes().max(0) as f64 / 1_440.0;
    score += (age_days * AGE_POINTS_PER_DAY).min(AGE_POINTS_CAP);

    if let Some(deadline) = candidate.deadline {
        let until = deadline - now;
        if until < Duration::zero() {
            score += DEADLINE_OVERDUE_BONUS;
        } else if until <= Duration::days(2) {
            score += DEADLINE_TWO_DAYS_BONUS;
        } else if until <= Duration::days(7) {
            score += DEADLINE_WEEK_BONUS;
        }
    }

    if candidate
        .sales_channel
        .as_deref()
        .map_or(false, |channel| channel.eq_ignore_ascii_case("vip"))
    {
        score += VIP_CHANNEL_BONUS;
    }

    score
}

/// Sorts candidates in allocation order. Every strategy falls back to order
/// age and finally the line id, so the order is total and stable.
pub fn rank_candidates(
    candidates: &mut [AllocationCandidate],
    strategy: AllocationStrategy,
    now: DateTime<Utc>,
) {
    let by_age = |a: &AllocationCandidate, b: &AllocationCandidate| {
        a.order_created_at
            .cmp(&b.order_created_at)
            .then(a.order_item_id.cmp(&b.order_item_id))
    };

    match strategy {
        AllocationStrategy::Fifo => candidates.sort_by(by_age),
        AllocationStrategy::CustomerPriority => candidates.sort_by(|a, b| {
            a.customer_tier
                .rank()
                .cmp(&b.customer_tier.rank())
                .then_with(|| by_age(a, b))
        }),
        AllocationStrategy::DeadlinePriority => candidates.sort_by(|a, b| {
            match (a.deadline, b.deadline) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| by_age(a, b))
        }),
        AllocationStrategy::SmartPriority => {
            let scores: HashMap<i64, f64> = candidates
                .iter()
                .map(|c| (c.order_item_id, c.effective_score(now)))
                .collect();
            candidates.sort_by(|a, b| {
                let sa = scores.get(&a.order_item_id).copied().unwrap_or_default();
                let sb = scores.get(&b.order_item_id).copied().unwrap_or_default();
                sb.total_cmp(&sa).then_with(|| by_age(a, b))
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub order_item_id: i64,
    pub order_id: i64,
    /// Units the line was still waiting for.
    pub requested: i32,
    pub allocate: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub lines: Vec<PlannedAllocation>,
    pub total_allocated: i32,
    pub remaining_quantity: i32,
}

/// Walks ranked candidates giving each `min(remaining need, units left)`.
/// Lines that receive nothing are left out of the plan.
pub fn plan_allocation(ranked: &[AllocationCandidate], available: i32) -> AllocationPlan {
    let mut left = available.max(0);
    let mut lines = Vec::new();
    for candidate in ranked {
        if left == 0 {
            break;
        }
        let allocate = candidate.remaining().min(left);
        if allocate == 0 {
            continue;
        }
        left -= allocate;
        lines.push(PlannedAllocation {
            order_item_id: candidate.order_item_id,
            order_id: candidate.order_id,
            requested: candidate.remaining(),
            allocate,
        });
    }
    AllocationPlan {
        total_allocated: available.max(0) - left,
        remaining_quantity: left,
        lines,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedItem {
    pub order_item_id: i64,
    pub order_id: i64,
    pub allocated_quantity: i32,
    pub fulfilled_quantity: i32,
    pub is_fulfilled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub allocated_orders: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub purchase_item_id: Option<i64>,
    pub product_variant_id: i64,
    pub strategy: AllocationStrategy,
    pub allocated_items: Vec<AllocatedItem>,
    pub total_allocated: i32,
    pub remaining_quantity: i32,
    pub allocation_summary: AllocationSummary,
}

impl AllocationResult {
    fn empty(
        purchase_item_id: Option<i64>,
        product_variant_id: i64,
        strategy: AllocationStrategy,
        remaining_quantity: i32,
    ) -> Self {
        Self {
            purchase_item_id,
            product_variant_id,
            strategy,
            allocated_items: Vec::new(),
            total_allocated: 0,
            remaining_quantity,
            allocation_summary: AllocationSummary::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriorityBucket {
    pub lines: usize,
    pub quantity: i64,
}

/// Backlog statistics for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub product_variant_id: i64,
    pub pending_lines: usize,
    pub pending_quantity: i64,
    pub by_customer_tier: BTreeMap<String, PriorityBucket>,
    pub by_order_priority: BTreeMap<String, PriorityBucket>,
    pub lines_past_deadline: usize,
    pub oldest_waiting_hours: Option<i64>,
    pub average_waiting_hours: Option<f64>,
    /// Received supplier units not yet allocated nor stocked.
    pub unassigned_purchase_quantity: i64,
    /// Lines that the default strategy would serve first.
    pub next_in_line: Vec<i64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecalculationSummary {
    pub updated: usize,
    pub skipped_overridden: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptResult {
    pub allocation: AllocationResult,
    /// Units booked into store inventory after allocation.
    pub stocked_quantity: i32,
    pub inventory: Option<InventoryModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationResult {
    pub order_id: i64,
    pub reverted_items: Vec<i64>,
    pub returned_quantity: i32,
    pub already_cancelled: bool,
}

/// Which backorder lines a query considers.
#[derive(Debug, Clone, Copy, Default)]
struct CandidateFilter {
    variant_id: Option<i64>,
    store_id: Option<i64>,
}

/// Lines loaded for allocation, with the candidates built from them.
struct CandidateSet {
    items: HashMap<i64, order_item::Model>,
    candidates: Vec<AllocationCandidate>,
}

fn allocation_lock_key(variant_id: i64) -> String {
    format!("backorder-allocation:variant:{}", variant_id)
}

/// Loads open backorder lines, optionally row-locking them, and joins their
/// orders and customers. Lines of cancelled orders are dropped.
async fn load_candidates<C: ConnectionTrait>(
    conn: &C,
    filter: CandidateFilter,
    lock: bool,
) -> Result<CandidateSet, ServiceError> {
    let mut query = order_item::Entity::find()
        .filter(order_item::Column::IsBackorder.eq(true))
        .filter(order_item::Column::IsFulfilled.eq(false))
        .filter(
            order_item::Column::FulfillmentStatus.ne(FulfillmentStatus::Cancelled.to_string()),
        );
    if let Some(variant_id) = filter.variant_id {
        query = query.filter(order_item::Column::ProductVariantId.eq(variant_id));
    }
    if let Some(store_id) = filter.store_id {
        query = query.filter(order_item::Column::StoreId.eq(store_id));
    }
    let mut items = query.order_by_asc(order_item::Column::Id).all(conn).await?;

    if lock && !items.is_empty() {
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        items = lock_rows::<order_item::Entity, C>(conn, &ids)
            .await?
            .into_iter()
            .filter(|i| !i.is_fulfilled && i.status() != Some(FulfillmentStatus::Cancelled))
            .collect();
    }

    let order_ids: BTreeSet<i64> = items.iter().map(|i| i.order_id).collect();
    let orders: HashMap<i64, order::Model> = if order_ids.is_empty() {
        HashMap::new()
    } else {
        order::Entity::find()
            .filter(order::Column::Id.is_in(order_ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect()
    };

    let customer_ids: BTreeSet<i64> = orders.values().filter_map(|o| o.customer_id).collect();
    let tiers: HashMap<i64, PriorityTier> = if customer_ids.is_empty() {
        HashMap::new()
    } else {
        customer::Entity::find()
            .filter(customer::Column::Id.is_in(customer_ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|c| (c.id, c.tier()))
            .collect()
    };

    let mut candidates = Vec::with_capacity(items.len());
    let mut kept = HashMap::with_capacity(items.len());
    for item in items {
        let Some(order) = orders.get(&item.order_id) else {
            warn!(order_item_id = item.id, "Backorder line without order skipped");
            continue;
        };
        if order.is_cancelled() || item.remaining_quantity() == 0 {
            continue;
        }
        candidates.push(AllocationCandidate {
            order_item_id: item.id,
            order_id: order.id,
            quantity: item.quantity,
            fulfilled_quantity: item.fulfilled_quantity,
            order_created_at: order.created_at,
            customer_tier: order
                .customer_id
                .and_then(|id| tiers.get(&id).copied())
                .unwrap_or_default(),
            order_priority: order.priority(),
            sales_channel: order.sales_channel.clone(),
            deadline: item.priority_deadline.or(order.expected_delivery_date),
            stored_score: item.allocation_priority_score,
            score_overridden: item.priority_score_overridden,
        });
        kept.insert(item.id, item);
    }

    Ok(CandidateSet {
        items: kept,
        candidates,
    })
}

fn summarize(
    plan: &AllocationPlan,
    items: &HashMap<i64, order_item::Model>,
    purchase_item_id: Option<i64>,
    product_variant_id: i64,
    strategy: AllocationStrategy,
    now: DateTime<Utc>,
) -> AllocationResult {
    let allocated_items: Vec<AllocatedItem> = plan
        .lines
        .iter()
        .filter_map(|line| {
            items.get(&line.order_item_id).map(|item| {
                let progress = item.add_fulfilled_quantity(line.allocate, now);
                AllocatedItem {
                    order_item_id: item.id,
                    order_id: item.order_id,
                    allocated_quantity: progress.applied,
                    fulfilled_quantity: progress.fulfilled_quantity,
                    is_fulfilled: progress.is_fulfilled,
                }
            })
        })
        .collect();
    let allocated_orders: BTreeSet<i64> = allocated_items.iter().map(|a| a.order_id).collect();

    AllocationResult {
        purchase_item_id,
        product_variant_id,
        strategy,
        total_allocated: plan.total_allocated,
        remaining_quantity: plan.remaining_quantity,
        allocated_items,
        allocation_summary: AllocationSummary {
            allocated_orders: allocated_orders.into_iter().collect(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct BackorderAllocationService {
    db: Arc<DatabaseConnection>,
    concurrency: ConcurrencyHelper,
    inventory: Arc<InventoryService>,
    event_sender: Arc<EventSender>,
    default_strategy: AllocationStrategy,
}

impl BackorderAllocationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        concurrency: ConcurrencyHelper,
        inventory: Arc<InventoryService>,
        event_sender: Arc<EventSender>,
        default_strategy: AllocationStrategy,
    ) -> Self {
        Self {
            db,
            concurrency,
            inventory,
            event_sender,
            default_strategy,
        }
    }

    pub fn default_strategy(&self) -> AllocationStrategy {
        self.default_strategy
    }

    /// Allocates the unassigned units of a received purchase item to waiting
    /// backorders. Calling it again without new stock changes nothing.
    #[instrument(skip(self, actor))]
    pub async fn allocate_purchase_item(
        &self,
        actor: &ActorContext,
        purchase_item_id: i64,
        options: AllocationOptions,
    ) -> Result<AllocationResult, ServiceError> {
        actor.require()?;
        let purchase = self.find_purchase_item(purchase_item_id).await?;
        if !purchase.is_received() {
            return Err(ServiceError::ValidationError(format!(
                "purchase item {} has not been received",
                purchase_item_id
            )));
        }

        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let key = allocation_lock_key(purchase.product_variant_id);
        let service = self;

        let result = self
            .concurrency
            .with_distributed_lock(&key, self.concurrency.lock_options(), || async move {
                service
                    .concurrency
                    .with_optimistic_lock(|| async move {
                        let txn = begin_locked_transaction(
                            &service.db,
                            service.concurrency.lock_wait_timeout(),
                        )
                        .await?;
                        let result = Self::allocate_within(
                            &txn,
                            purchase_item_id,
                            strategy,
                            options.store_id,
                            Utc::now(),
                        )
                        .await?;
                        txn.commit().await?;
                        Ok(result)
                    })
                    .await
            })
            .await?;

        self.notify_allocation(&result).await;
        Ok(result)
    }

    /// Marks a purchase item received, allocates it to backorders and books
    /// the leftover units into the purchase item's store inventory, all in
    /// one transaction.
    #[instrument(skip(self, actor))]
    pub async fn receive_purchase_item(
        &self,
        actor: &ActorContext,
        purchase_item_id: i64,
        options: AllocationOptions,
    ) -> Result<ReceiptResult, ServiceError> {
        let actor_id = actor.require()?;
        let purchase = self.find_purchase_item(purchase_item_id).await?;
        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let key = allocation_lock_key(purchase.product_variant_id);
        InventoryService::ensure_rows(
            &self.db,
            [(purchase.store_id, purchase.product_variant_id)],
        )
        .await?;
        let service = self;

        let (receipt, outcomes) = self
            .concurrency
            .with_distributed_lock(&key, self.concurrency.lock_options(), || async move {
                service
                    .concurrency
                    .with_optimistic_lock(|| async move {
                        let txn = begin_locked_transaction(
                            &service.db,
                            service.concurrency.lock_wait_timeout(),
                        )
                        .await?;
                        let now = Utc::now();

                        let purchase = lock_rows::<purchase_item::Entity, _>(&txn, &[purchase_item_id])
                            .await?
                            .into_iter()
                            .next()
                            .ok_or_else(|| {
                                ServiceError::NotFound(format!(
                                    "purchase item {}",
                                    purchase_item_id
                                ))
                            })?;
                        if purchase.is_received() {
                            return Err(ServiceError::ValidationError(format!(
                                "purchase item {} was already received",
                                purchase_item_id
                            )));
                        }
                        let marked = conditional_update::<purchase_item::Entity, _>(
                            &txn,
                            purchase.id,
                            vec![(purchase_item::Column::Status, Value::from(purchase.status.clone()))],
                            vec![
                                (
                                    purchase_item::Column::Status,
                                    Value::from(PurchaseItemStatus::Received.to_string()),
                                ),
                                (purchase_item::Column::ReceivedAt, Value::from(Some(now))),
                                (purchase_item::Column::UpdatedAt, Value::from(now)),
                            ],
                        )
                        .await?;
                        if !marked {
                            return Err(ServiceError::ConcurrencyConflict(format!(
                                "purchase item {} changed while receiving",
                                purchase_item_id
                            )));
                        }

                        let allocation = Self::allocate_within(
                            &txn,
                            purchase_item_id,
                            strategy,
                            options.store_id,
                            now,
                        )
                        .await?;

                        let remainder = allocation.remaining_quantity;
                        let mut outcomes = Vec::new();
                        if remainder > 0 {
                            outcomes = InventoryService::apply_movements_in(
                                &txn,
                                &[StockMovement {
                                    store_id: purchase.store_id,
                                    variant_id: purchase.product_variant_id,
                                    delta: remainder,
                                }],
                                &MovementContext {
                                    kind: TransactionType::Purchase,
                                    actor_id,
                                    meta: MovementMeta::reference("purchase_item", purchase_item_id),
                                },
                            )
                            .await?;

                            let stocked = conditional_update::<purchase_item::Entity, _>(
                                &txn,
                                purchase.id,
                                vec![(
                                    purchase_item::Column::StockedQuantity,
                                    Value::from(purchase.stocked_quantity),
                                )],
                                vec![
                                    (
                                        purchase_item::Column::StockedQuantity,
                                        Value::from(purchase.stocked_quantity + remainder),
                                    ),
                                    (
                                        purchase_item::Column::Status,
                                        Value::from(PurchaseItemStatus::Completed.to_string()),
                                    ),
                                    (purchase_item::Column::UpdatedAt, Value::from(now)),
                                ],
                            )
                            .await?;
                            if !stocked {
                                return Err(ServiceError::ConcurrencyConflict(format!(
                                    "purchase item {} changed while stocking",
                                    purchase_item_id
                                )));
                            }
                        }

                        txn.commit().await?;
                        let inventory = outcomes.first().map(|o| o.inventory.clone());
                        Ok((
                            ReceiptResult {
                                allocation,
                                stocked_quantity: remainder,
                                inventory,
                            },
                            outcomes,
                        ))
                    })
                    .await
            })
            .await?;

        info!(
            purchase_item_id,
            allocated = receipt.allocation.total_allocated,
            stocked = receipt.stocked_quantity,
            "Purchase item received"
        );
        self.notify_allocation(&receipt.allocation).await;
        self.inventory.notify_movements(&outcomes).await;
        Ok(receipt)
    }

    /// Allocation pass inside the caller's transaction.
    ///
    /// Locks the purchase row, then the candidate lines in ascending id order,
    /// and writes each line with a compare-and-swap on its fulfilled quantity.
    async fn allocate_within<C: ConnectionTrait>(
        conn: &C,
        purchase_item_id: i64,
        strategy: AllocationStrategy,
        store_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<AllocationResult, ServiceError> {
        let purchase = lock_rows::<purchase_item::Entity, C>(conn, &[purchase_item_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(format!("purchase item {}", purchase_item_id)))?;
        let variant_id = purchase.product_variant_id;

        let available = purchase.unassigned_quantity();
        if available == 0 {
            return Ok(AllocationResult::empty(
                Some(purchase.id),
                variant_id,
                strategy,
                0,
            ));
        }

        let CandidateSet {
            items,
            mut candidates,
        } = load_candidates(
            conn,
            CandidateFilter {
                variant_id: Some(variant_id),
                store_id,
            },
            true,
        )
        .await?;
        rank_candidates(&mut candidates, strategy, now);
        let plan = plan_allocation(&candidates, available);
        let result = summarize(&plan, &items, Some(purchase.id), variant_id, strategy, now);

        for line in &plan.lines {
            let Some(item) = items.get(&line.order_item_id) else {
                continue;
            };
            let progress = item.add_fulfilled_quantity(line.allocate, now);
            let status = if progress.is_fulfilled {
                FulfillmentStatus::Fulfilled
            } else {
                FulfillmentStatus::Backordered
            };
            let updated = conditional_update::<order_item::Entity, C>(
                conn,
                item.id,
                vec![(
                    order_item::Column::FulfilledQuantity,
                    Value::from(item.fulfilled_quantity),
                )],
                vec![
                    (
                        order_item::Column::FulfilledQuantity,
                        Value::from(progress.fulfilled_quantity),
                    ),
                    (
                        order_item::Column::IsFulfilled,
                        Value::from(progress.is_fulfilled),
                    ),
                    (
                        order_item::Column::FulfilledAt,
                        Value::from(progress.fulfilled_at),
                    ),
                    (
                        order_item::Column::FulfillmentStatus,
                        Value::from(status.to_string()),
                    ),
                    (
                        order_item::Column::PurchaseItemId,
                        Value::from(Some(purchase.id)),
                    ),
                    (order_item::Column::UpdatedAt, Value::from(now)),
                ],
            )
            .await?;
            if !updated {
                return Err(ServiceError::ConcurrencyConflict(format!(
                    "order item {} changed during allocation",
                    item.id
                )));
            }
        }

        if plan.total_allocated > 0 {
            let allocated = purchase.allocated_quantity + plan.total_allocated;
            let status = if purchase.quantity - allocated - purchase.stocked_quantity <= 0 {
                PurchaseItemStatus::Completed.to_string()
            } else {
                purchase.status.clone()
            };
            let updated = conditional_update::<purchase_item::Entity, C>(
                conn,
                purchase.id,
                vec![
                    (
                        purchase_item::Column::AllocatedQuantity,
                        Value::from(purchase.allocated_quantity),
                    ),
                    (
                        purchase_item::Column::StockedQuantity,
                        Value::from(purchase.stocked_quantity),
                    ),
                ],
                vec![
                    (purchase_item::Column::AllocatedQuantity, Value::from(allocated)),
                    (purchase_item::Column::Status, Value::from(status)),
                    (purchase_item::Column::UpdatedAt, Value::from(now)),
                ],
            )
            .await?;
            if !updated {
                return Err(ServiceError::ConcurrencyConflict(format!(
                    "purchase item {} changed during allocation",
                    purchase.id
                )));
            }
        }

        counter!("allocation.units", plan.total_allocated.max(0) as u64);
        info!(
            purchase_item_id,
            variant_id,
            strategy = %strategy,
            allocated = plan.total_allocated,
            lines = plan.lines.len(),
            remaining = plan.remaining_quantity,
            "Backorder allocation pass finished"
        );
        Ok(result)
    }

    /// Previews an allocation of `quantity` hypothetical units without
    /// writing anything.
    #[instrument(skip(self))]
    pub async fn simulate_allocation(
        &self,
        variant_id: i64,
        quantity: i32,
        options: AllocationOptions,
    ) -> Result<AllocationResult, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "simulated quantity cannot be negative, got {}",
                quantity
            )));
        }
        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let now = Utc::now();
        let CandidateSet {
            items,
            mut candidates,
        } = load_candidates(
            &*self.db,
            CandidateFilter {
                variant_id: Some(variant_id),
                store_id: options.store_id,
            },
            false,
        )
        .await?;

        rank_candidates(&mut candidates, strategy, now);
        let plan = plan_allocation(&candidates, quantity);
        Ok(summarize(&plan, &items, None, variant_id, strategy, now))
    }

    /// Backlog statistics for a variant.
    #[instrument(skip(self))]
    pub async fn get_allocation_report(
        &self,
        variant_id: i64,
    ) -> Result<AllocationReport, ServiceError> {
        let now = Utc::now();
        let CandidateSet { mut candidates, .. } = load_candidates(
            &*self.db,
            CandidateFilter {
                variant_id: Some(variant_id),
                store_id: None,
            },
            false,
        )
        .await?;

        let mut by_customer_tier: BTreeMap<String, PriorityBucket> = BTreeMap::new();
        let mut by_order_priority: BTreeMap<String, PriorityBucket> = BTreeMap::new();
        let mut waiting_hours = Vec::with_capacity(candidates.len());
        let mut lines_past_deadline = 0;
        let mut pending_quantity = 0i64;

        for candidate in &candidates {
            let remaining = i64::from(candidate.remaining());
            pending_quantity += remaining;
            for (map, key) in [
                (&mut by_customer_tier, candidate.customer_tier.to_string()),
                (&mut by_order_priority, candidate.order_priority.to_string()),
            ] {
                let bucket = map.entry(key).or_default();
                bucket.lines += 1;
                bucket.quantity += remaining;
            }
            if candidate.deadline.map_or(false, |d| d < now) {
                lines_past_deadline += 1;
            }
            waiting_hours.push((now - candidate.order_created_at).num_hours().max(0));
        }

        let unassigned_purchase_quantity = purchase_item::Entity::find()
            .filter(purchase_item::Column::ProductVariantId.eq(variant_id))
            .filter(purchase_item::Column::Status.eq(PurchaseItemStatus::Received.to_string()))
            .all(&*self.db)
            .await?
            .iter()
            .map(|p| i64::from(p.unassigned_quantity()))
            .sum();

        rank_candidates(&mut candidates, self.default_strategy, now);

        Ok(AllocationReport {
            product_variant_id: variant_id,
            pending_lines: candidates.len(),
            pending_quantity,
            by_customer_tier,
            by_order_priority,
            lines_past_deadline,
            oldest_waiting_hours: waiting_hours.iter().max().copied(),
            average_waiting_hours: if waiting_hours.is_empty() {
                None
            } else {
                Some(waiting_hours.iter().sum::<i64>() as f64 / waiting_hours.len() as f64)
            },
            unassigned_purchase_quantity,
            next_in_line: candidates
                .iter()
                .take(REPORT_QUEUE_PREVIEW)
                .map(|c| c.order_item_id)
                .collect(),
            generated_at: now,
        })
    }

    /// Manually sets a line's priority score. The score is pinned: later
    /// recalculations leave it alone and the smart strategy uses it verbatim.
    #[instrument(skip(self, actor, reason))]
    pub async fn adjust_priority_score(
        &self,
        actor: &ActorContext,
        order_item_id: i64,
        new_score: f64,
        reason: &str,
    ) -> Result<order_item::Model, ServiceError> {
        let actor_id = actor.require()?;
        if !new_score.is_finite() {
            return Err(ServiceError::ValidationError(
                "priority score must be a finite number".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "a reason is required to override a priority score".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let item = lock_rows::<order_item::Entity, _>(&txn, &[order_item_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(format!("order item {}", order_item_id)))?;
        let old_score = item.allocation_priority_score;
        let now = Utc::now();

        allocation_priority_log::ActiveModel {
            order_item_id: Set(item.id),
            old_score: Set(old_score),
            new_score: Set(new_score),
            reason: Set(reason.trim().to_string()),
            adjusted_by: Set(actor_id),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut active: order_item::ActiveModel = item.into();
        active.allocation_priority_score = Set(Some(new_score));
        active.priority_score_overridden = Set(true);
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(order_item_id, ?old_score, new_score, actor = %actor_id, "Priority score overridden");
        self.event_sender
            .send_or_log(Event::PriorityScoreAdjusted {
                order_item_id,
                old_score,
                new_score,
                adjusted_by: actor_id,
            })
            .await;
        Ok(updated)
    }

    /// Audit trail of manual overrides for a line, oldest first.
    pub async fn priority_adjustments(
        &self,
        order_item_id: i64,
    ) -> Result<Vec<allocation_priority_log::Model>, ServiceError> {
        Ok(allocation_priority_log::Entity::find()
            .filter(allocation_priority_log::Column::OrderItemId.eq(order_item_id))
            .order_by_asc(allocation_priority_log::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Recomputes and stores the smart score of every open backorder line,
    /// skipping manually overridden ones.
    #[instrument(skip(self))]
    pub async fn recalculate_priority_scores(
        &self,
        variant_id: Option<i64>,
    ) -> Result<RecalculationSummary, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let CandidateSet { candidates, .. } = load_candidates(
            &txn,
            CandidateFilter {
                variant_id,
                store_id: None,
            },
            false,
        )
        .await?;

        let mut summary = RecalculationSummary::default();
        for candidate in &candidates {
            if candidate.score_overridden {
                summary.skipped_overridden += 1;
                continue;
            }
            let score = smart_priority_score(candidate, now);
            order_item::Entity::update_many()
                .col_expr(
                    order_item::Column::AllocationPriorityScore,
                    sea_orm::sea_query::Expr::value(score),
                )
                .filter(order_item::Column::Id.eq(candidate.order_item_id))
                .filter(order_item::Column::PriorityScoreOverridden.eq(false))
                .exec(&txn)
                .await?;
            summary.updated += 1;
        }
        txn.commit().await?;

        info!(
            ?variant_id,
            updated = summary.updated,
            skipped = summary.skipped_overridden,
            "Priority scores recalculated"
        );
        Ok(summary)
    }

    /// Cancels an order and releases its backorder allocations.
    ///
    /// Backorder lines go back to zero fulfilled units and `cancelled`; the
    /// released units are returned to the line's store inventory. Stock-sale
    /// lines keep their history. Cancelling twice is a no-op.
    #[instrument(skip(self, actor))]
    pub async fn cancel_order_backorders(
        &self,
        actor: &ActorContext,
        order_id: i64,
    ) -> Result<CancellationResult, ServiceError> {
        let actor_id = actor.require()?;
        let releasable = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::IsBackorder.eq(true))
            .filter(order_item::Column::FulfilledQuantity.gt(0))
            .all(&*self.db)
            .await?;
        InventoryService::ensure_rows(
            &self.db,
            releasable
                .iter()
                .map(|line| (line.store_id, line.product_variant_id)),
        )
        .await?;
        let service = self;

        let (result, outcomes) = self
            .concurrency
            .with_optimistic_lock(move || async move {
                let txn =
                    begin_locked_transaction(&service.db, service.concurrency.lock_wait_timeout())
                        .await?;
                let order = order::Entity::find_by_id(order_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
                if order.is_cancelled() {
                    txn.commit().await?;
                    return Ok((
                        CancellationResult {
                            order_id,
                            reverted_items: Vec::new(),
                            returned_quantity: 0,
                            already_cancelled: true,
                        },
                        Vec::<MovementOutcome>::new(),
                    ));
                }

                let ids: Vec<i64> = order_item::Entity::find()
                    .filter(order_item::Column::OrderId.eq(order_id))
                    .all(&txn)
                    .await?
                    .into_iter()
                    .map(|i| i.id)
                    .collect();
                let lines = lock_rows::<order_item::Entity, _>(&txn, &ids).await?;
                let now = Utc::now();

                let mut reverted_items = Vec::new();
                let mut movements = Vec::new();
                let mut returned_quantity = 0;
                for line in lines.into_iter().filter(|l| l.is_backorder) {
                    let released = line.fulfilled_quantity.max(0);
                    if released > 0 {
                        returned_quantity += released;
                        movements.push(StockMovement {
                            store_id: line.store_id,
                            variant_id: line.product_variant_id,
                            delta: released,
                        });
                    }
                    reverted_items.push(line.id);

                    let mut active: order_item::ActiveModel = line.into();
                    active.fulfilled_quantity = Set(0);
                    active.is_fulfilled = Set(false);
                    active.fulfilled_at = Set(None);
                    active.fulfillment_status = Set(FulfillmentStatus::Cancelled.to_string());
                    active.updated_at = Set(now);
                    active.update(&txn).await?;
                }

                let outcomes = InventoryService::apply_movements_in(
                    &txn,
                    &movements,
                    &MovementContext {
                        kind: TransactionType::Return,
                        actor_id,
                        meta: MovementMeta::reference("order", order_id)
                            .with_notes("released by order cancellation"),
                    },
                )
                .await?;

                let mut active: order::ActiveModel = order.into();
                active.status = Set(OrderStatus::Cancelled.to_string());
                active.updated_at = Set(now);
                active.update(&txn).await?;
                txn.commit().await?;

                Ok((
                    CancellationResult {
                        order_id,
                        reverted_items,
                        returned_quantity,
                        already_cancelled: false,
                    },
                    outcomes,
                ))
            })
            .await?;

        if !result.already_cancelled {
            info!(
                order_id,
                lines = result.reverted_items.len(),
                returned = result.returned_quantity,
                "Order backorders cancelled"
            );
        }
        self.inventory.notify_movements(&outcomes).await;
        Ok(result)
    }

    async fn find_purchase_item(&self, id: i64) -> Result<purchase_item::Model, ServiceError> {
        purchase_item::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("purchase item {}", id)))
    }

    async fn notify_allocation(&self, result: &AllocationResult) {
        if result.total_allocated == 0 {
            return;
        }
        self.event_sender
            .send_or_log(Event::BackordersAllocated {
                purchase_item_id: result.purchase_item_id,
                product_variant_id: result.product_variant_id,
                total_allocated: result.total_allocated,
                order_item_ids: result
                    .allocated_items
                    .iter()
                    .map(|a| a.order_item_id)
                    .collect(),
            })
            .await;
    }
}
