#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use multistore_inventory::{
    auth::ActorContext,
    concurrency::{InMemoryLockBackend, LockBackend},
    config::{AppConfig, ConcurrencyConfig},
    db::{self, DbPool},
    entities::{
        customer, inventory_transaction,
        order::{self, OrderPriority, OrderStatus},
        order_item::{self, FulfillmentStatus},
        purchase_item::{self, PurchaseItemStatus},
        store,
    },
    events::{Event, EventSender},
    InventoryEngine,
};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine wired to a private in-memory SQLite database and lock table.
pub struct TestContext {
    pub engine: InventoryEngine,
    pub db: Arc<DbPool>,
    pub actor: ActorContext,
    events: mpsc::Receiver<Event>,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "redis://127.0.0.1:6379".to_string(),
        "test".to_string(),
    );
    // One connection keeps the in-memory database alive and shared.
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.db_acquire_timeout_secs = 30;
    cfg.event_channel_capacity = 4_096;
    cfg.concurrency = ConcurrencyConfig {
        max_attempts: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 50,
        lock_ttl_secs: 10,
        lock_wait_timeout_ms: 5_000,
    };
    cfg
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = test_config();
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("migrations failed");

        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let (sender, events) = EventSender::channel(cfg.event_channel_capacity);
        let engine = InventoryEngine::from_parts(Arc::new(pool), &cfg, backend, sender);

        Self {
            db: engine.db.clone(),
            engine,
            actor: ActorContext::authenticated(Uuid::new_v4()),
            events,
        }
    }

    /// Events emitted so far, in order.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn create_store(&self, name: &str, coordinates: Option<(f64, f64)>) -> store::Model {
        let now = Utc::now();
        store::ActiveModel {
            name: Set(name.to_string()),
            latitude: Set(coordinates.map(|c| c.0)),
            longitude: Set(coordinates.map(|c| c.1)),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("insert store")
    }

    pub async fn create_customer(&self, name: &str, tier: &str) -> customer::Model {
        customer::ActiveModel {
            name: Set(name.to_string()),
            priority_tier: Set(tier.to_string()),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("insert customer")
    }

    pub async fn create_order(
        &self,
        store_id: i64,
        customer_id: Option<i64>,
        priority: OrderPriority,
        age: Duration,
    ) -> order::Model {
        let created_at: DateTime<Utc> = Utc::now() - age;
        order::ActiveModel {
            order_number: Set(format!("ORD-{}", Uuid::new_v4().simple())),
            customer_id: Set(customer_id),
            store_id: Set(store_id),
            status: Set(OrderStatus::Pending.to_string()),
            priority: Set(priority.to_string()),
            sales_channel: Set(None),
            expected_delivery_date: Set(None),
            created_at: Set(created_at),
            updated_at: Set(created_at),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("insert order")
    }

    async fn insert_item(
        &self,
        order: &order::Model,
        variant_id: i64,
        quantity: i32,
        is_backorder: bool,
    ) -> order_item::Model {
        let status = if is_backorder {
            FulfillmentStatus::Backordered
        } else {
            FulfillmentStatus::Pending
        };
        order_item::ActiveModel {
            order_id: Set(order.id),
            product_variant_id: Set(variant_id),
            store_id: Set(order.store_id),
            quantity: Set(quantity),
            fulfilled_quantity: Set(0),
            is_stocked_sale: Set(!is_backorder),
            is_backorder: Set(is_backorder),
            is_custom: Set(false),
            is_fulfilled: Set(false),
            fulfilled_at: Set(None),
            fulfillment_status: Set(status.to_string()),
            purchase_item_id: Set(None),
            allocation_priority_score: Set(None),
            priority_score_overridden: Set(false),
            priority_deadline: Set(None),
            created_at: Set(order.created_at),
            updated_at: Set(order.created_at),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("insert order item")
    }

    pub async fn create_backorder_item(
        &self,
        order: &order::Model,
        variant_id: i64,
        quantity: i32,
    ) -> order_item::Model {
        self.insert_item(order, variant_id, quantity, true).await
    }

    pub async fn create_stock_item(
        &self,
        order: &order::Model,
        variant_id: i64,
        quantity: i32,
    ) -> order_item::Model {
        self.insert_item(order, variant_id, quantity, false).await
    }

    pub async fn create_purchase_item(
        &self,
        variant_id: i64,
        store_id: i64,
        quantity: i32,
        status: PurchaseItemStatus,
    ) -> purchase_item::Model {
        let now = Utc::now();
        purchase_item::ActiveModel {
            product_variant_id: Set(variant_id),
            store_id: Set(store_id),
            quantity: Set(quantity),
            allocated_quantity: Set(0),
            stocked_quantity: Set(0),
            status: Set(status.to_string()),
            received_at: Set((status != PurchaseItemStatus::Ordered).then_some(now)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("insert purchase item")
    }

    /// Seeds an absolute stock level through the service.
    pub async fn set_stock(&self, variant_id: i64, store_id: i64, quantity: i32) {
        self.engine
            .inventory
            .set_stock_level(&self.actor, variant_id, store_id, quantity, Some("seed".into()))
            .await
            .expect("seed stock");
    }

    pub async fn stock(&self, variant_id: i64, store_id: i64) -> i32 {
        self.engine
            .inventory
            .repository()
            .find_by_variant_and_store(variant_id, store_id)
            .await
            .expect("read stock")
            .map(|row| row.quantity)
            .unwrap_or(0)
    }

    pub async fn order_item(&self, id: i64) -> order_item::Model {
        order_item::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("read order item")
            .expect("order item exists")
    }

    pub async fn purchase_item(&self, id: i64) -> purchase_item::Model {
        purchase_item::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("read purchase item")
            .expect("purchase item exists")
    }

    pub async fn ledger(&self, variant_id: i64, store_id: i64) -> Vec<inventory_transaction::Model> {
        inventory_transaction::Entity::find()
            .filter(inventory_transaction::Column::ProductVariantId.eq(variant_id))
            .filter(inventory_transaction::Column::StoreId.eq(store_id))
            .order_by_asc(inventory_transaction::Column::Id)
            .all(&*self.db)
            .await
            .expect("read ledger")
    }
}
