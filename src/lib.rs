//! Multi-store inventory allocation engine
//!
//! Concurrency-safe stock mutation over an append-only ledger, priority-driven
//! allocation of supplier stock to backorders, and distance-ranked transfer
//! recommendations between stores.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod repositories;
pub mod services;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::concurrency::{ConcurrencyHelper, InMemoryLockBackend, LockBackend, RedisLockBackend};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::{BackorderAllocationService, InventoryService, StockTransferService};

/// Namespace prefixed to every distributed lock and counter key.
pub const LOCK_NAMESPACE: &str = "multistore-inventory";

pub mod prelude {
    pub use crate::auth::ActorContext;
    pub use crate::config::AppConfig;
    pub use crate::errors::ServiceError;
    pub use crate::events::Event;
    pub use crate::services::{
        AllocationOptions, AllocationStrategy, MovementMeta, StockLine,
    };
    pub use crate::InventoryEngine;
}

/// The wired set of services sharing one pool, lock backend and
/// notification channel.
#[derive(Clone, Debug)]
pub struct InventoryEngine {
    pub db: Arc<DbPool>,
    pub concurrency: ConcurrencyHelper,
    pub event_sender: Arc<EventSender>,
    pub inventory: Arc<InventoryService>,
    pub transfers: Arc<StockTransferService>,
    pub allocation: Arc<BackorderAllocationService>,
}

impl InventoryEngine {
    /// Connects to the database, optionally migrates, selects the lock
    /// backend and opens the notification channel. The caller owns the
    /// receiving end.
    pub async fn connect(config: &AppConfig) -> Result<(Self, mpsc::Receiver<Event>), ServiceError> {
        let pool = db::establish_connection_from_app_config(config).await?;
        if config.auto_migrate {
            db::run_migrations(&pool).await?;
        }

        let backend: Arc<dyn LockBackend> = if config.uses_redis_locks() {
            Arc::new(RedisLockBackend::connect(config.redis_url(), LOCK_NAMESPACE).await?)
        } else {
            Arc::new(InMemoryLockBackend::new())
        };

        let (sender, rx) = EventSender::channel(config.event_channel_capacity);
        let engine = Self::from_parts(Arc::new(pool), config, backend, sender);
        info!(
            lock_backend = %config.lock_backend,
            strategy = %config.allocation.default_strategy,
            "Inventory engine ready"
        );
        Ok((engine, rx))
    }

    /// Wires the services around already-built infrastructure.
    pub fn from_parts(
        db: Arc<DbPool>,
        config: &AppConfig,
        backend: Arc<dyn LockBackend>,
        event_sender: EventSender,
    ) -> Self {
        let concurrency = ConcurrencyHelper::new(backend, &config.concurrency);
        let event_sender = Arc::new(event_sender);
        let transfers = Arc::new(StockTransferService::new(db.clone()));
        let inventory = Arc::new(InventoryService::new(
            db.clone(),
            event_sender.clone(),
            concurrency.clone(),
            transfers.clone(),
            config.inventory.clone(),
        ));
        let allocation = Arc::new(BackorderAllocationService::new(
            db.clone(),
            concurrency.clone(),
            inventory.clone(),
            event_sender.clone(),
            config.allocation.default_strategy,
        ));

        Self {
            db,
            concurrency,
            event_sender,
            inventory,
            transfers,
            allocation,
        }
    }
}
