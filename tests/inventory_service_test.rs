mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestContext;
use multistore_inventory::{
    auth::ActorContext,
    concurrency::{conditional_update, with_pessimistic_lock},
    entities::{inventory, inventory_transaction::TransactionType},
    errors::ServiceError,
    events::Event,
    repositories::InventoryRepository,
    services::{MovementMeta, StockLine},
};
use rstest::rstest;
use sea_orm::{TransactionTrait, Value};

const VARIANT: i64 = 501;

#[tokio::test]
async fn deduct_beyond_stock_is_rejected_without_side_effects() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 5).await;

    let result = ctx
        .engine
        .inventory
        .deduct_stock(&ctx.actor, VARIANT, 10, Some(store.id), MovementMeta::default())
        .await;

    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock {
            requested: 10,
            available: 5,
            ..
        })
    );
    assert_eq!(ctx.stock(VARIANT, store.id).await, 5);
    // Only the seeding adjustment is in the ledger.
    assert_eq!(ctx.ledger(VARIANT, store.id).await.len(), 1);
}

#[tokio::test]
async fn movements_are_mirrored_in_the_ledger() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 10).await;

    let inventory = &ctx.engine.inventory;
    inventory
        .deduct_stock(
            &ctx.actor,
            VARIANT,
            3,
            Some(store.id),
            MovementMeta::reference("order", 77),
        )
        .await
        .unwrap();
    inventory
        .return_stock(
            &ctx.actor,
            VARIANT,
            2,
            Some(store.id),
            MovementMeta::note("customer return"),
        )
        .await
        .unwrap();

    assert_eq!(ctx.stock(VARIANT, store.id).await, 9);

    let ledger = ctx.ledger(VARIANT, store.id).await;
    let kinds: Vec<String> = ledger.iter().map(|t| t.transaction_type.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            TransactionType::Adjustment.to_string(),
            TransactionType::Deduct.to_string(),
            TransactionType::Return.to_string(),
        ]
    );
    for entry in &ledger {
        assert_eq!(entry.before_quantity + entry.quantity, entry.after_quantity);
        assert!(entry.after_quantity >= 0);
        assert_eq!(entry.created_by, ctx.actor.user_id.unwrap());
    }
    for pair in ledger.windows(2) {
        assert_eq!(pair[0].after_quantity, pair[1].before_quantity);
    }
    assert_eq!(ledger[1].reference_type.as_deref(), Some("order"));
    assert_eq!(ledger[1].reference_id, Some(77));
    assert_eq!(ledger[2].notes.as_deref(), Some("customer return"));
    assert_eq!(ledger.last().unwrap().after_quantity, 9);
}

#[tokio::test]
async fn batch_deduct_is_all_or_nothing() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(1, store.id, 10).await;
    ctx.set_stock(2, store.id, 1).await;

    let result = ctx
        .engine
        .inventory
        .batch_deduct_stock(
            &ctx.actor,
            &[StockLine::stocked(1, 5), StockLine::stocked(2, 3)],
            Some(store.id),
            MovementMeta::default(),
        )
        .await;

    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock { variant_id: 2, .. })
    );
    assert_eq!(ctx.stock(1, store.id).await, 10);
    assert_eq!(ctx.stock(2, store.id).await, 1);
}

#[tokio::test]
async fn batch_ignores_lines_that_are_not_stocked_sales() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(1, store.id, 4).await;

    let lines = [
        StockLine::stocked(1, 4),
        StockLine {
            variant_id: 2,
            quantity: 100,
            is_stocked_sale: false,
        },
    ];
    let ok = ctx
        .engine
        .inventory
        .batch_deduct_stock(&ctx.actor, &lines, Some(store.id), MovementMeta::default())
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(ctx.stock(1, store.id).await, 0);
    assert!(ctx.ledger(2, store.id).await.is_empty());

    ctx.engine
        .inventory
        .batch_return_stock(&ctx.actor, &lines, Some(store.id), MovementMeta::default())
        .await
        .unwrap();
    assert_eq!(ctx.stock(1, store.id).await, 4);
}

#[tokio::test]
async fn batch_nets_repeated_variants() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(1, store.id, 5).await;

    let result = ctx
        .engine
        .inventory
        .batch_deduct_stock(
            &ctx.actor,
            &[StockLine::stocked(1, 3), StockLine::stocked(1, 3)],
            Some(store.id),
            MovementMeta::default(),
        )
        .await;
    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock {
            requested: 6,
            available: 5,
            ..
        })
    );
}

#[tokio::test]
async fn mutations_require_an_authenticated_actor() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    let anonymous = ActorContext::anonymous();

    let result = ctx
        .engine
        .inventory
        .return_stock(&anonymous, VARIANT, 5, Some(store.id), MovementMeta::default())
        .await;
    assert_matches!(result, Err(ServiceError::AuthenticationRequired));

    let result = ctx
        .engine
        .inventory
        .set_stock_level(&anonymous, VARIANT, store.id, 5, None)
        .await;
    assert_matches!(result, Err(ServiceError::AuthenticationRequired));
    assert!(ctx.ledger(VARIANT, store.id).await.is_empty());
}

#[tokio::test]
async fn missing_store_configuration_is_an_error() {
    let ctx = TestContext::new().await;

    let result = ctx
        .engine
        .inventory
        .deduct_stock(&ctx.actor, VARIANT, 1, None, MovementMeta::default())
        .await;
    assert_matches!(result, Err(ServiceError::NoStoreConfigured));

    let result = ctx.engine.inventory.check_stock(VARIANT, 1, Some(999)).await;
    assert_matches!(result, Err(ServiceError::InvalidStore(999)));
}

#[tokio::test]
async fn omitted_store_resolves_to_earliest_active_store() {
    let ctx = TestContext::new().await;
    let first = ctx.create_store("First", None).await;
    let _second = ctx.create_store("Second", None).await;

    ctx.engine
        .inventory
        .return_stock(&ctx.actor, VARIANT, 3, None, MovementMeta::default())
        .await
        .unwrap();
    assert_eq!(ctx.stock(VARIANT, first.id).await, 3);
}

#[tokio::test]
async fn configured_default_store_wins() {
    let ctx = TestContext::with_config(|cfg| cfg.inventory.default_store_id = Some(2)).await;
    let _first = ctx.create_store("First", None).await;
    let second = ctx.create_store("Second", None).await;
    assert_eq!(second.id, 2);

    assert_eq!(ctx.engine.inventory.resolve_store(None).await.unwrap(), 2);
}

#[rstest]
#[case::zero(0)]
#[case::negative(-4)]
#[tokio::test]
async fn non_positive_quantities_are_rejected(#[case] qty: i32) {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;

    let result = ctx
        .engine
        .inventory
        .deduct_stock(&ctx.actor, VARIANT, qty, Some(store.id), MovementMeta::default())
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let result = ctx
        .engine
        .inventory
        .return_stock(&ctx.actor, VARIANT, qty, Some(store.id), MovementMeta::default())
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert!(ctx.ledger(VARIANT, store.id).await.is_empty());
}

#[tokio::test]
async fn negative_stock_level_is_rejected() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;

    let result = ctx
        .engine
        .inventory
        .set_stock_level(&ctx.actor, VARIANT, store.id, -1, None)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn concurrent_deductions_never_oversell() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let inventory = ctx.engine.inventory.clone();
        let actor = ctx.actor;
        let store_id = store.id;
        tasks.push(tokio::spawn(async move {
            inventory
                .deduct_stock(&actor, VARIANT, 1, Some(store_id), MovementMeta::default())
                .await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(true) => succeeded += 1,
            Err(ServiceError::InsufficientStock { .. }) => rejected += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    assert_eq!(succeeded, 10, "exactly 10 deductions should succeed");
    assert_eq!(rejected, 10);
    assert_eq!(ctx.stock(VARIANT, store.id).await, 0);
    assert_eq!(ctx.ledger(VARIANT, store.id).await.len(), 11);
}

#[tokio::test]
async fn stock_checks_are_read_only() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(1, store.id, 4).await;

    let inventory = &ctx.engine.inventory;
    assert!(inventory.check_stock(1, 4, Some(store.id)).await.unwrap());
    assert!(!inventory.check_stock(1, 5, Some(store.id)).await.unwrap());
    assert!(!inventory.check_stock(2, 1, Some(store.id)).await.unwrap());

    let availability = inventory
        .batch_check_stock(
            &[StockLine::stocked(1, 2), StockLine::stocked(2, 1)],
            Some(store.id),
        )
        .await
        .unwrap();
    assert!(availability[0].is_available);
    assert_eq!(availability[1].available, 0);
    assert!(!availability[1].is_available);
    assert!(ctx.ledger(2, store.id).await.is_empty());
}

#[tokio::test]
async fn time_series_replays_the_ledger() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    let other = ctx.create_store("Other", None).await;
    ctx.set_stock(VARIANT, store.id, 10).await;
    ctx.set_stock(VARIANT, other.id, 4).await;
    ctx.engine
        .inventory
        .deduct_stock(&ctx.actor, VARIANT, 3, Some(store.id), MovementMeta::default())
        .await
        .unwrap();

    let today = Utc::now().date_naive();
    let from = today - Duration::days(2);

    let single = ctx
        .engine
        .inventory
        .get_inventory_time_series(VARIANT, from, today, Some(store.id))
        .await
        .unwrap();
    let values: Vec<i64> = single.iter().map(|p| p.quantity).collect();
    assert_eq!(values, vec![0, 0, 7]);

    let all = ctx
        .engine
        .inventory
        .get_inventory_time_series(VARIANT, today, today, None)
        .await
        .unwrap();
    assert_eq!(all[0].quantity, 11);

    let inverted = ctx
        .engine
        .inventory
        .get_inventory_time_series(VARIANT, today, from, None)
        .await;
    assert_matches!(inverted, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn threshold_crossings_emit_notifications() {
    let mut ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.engine
        .inventory
        .set_low_stock_threshold(&ctx.actor, VARIANT, store.id, 3)
        .await
        .unwrap();
    ctx.set_stock(VARIANT, store.id, 5).await;
    ctx.drain_events();

    let inventory = ctx.engine.inventory.clone();
    inventory
        .deduct_stock(&ctx.actor, VARIANT, 3, Some(store.id), MovementMeta::default())
        .await
        .unwrap();
    let events = ctx.drain_events();
    assert_matches!(
        events.as_slice(),
        [Event::LowStock {
            quantity: 2,
            threshold: 3,
            ..
        }]
    );

    inventory
        .deduct_stock(&ctx.actor, VARIANT, 2, Some(store.id), MovementMeta::default())
        .await
        .unwrap();
    let events = ctx.drain_events();
    assert_matches!(events.as_slice(), [Event::StockExhausted { .. }]);

    let report = inventory.low_stock_report(Some(store.id)).await.unwrap();
    assert!(report.low_stock.is_empty());
    assert_eq!(report.out_of_stock.len(), 1);
}

#[tokio::test]
async fn large_movements_are_flagged() {
    let mut ctx = TestContext::with_config(|cfg| cfg.inventory.anomaly_quantity_threshold = 50).await;
    let store = ctx.create_store("Main", None).await;

    ctx.engine
        .inventory
        .return_stock(&ctx.actor, VARIANT, 80, Some(store.id), MovementMeta::default())
        .await
        .unwrap();
    let events = ctx.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::AnomalyDetected { movement: 80, .. })));
}

#[tokio::test]
async fn set_stock_level_records_adjustment_delta() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 12).await;

    let row = ctx
        .engine
        .inventory
        .set_stock_level(&ctx.actor, VARIANT, store.id, 7, Some("cycle count".into()))
        .await
        .unwrap();
    assert_eq!(row.quantity, 7);

    let ledger = ctx.ledger(VARIANT, store.id).await;
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[1].quantity, -5);
    assert_eq!(ledger[1].notes.as_deref(), Some("cycle count"));

    // Same level again is a no-op.
    ctx.engine
        .inventory
        .set_stock_level(&ctx.actor, VARIANT, store.id, 7, None)
        .await
        .unwrap();
    assert_eq!(ctx.ledger(VARIANT, store.id).await.len(), 2);
}

#[tokio::test]
async fn detached_variants_leave_orphaned_rows() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 6).await;

    let detached = ctx
        .engine
        .inventory
        .detach_variant(&ctx.actor, VARIANT)
        .await
        .unwrap();
    assert_eq!(detached, 1);

    let orphans = ctx.engine.inventory.get_orphaned_items().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert!(orphans[0].product_variant_id.is_none());
    assert_eq!(orphans[0].quantity, 6);

    // History survives the catalogue removal.
    assert_eq!(ctx.ledger(VARIANT, store.id).await.len(), 1);
}

#[tokio::test]
async fn time_series_before_first_movement_uses_opening_balance() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 10).await;

    let today = Utc::now().date_naive();
    let series = ctx
        .engine
        .inventory
        .get_inventory_time_series(
            VARIANT,
            today - Duration::days(5),
            today - Duration::days(1),
            Some(store.id),
        )
        .await
        .unwrap();

    let values: Vec<i64> = series.iter().map(|p| p.quantity).collect();
    assert_eq!(values, vec![0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn return_into_unknown_pair_creates_the_row() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;

    ctx.engine
        .inventory
        .return_stock(&ctx.actor, VARIANT, 3, Some(store.id), MovementMeta::default())
        .await
        .unwrap();

    assert_eq!(ctx.stock(VARIANT, store.id).await, 3);
    let ledger = ctx.ledger(VARIANT, store.id).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].before_quantity, 0);
    assert_eq!(ledger[0].after_quantity, 3);
}

#[tokio::test]
async fn repository_lookups_and_row_locks() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    let other = ctx.create_store("Other", None).await;
    ctx.set_stock(1, store.id, 2).await;
    ctx.set_stock(2, store.id, 8).await;
    ctx.set_stock(3, store.id, 0).await;
    ctx.set_stock(1, other.id, 1).await;

    let repository = ctx.engine.inventory.repository();
    let first = repository
        .find_by_variant_and_store(1, store.id)
        .await
        .unwrap()
        .unwrap();
    let second = repository
        .find_by_variant_and_store(2, store.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repository.find(first.id).await.unwrap(), Some(first.clone()));
    assert_eq!(repository.find(i64::MAX).await.unwrap(), None);

    let below = repository
        .get_items_below_threshold(5, Some(store.id))
        .await
        .unwrap();
    let quantities: Vec<i32> = below.iter().map(|row| row.quantity).collect();
    assert_eq!(quantities, vec![0, 2]);
    let everywhere = repository.get_items_below_threshold(5, None).await.unwrap();
    assert_eq!(everywhere.len(), 3);

    let txn = ctx.db.begin().await.unwrap();
    let locked = InventoryRepository::lock_for_update(&txn, first.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(locked.quantity, 2);
    let by_pair = InventoryRepository::lock_by_variant_and_store(&txn, 2, store.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_pair.id, second.id);
    assert!(InventoryRepository::lock_by_variant_and_store(&txn, 99, store.id)
        .await
        .unwrap()
        .is_none());

    let many = InventoryRepository::lock_multiple_for_update(&txn, &[second.id, first.id])
        .await
        .unwrap();
    let ids: Vec<i64> = many.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![first.id.min(second.id), first.id.max(second.id)]);
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn conditional_update_only_applies_on_match() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    ctx.set_stock(VARIANT, store.id, 6).await;
    let row = ctx
        .engine
        .inventory
        .repository()
        .find_by_variant_and_store(VARIANT, store.id)
        .await
        .unwrap()
        .unwrap();

    let txn = ctx.db.begin().await.unwrap();
    let applied = with_pessimistic_lock::<inventory::Entity, _, _, _, _>(
        &txn,
        &[row.id],
        |rows| {
            let txn = &txn;
            async move {
                assert_eq!(rows.len(), 1);
                let current = &rows[0];
                let stale = conditional_update::<inventory::Entity, _>(
                    txn,
                    current.id,
                    vec![(inventory::Column::Version, Value::from(current.version + 7))],
                    vec![(inventory::Column::Quantity, Value::from(0))],
                )
                .await?;
                assert!(!stale);
                conditional_update::<inventory::Entity, _>(
                    txn,
                    current.id,
                    vec![(inventory::Column::Version, Value::from(current.version))],
                    vec![
                        (inventory::Column::Quantity, Value::from(4)),
                        (inventory::Column::Version, Value::from(current.version + 1)),
                    ],
                )
                .await
            }
        },
    )
    .await
    .unwrap();
    assert!(applied);
    txn.commit().await.unwrap();

    assert_eq!(ctx.stock(VARIANT, store.id).await, 4);
}

#[tokio::test]
async fn opposite_order_batches_do_not_deadlock() {
    let ctx = TestContext::new().await;
    let store = ctx.create_store("Main", None).await;
    for variant in [1, 2, 3] {
        ctx.set_stock(variant, store.id, 10).await;
    }

    let forward = [
        StockLine::stocked(1, 1),
        StockLine::stocked(2, 1),
        StockLine::stocked(3, 1),
    ];
    let backward = [
        StockLine::stocked(3, 1),
        StockLine::stocked(2, 1),
        StockLine::stocked(1, 1),
    ];

    let mut tasks = Vec::new();
    for round in 0..10 {
        let inventory = ctx.engine.inventory.clone();
        let actor = ctx.actor;
        let store_id = store.id;
        let lines = if round % 2 == 0 { forward } else { backward };
        tasks.push(tokio::spawn(async move {
            inventory
                .batch_deduct_stock(&actor, &lines, Some(store_id), MovementMeta::default())
                .await
        }));
    }

    let outcomes = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        outcomes
    })
    .await
    .expect("batches finished");

    for outcome in outcomes {
        assert_matches!(outcome, Ok(true));
    }
    for variant in [1, 2, 3] {
        assert_eq!(ctx.stock(variant, store.id).await, 0);
        let ledger = ctx.ledger(variant, store.id).await;
        assert_eq!(ledger.len(), 11);
        assert!(ledger
            .windows(2)
            .all(|w| w[1].before_quantity == w[0].after_quantity));
    }
}
