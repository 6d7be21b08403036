mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use common::TestContext;
use multistore_inventory::{
    entities::{
        order::OrderPriority,
        order_item::FulfillmentStatus,
        stock_transfer::{self, TransferStatus},
        store,
    },
    errors::ServiceError,
    events::Event,
};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

const VARIANT: i64 = 310;
const NEW_YORK: (f64, f64) = (40.7128, -74.0060);
const PHILADELPHIA: (f64, f64) = (39.9526, -75.1652);
const LOS_ANGELES: (f64, f64) = (34.0522, -118.2437);

#[tokio::test]
async fn sources_fall_back_to_quantity_order_without_coordinates() {
    let ctx = TestContext::new().await;
    let target = ctx.create_store("Target", None).await;
    let small = ctx.create_store("Small", Some(PHILADELPHIA)).await;
    let large = ctx.create_store("Large", None).await;
    ctx.set_stock(VARIANT, small.id, 5).await;
    ctx.set_stock(VARIANT, large.id, 20).await;

    let options = ctx
        .engine
        .transfers
        .find_optimal_transfer_stores(target.id, VARIANT, 8)
        .await
        .unwrap();

    let order: Vec<i64> = options.iter().map(|o| o.store_id).collect();
    assert_eq!(order, vec![large.id, small.id]);
    assert_eq!(options[0].suggested_qty, 8);
    assert_eq!(options[1].suggested_qty, 0);
    assert!(options.iter().all(|o| o.distance_km.is_none()));
}

#[tokio::test]
async fn nearest_source_is_ranked_first() {
    let ctx = TestContext::new().await;
    let target = ctx.create_store("Manhattan", Some(NEW_YORK)).await;
    let far = ctx.create_store("LA", Some(LOS_ANGELES)).await;
    let near = ctx.create_store("Philly", Some(PHILADELPHIA)).await;
    ctx.set_stock(VARIANT, far.id, 50).await;
    ctx.set_stock(VARIANT, near.id, 3).await;

    let options = ctx
        .engine
        .transfers
        .find_optimal_transfer_stores(target.id, VARIANT, 5)
        .await
        .unwrap();

    assert_eq!(options[0].store_id, near.id);
    assert_eq!(options[0].suggested_qty, 3);
    assert_eq!(options[1].store_id, far.id);
    assert_eq!(options[1].suggested_qty, 2);
    let near_km = options[0].distance_km.unwrap();
    let far_km = options[1].distance_km.unwrap();
    assert!(near_km > 100.0 && near_km < 150.0, "got {}", near_km);
    assert!(far_km > 3_900.0);
}

#[tokio::test]
async fn target_empty_and_inactive_stores_are_excluded() {
    let ctx = TestContext::new().await;
    let target = ctx.create_store("Target", None).await;
    let empty = ctx.create_store("Empty", None).await;
    let closed = ctx.create_store("Closed", None).await;
    let open = ctx.create_store("Open", None).await;
    ctx.set_stock(VARIANT, target.id, 40).await;
    ctx.set_stock(VARIANT, empty.id, 0).await;
    ctx.set_stock(VARIANT, closed.id, 9).await;
    ctx.set_stock(VARIANT, open.id, 2).await;

    let mut closed_active: store::ActiveModel = closed.into();
    closed_active.is_active = Set(false);
    closed_active.update(&*ctx.db).await.unwrap();

    let suggestion = ctx
        .engine
        .transfers
        .get_transfer_options_for_stock_suggestion(VARIANT, target.id, 5)
        .await
        .unwrap();

    assert_eq!(suggestion.options.len(), 1);
    assert_eq!(suggestion.options[0].store_id, open.id);
    assert_eq!(suggestion.coverable_quantity, 2);
    assert!(!suggestion.fully_coverable);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let ctx = TestContext::new().await;
    let target = ctx.create_store("Target", None).await;

    let result = ctx
        .engine
        .transfers
        .find_optimal_transfer_stores(target.id, VARIANT, 0)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let result = ctx
        .engine
        .transfers
        .find_optimal_transfer_stores(777, VARIANT, 3)
        .await;
    assert_matches!(result, Err(ServiceError::InvalidStore(777)));
}

#[tokio::test]
async fn automated_transfer_is_requested_from_best_source() {
    let mut ctx = TestContext::new().await;
    let target = ctx.create_store("Target", Some(NEW_YORK)).await;
    let source = ctx.create_store("Source", Some(PHILADELPHIA)).await;
    ctx.set_stock(VARIANT, source.id, 10).await;
    let order = ctx
        .create_order(target.id, None, OrderPriority::Normal, Duration::hours(1))
        .await;
    let line = ctx.create_stock_item(&order, VARIANT, 3).await;
    ctx.drain_events();

    let requested = ctx
        .engine
        .inventory
        .initiate_automated_transfer(&ctx.actor, line.id, target.id)
        .await
        .unwrap();
    assert!(requested);

    let transfers = stock_transfer::Entity::find().all(&*ctx.db).await.unwrap();
    assert_eq!(transfers.len(), 1);
    let transfer = &transfers[0];
    assert_eq!(transfer.from_store_id, source.id);
    assert_eq!(transfer.to_store_id, target.id);
    assert_eq!(transfer.quantity, 3);
    assert_eq!(transfer.status, TransferStatus::Pending.to_string());
    assert_eq!(transfer.order_item_id, Some(line.id));
    assert_eq!(transfer.requested_by, ctx.actor.user_id.unwrap());
    assert!(transfer.distance_km.is_some());

    assert_eq!(
        ctx.order_item(line.id).await.status(),
        Some(FulfillmentStatus::TransferPending)
    );
    assert_matches!(
        ctx.drain_events().as_slice(),
        [Event::TransferRequested { quantity: 3, .. }]
    );
    // Stock moves only when the transfer is executed.
    assert_eq!(ctx.stock(VARIANT, source.id).await, 10);
}

#[tokio::test]
async fn insufficient_sources_backorder_the_line() {
    let ctx = TestContext::new().await;
    let target = ctx.create_store("Target", None).await;
    let source = ctx.create_store("Source", None).await;
    ctx.set_stock(VARIANT, source.id, 2).await;
    let order = ctx
        .create_order(target.id, None, OrderPriority::Normal, Duration::hours(1))
        .await;
    let line = ctx.create_stock_item(&order, VARIANT, 6).await;

    let requested = ctx
        .engine
        .inventory
        .initiate_automated_transfer(&ctx.actor, line.id, target.id)
        .await
        .unwrap();
    assert!(!requested);

    let line = ctx.order_item(line.id).await;
    assert!(line.is_backorder);
    assert_eq!(line.status(), Some(FulfillmentStatus::Backordered));
    assert!(stock_transfer::Entity::find()
        .all(&*ctx.db)
        .await
        .unwrap()
        .is_empty());
}
