//! Worker healing paths: stuck sells, stale buys, phantom positions, and
//! bootstrap, each exercised against the mock broker end to end.

mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{age_order, cancel_event, default_asset, fast_settings, fill_event, quote, test_context};
use ladder::application::workers::bootstrap::Bootstrapper;
use ladder::application::workers::consistency::ConsistencyChecker;
use ladder::application::workers::order_janitor::OrderJanitor;
use ladder::application::workers::stuck_sells::StuckSellSweeper;
use ladder::domain::entities::cycle::CycleStatus;
use ladder::domain::entities::order::OrderState;
use ladder::persistence::models::NewAsset;

#[tokio::test]
async fn test_stuck_sell_recovery_keeps_position() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    // Build a held position and a sell that went out and hung.
    ctx.runtime
        .handle_quote(quote("BTC/USD", dec!(49999), dec!(50000)))
        .await
        .unwrap();
    let placed = ctx.broker.placed_orders();
    ctx.runtime
        .handle_trade_update(&fill_event(&placed[0], dec!(0.001208), dec!(49665)))
        .await
        .unwrap();

    ctx.runtime
        .handle_quote(quote("BTC/USD", dec!(50420), dec!(50421)))
        .await
        .unwrap();
    let placed = ctx.broker.placed_orders();
    assert_eq!(placed.len(), 2);
    let sell_order = placed[1].clone();

    let cycle = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Selling);

    // 90 seconds later the sell is still just accepted at the broker.
    age_order(&ctx.pool, cycle.id, 90).await;
    ctx.broker.set_order_state(&sell_order.id, OrderState::Accepted);

    let sweeper = StuckSellSweeper::new(ctx.deps.clone());
    sweeper.run_once().await.unwrap();
    assert_eq!(ctx.broker.canceled_ids(), vec![sell_order.id.clone()]);

    // The broker cancels; the position is still held in full.
    ctx.broker.set_position("BTC/USD", dec!(0.001208));
    ctx.runtime
        .handle_trade_update(&cancel_event(&sell_order))
        .await
        .unwrap();

    let cycle = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert_eq!(cycle.quantity, dec!(0.001208));
    assert!(cycle.latest_order_id.is_none());
    assert!(cycle.latest_order_created_at.is_none());

    // No rollover happened: same cycle, still the only active one.
    assert_eq!(ctx.deps.cycles.count_active(ctx.asset_id).await.unwrap(), 1);
    assert!(ctx
        .deps
        .cycles
        .get_latest_terminal(ctx.asset_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_stale_buy_is_canceled_and_cycle_reverts() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    ctx.runtime
        .handle_quote(quote("BTC/USD", dec!(49999), dec!(50000)))
        .await
        .unwrap();
    let placed = ctx.broker.placed_orders();
    let buy_order = placed[0].clone();

    // Surface it as a broker-open order created 10 minutes ago.
    let mut open = buy_order.clone();
    open.created_at = chrono::Utc::now() - chrono::Duration::minutes(10);
    ctx.broker.add_open_order(open);

    let janitor = OrderJanitor::new(ctx.deps.clone());
    janitor.run_once().await.unwrap();
    assert_eq!(ctx.broker.canceled_ids(), vec![buy_order.id.clone()]);

    // The cancel event lands and frees the cycle.
    ctx.runtime
        .handle_trade_update(&cancel_event(&buy_order))
        .await
        .unwrap();

    let cycle = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert_eq!(cycle.quantity, Decimal::ZERO);
}

#[tokio::test]
async fn test_orphaned_broker_order_is_canceled() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    // An aged broker-open sell no cycle knows about.
    let ghost = common::open_order(
        "ghost-sell",
        "BTC/USD",
        ladder::domain::entities::order::OrderSide::Sell,
        ladder::domain::entities::order::OrderType::Market,
        dec!(0.002),
        10,
    );
    ctx.broker.add_open_order(ghost.clone());

    let janitor = OrderJanitor::new(ctx.deps.clone());
    janitor.run_once().await.unwrap();

    assert!(ctx.broker.canceled_ids().contains(&ghost.id));

    // The cycle never referenced it, so nothing changed.
    let cycle = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
}

#[tokio::test]
async fn test_phantom_position_is_abandoned_as_error() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    // The cycle believes it holds 0.0004 BTC; the broker holds nothing.
    ctx.runtime
        .handle_quote(quote("BTC/USD", dec!(49999), dec!(50000)))
        .await
        .unwrap();
    let placed = ctx.broker.placed_orders();
    ctx.runtime
        .handle_trade_update(&fill_event(&placed[0], dec!(0.0004), dec!(50000)))
        .await
        .unwrap();
    ctx.broker.clear_position();

    let checker = ConsistencyChecker::new(ctx.deps.clone());
    checker.run_once().await.unwrap();

    let terminal = ctx
        .deps
        .cycles
        .get_latest_terminal(ctx.asset_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(terminal.status, CycleStatus::Error);
    assert!(terminal.completed_at.is_some());
    assert_eq!(terminal.sell_price, None);

    let fresh = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, CycleStatus::Watching);
    assert_eq!(fresh.quantity, Decimal::ZERO);
    assert_ne!(fresh.id, terminal.id);
}

#[tokio::test]
async fn test_dead_order_reference_is_reverted() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    ctx.runtime
        .handle_quote(quote("BTC/USD", dec!(49999), dec!(50000)))
        .await
        .unwrap();
    let placed = ctx.broker.placed_orders();

    // The order went terminal at the broker but the cancel event was lost.
    ctx.broker.set_order_state(&placed[0].id, OrderState::Expired);

    let checker = ConsistencyChecker::new(ctx.deps.clone());
    checker.run_once().await.unwrap();

    let cycle = ctx.deps.cycles.get_active(ctx.asset_id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert!(cycle.latest_order_id.is_none());
}

#[tokio::test]
async fn test_bootstrap_creates_cycles_for_new_assets() {
    let ctx = test_context(fast_settings(), default_asset()).await;

    let eth = ctx
        .deps
        .assets
        .insert(NewAsset {
            symbol: "ETH/USD".to_string(),
            ..default_asset()
        })
        .await
        .unwrap();
    assert!(ctx.deps.cycles.get_active(eth.id).await.unwrap().is_none());

    let bootstrapper = Bootstrapper::new(ctx.deps.clone());
    bootstrapper.run_once().await.unwrap();
    bootstrapper.run_once().await.unwrap();

    let cycle = ctx.deps.cycles.get_active(eth.id).await.unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert_eq!(ctx.deps.cycles.count_active(eth.id).await.unwrap(), 1);
}
