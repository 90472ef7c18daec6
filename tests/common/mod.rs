//! Shared fixtures for the end-to-end tests: an in-memory database, a
//! scriptable mock broker, and event builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ladder::application::runtime::LiveRuntime;
use ladder::application::{Dependencies, EngineSettings};
use ladder::domain::entities::order::{
    OrderSide, OrderSnapshot, OrderState, OrderType, Position, TradeEvent, TradeEventKind,
};
use ladder::domain::entities::quote::QuoteEvent;
use ladder::infrastructure::broker::{
    BrokerClient, BrokerResult, LimitBuyRequest, MarketSellRequest,
};
use ladder::persistence::models::NewAsset;
use ladder::persistence::repository::{AssetRepository, CycleRepository};
use ladder::persistence::{init_database, DbPool};

/// Broker double that records every call and serves scripted answers.
pub struct MockBroker {
    pub placed: Mutex<Vec<OrderSnapshot>>,
    pub canceled: Mutex<Vec<String>>,
    pub open_orders: Mutex<Vec<OrderSnapshot>>,
    pub orders: Mutex<HashMap<String, OrderSnapshot>>,
    pub position: Mutex<Option<Position>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            placed: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            open_orders: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            position: Mutex::new(None),
        })
    }

    pub fn placed_orders(&self) -> Vec<OrderSnapshot> {
        self.placed.lock().unwrap().clone()
    }

    pub fn canceled_ids(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    pub fn set_position(&self, symbol: &str, qty: Decimal) {
        *self.position.lock().unwrap() = Some(Position {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price: None,
        });
    }

    pub fn clear_position(&self) {
        *self.position.lock().unwrap() = None;
    }

    pub fn add_open_order(&self, order: OrderSnapshot) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order.clone());
        self.open_orders.lock().unwrap().push(order);
    }

    pub fn set_order_state(&self, order_id: &str, status: OrderState) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.status = status;
        }
    }

    fn record_placement(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        qty: Decimal,
        limit_price: Option<Decimal>,
        client_order_id: &str,
    ) -> OrderSnapshot {
        let mut placed = self.placed.lock().unwrap();
        let snapshot = OrderSnapshot {
            id: format!("broker-order-{}", placed.len() + 1),
            client_order_id: Some(client_order_id.to_string()),
            symbol: symbol.to_string(),
            side,
            order_type,
            qty: Some(qty),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            limit_price,
            status: OrderState::Accepted,
            created_at: Utc::now(),
            updated_at: None,
        };
        placed.push(snapshot.clone());
        self.orders
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.clone());
        snapshot
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_limit_buy(&self, request: &LimitBuyRequest) -> BrokerResult<OrderSnapshot> {
        Ok(self.record_placement(
            &request.symbol,
            OrderSide::Buy,
            OrderType::Limit,
            request.qty,
            Some(request.limit_price),
            &request.client_order_id,
        ))
    }

    async fn place_market_sell(&self, request: &MarketSellRequest) -> BrokerResult<OrderSnapshot> {
        Ok(self.record_placement(
            &request.symbol,
            OrderSide::Sell,
            OrderType::Market,
            request.qty,
            None,
            &request.client_order_id,
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.canceled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<Option<OrderSnapshot>> {
        Ok(self.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn get_position(&self, _symbol: &str) -> BrokerResult<Option<Position>> {
        Ok(self.position.lock().unwrap().clone())
    }
}

pub struct TestContext {
    pub pool: DbPool,
    pub deps: Arc<Dependencies>,
    pub runtime: Arc<LiveRuntime>,
    pub broker: Arc<MockBroker>,
    pub asset_id: i64,
    pub cycle_id: i64,
}

pub fn default_asset() -> NewAsset {
    NewAsset {
        symbol: "BTC/USD".to_string(),
        enabled: true,
        base_order_amount: dec!(20),
        safety_order_amount: dec!(40),
        max_safety_orders: 3,
        safety_order_deviation_percent: dec!(1.0),
        take_profit_percent: dec!(1.5),
        ttp_enabled: false,
        ttp_deviation_percent: None,
        cooldown_period_seconds: 600,
        buy_order_price_deviation_percent: dec!(2.0),
    }
}

/// Settings with the duplicate-submission guard disabled so scripted event
/// sequences can run back to back.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        order_cooldown: std::time::Duration::ZERO,
        ..EngineSettings::default()
    }
}

pub async fn test_context(settings: EngineSettings, new_asset: NewAsset) -> TestContext {
    let pool = init_database("sqlite::memory:", 5).await.unwrap();
    let assets = AssetRepository::new(pool.clone());
    let cycles = CycleRepository::new(pool.clone());
    let broker = MockBroker::new();

    let asset = assets.insert(new_asset).await.unwrap();
    let cycle = cycles.create_initial(asset.id).await.unwrap();

    let deps = Dependencies::new(settings, assets, cycles, broker.clone());
    let runtime = LiveRuntime::new(deps.clone());

    TestContext {
        pool,
        deps,
        runtime,
        broker,
        asset_id: asset.id,
        cycle_id: cycle.id,
    }
}

pub fn quote(symbol: &str, bid: Decimal, ask: Decimal) -> QuoteEvent {
    QuoteEvent {
        symbol: symbol.to_string(),
        bid_price: bid,
        bid_size: dec!(1),
        ask_price: ask,
        ask_size: dec!(1),
        timestamp: Utc::now(),
    }
}

pub fn fill_event(order: &OrderSnapshot, filled_qty: Decimal, fill_price: Decimal) -> TradeEvent {
    let mut order = order.clone();
    order.filled_qty = filled_qty;
    order.filled_avg_price = Some(fill_price);
    order.status = OrderState::Filled;
    TradeEvent {
        kind: TradeEventKind::Fill,
        order,
    }
}

pub fn cancel_event(order: &OrderSnapshot) -> TradeEvent {
    let mut order = order.clone();
    order.status = OrderState::Canceled;
    TradeEvent {
        kind: TradeEventKind::Canceled,
        order,
    }
}

/// A broker-open order built from scratch, for orphan/stale scenarios.
pub fn open_order(
    id: &str,
    symbol: &str,
    side: OrderSide,
    order_type: OrderType,
    qty: Decimal,
    age_minutes: i64,
) -> OrderSnapshot {
    OrderSnapshot {
        id: id.to_string(),
        client_order_id: None,
        symbol: symbol.to_string(),
        side,
        order_type,
        qty: Some(qty),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        limit_price: None,
        status: OrderState::Accepted,
        created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        updated_at: None,
    }
}

/// Backdate the in-flight order on a cycle, for stuck/stale scenarios.
pub async fn age_order(pool: &DbPool, cycle_id: i64, seconds: i64) {
    sqlx::query("UPDATE dca_cycles SET latest_order_created_at = ?1 WHERE id = ?2")
        .bind(Utc::now() - chrono::Duration::seconds(seconds))
        .bind(cycle_id)
        .execute(pool)
        .await
        .unwrap();
}
