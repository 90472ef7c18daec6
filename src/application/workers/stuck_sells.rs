//! Stuck market-sell sweeper.
//!
//! A market sell should fill in seconds. A `selling` cycle whose order has
//! been out past the timeout gets its order verified at the broker and, if
//! the order is still in an active state, canceled. The cancel event then
//! drives the position-aware recovery in trade-update handling.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::Dependencies;
use crate::domain::entities::cycle::{Cycle, CycleStatus};
use crate::infrastructure::broker::with_retries;

pub struct StuckSellSweeper {
    deps: Arc<Dependencies>,
}

impl StuckSellSweeper {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self { deps }
    }

    pub async fn run_once(&self) -> Result<(), String> {
        let selling = self
            .deps
            .cycles
            .list_by_status(CycleStatus::Selling)
            .await
            .map_err(|e| format!("fetching selling cycles: {}", e))?;

        let now = Utc::now();
        let timeout = self.deps.settings.stuck_sell_timeout;

        for cycle in selling {
            let (Some(order_id), Some(placed_at)) =
                (cycle.latest_order_id.clone(), cycle.latest_order_created_at)
            else {
                continue;
            };

            let age = now - placed_at;
            if age < timeout {
                continue;
            }

            if let Err(e) = self.verify_and_cancel(&cycle, &order_id, age.num_seconds()).await {
                warn!(
                    cycle_id = cycle.id,
                    order_id = %order_id,
                    "stuck-sell handling failed: {}", e
                );
            }
        }

        Ok(())
    }

    async fn verify_and_cancel(
        &self,
        cycle: &Cycle,
        order_id: &str,
        age_seconds: i64,
    ) -> Result<(), String> {
        info!(
            cycle_id = cycle.id,
            order_id = %order_id,
            age_seconds,
            "market sell appears stuck, verifying at broker"
        );

        let broker = self.deps.broker.clone();
        let lookup_id = order_id.to_string();
        let order = with_retries("get_order", move || {
            let broker = broker.clone();
            let order_id = lookup_id.clone();
            async move { broker.get_order(&order_id).await }
        })
        .await
        .map_err(|e| format!("order lookup: {}", e))?;

        let Some(order) = order else {
            debug!(order_id = %order_id, "stuck-sell check: order unknown at broker");
            return Ok(());
        };

        if order.status.is_terminal() {
            // The trade stream owns terminal handling.
            debug!(
                order_id = %order_id,
                status = ?order.status,
                "stuck-sell check: order already terminal"
            );
            return Ok(());
        }
        if !order.status.is_active() {
            warn!(
                order_id = %order_id,
                status = ?order.status,
                "stuck-sell check: order in unknown state, not canceling"
            );
            return Ok(());
        }

        if self.deps.settings.dry_run {
            info!(
                cycle_id = cycle.id,
                order_id = %order_id,
                "[dry run] would cancel stuck sell"
            );
            return Ok(());
        }

        let broker = self.deps.broker.clone();
        let cancel_id = order_id.to_string();
        with_retries("cancel_order", move || {
            let broker = broker.clone();
            let order_id = cancel_id.clone();
            async move { broker.cancel_order(&order_id).await }
        })
        .await
        .map_err(|e| format!("cancel: {}", e))?;

        info!(
            cycle_id = cycle.id,
            order_id = %order_id,
            "cancellation requested for stuck sell"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::EngineSettings;
    use crate::domain::entities::order::{
        OrderSide, OrderSnapshot, OrderState, OrderType, Position,
    };
    use crate::infrastructure::broker::{
        BrokerClient, BrokerResult, LimitBuyRequest, MarketSellRequest,
    };
    use crate::persistence::init_database;
    use crate::persistence::models::NewAsset;
    use crate::persistence::repository::{AssetRepository, CycleRepository};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct StuckBroker {
        order_state: Mutex<Option<OrderState>>,
        canceled: Mutex<Vec<String>>,
    }

    impl StuckBroker {
        fn new(order_state: Option<OrderState>) -> Arc<Self> {
            Arc::new(Self {
                order_state: Mutex::new(order_state),
                canceled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BrokerClient for StuckBroker {
        fn name(&self) -> &str {
            "stuck-stub"
        }

        async fn place_limit_buy(&self, _r: &LimitBuyRequest) -> BrokerResult<OrderSnapshot> {
            unimplemented!("not used by stuck-sell tests")
        }

        async fn place_market_sell(&self, _r: &MarketSellRequest) -> BrokerResult<OrderSnapshot> {
            unimplemented!("not used by stuck-sell tests")
        }

        async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
            self.canceled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }

        async fn get_order(&self, order_id: &str) -> BrokerResult<Option<OrderSnapshot>> {
            Ok(self.order_state.lock().unwrap().map(|status| OrderSnapshot {
                id: order_id.to_string(),
                client_order_id: None,
                symbol: "BTC/USD".to_string(),
                side: OrderSide::Sell,
                order_type: OrderType::Market,
                qty: Some(dec!(0.001)),
                filled_qty: Decimal::ZERO,
                filled_avg_price: None,
                limit_price: None,
                status,
                created_at: Utc::now(),
                updated_at: None,
            }))
        }

        async fn get_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
            Ok(Vec::new())
        }

        async fn get_position(&self, _symbol: &str) -> BrokerResult<Option<Position>> {
            Ok(None)
        }
    }

    async fn setup(order_state: Option<OrderState>) -> (StuckSellSweeper, Arc<StuckBroker>, Arc<Dependencies>, i64) {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();
        let assets = AssetRepository::new(pool.clone());
        let cycles = CycleRepository::new(pool.clone());
        let broker = StuckBroker::new(order_state);

        let asset = assets
            .insert(NewAsset {
                symbol: "BTC/USD".to_string(),
                enabled: true,
                base_order_amount: dec!(20),
                safety_order_amount: dec!(40),
                max_safety_orders: 3,
                safety_order_deviation_percent: dec!(1.0),
                take_profit_percent: dec!(1.5),
                ttp_enabled: false,
                ttp_deviation_percent: None,
                cooldown_period_seconds: 0,
                buy_order_price_deviation_percent: dec!(2.0),
            })
            .await
            .unwrap();
        let cycle = cycles.create_initial(asset.id).await.unwrap();
        cycles
            .mark_order_placed(cycle.id, OrderSide::Sell, "sell-1")
            .await
            .unwrap();
        // Age the order past the 75s timeout.
        sqlx::query(
            "UPDATE dca_cycles SET latest_order_created_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now() - chrono::Duration::seconds(90))
        .bind(cycle.id)
        .execute(&pool)
        .await
        .unwrap();

        let deps = Dependencies::new(EngineSettings::default(), assets, cycles, broker.clone());
        (StuckSellSweeper::new(deps.clone()), broker, deps, cycle.id)
    }

    #[tokio::test]
    async fn test_active_stuck_sell_is_canceled() {
        let (sweeper, broker, _deps, _) = setup(Some(OrderState::Accepted)).await;

        sweeper.run_once().await.unwrap();
        assert_eq!(broker.canceled.lock().unwrap().clone(), vec!["sell-1".to_string()]);
    }

    #[tokio::test]
    async fn test_terminal_order_is_not_canceled() {
        let (sweeper, broker, _deps, _) = setup(Some(OrderState::Filled)).await;

        sweeper.run_once().await.unwrap();
        assert!(broker.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_canceled() {
        let (sweeper, broker, _deps, _) = setup(None).await;

        sweeper.run_once().await.unwrap();
        assert!(broker.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_sell_is_not_touched() {
        let (sweeper, broker, deps, cycle_id) = setup(Some(OrderState::Accepted)).await;

        // Refresh the order timestamp to now.
        deps.cycles
            .mark_order_placed(cycle_id, OrderSide::Sell, "sell-1")
            .await
            .unwrap();

        sweeper.run_once().await.unwrap();
        assert!(broker.canceled.lock().unwrap().is_empty());
    }
}
