//! Trade-update processing.
//!
//! Order lifecycle events are the only thing allowed to change a cycle's
//! position: buy fills grow it, the sell fill completes the cycle and rolls
//! over, cancellations revert or resync. Events whose order id matches no
//! active cycle are orphans and never mutate anything.

use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tracing::{debug, error, info, warn};

use crate::application::Dependencies;
use crate::domain::entities::cycle::{Cycle, CycleStatus};
use crate::domain::entities::order::{OrderSide, OrderSnapshot, TradeEvent, TradeEventKind};
use crate::domain::errors::EngineError;
use crate::infrastructure::broker::with_retries;
use crate::persistence::repository::CycleOutcome;

/// Bound on the duplicate-delivery ledger.
const SEEN_EVENTS_CAP: usize = 1024;

/// Remembers recently processed `(order_id, event)` pairs so duplicate
/// deliveries are no-ops.
#[derive(Default)]
struct SeenEvents {
    set: HashSet<(String, TradeEventKind)>,
    order: VecDeque<(String, TradeEventKind)>,
}

impl SeenEvents {
    fn contains(&self, order_id: &str, kind: TradeEventKind) -> bool {
        self.set.contains(&(order_id.to_string(), kind))
    }

    fn insert(&mut self, order_id: &str, kind: TradeEventKind) {
        let key = (order_id.to_string(), kind);
        if self.set.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > SEEN_EVENTS_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }
}

pub struct TradeUpdateHandler {
    deps: Arc<Dependencies>,
    seen: StdMutex<SeenEvents>,
}

impl TradeUpdateHandler {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self {
            deps,
            seen: StdMutex::new(SeenEvents::default()),
        }
    }

    /// Process one trade update under the owning asset's lock.
    pub async fn handle(&self, event: &TradeEvent) -> Result<(), EngineError> {
        let order = &event.order;

        match event.kind {
            TradeEventKind::New => {
                debug!(order_id = %order.id, symbol = %order.symbol, "order acknowledged");
                return Ok(());
            }
            TradeEventKind::PartialFill => {
                // Deliberate: state only moves on terminal events. The broker
                // follows every partial fill with a fill or a cancel.
                info!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    filled_qty = %order.filled_qty,
                    "partial fill observed, waiting for terminal event"
                );
                return Ok(());
            }
            _ => {}
        }

        if self.already_processed(&order.id, event.kind) {
            debug!(
                order_id = %order.id,
                event = event.kind.as_str(),
                "duplicate trade update, ignoring"
            );
            return Ok(());
        }

        // Locate the owning cycle first; without one there is nothing to
        // lock and nothing to do.
        let Some(cycle) = self.deps.cycles.find_by_latest_order_id(&order.id).await? else {
            self.log_orphan(event);
            return Ok(());
        };

        let _guard = self.deps.locks.acquire(cycle.asset_id).await;

        // Re-read under the lock; a worker may have moved the cycle on.
        let Some(cycle) = self.deps.cycles.find_by_latest_order_id(&order.id).await? else {
            self.log_orphan(event);
            return Ok(());
        };

        let result = match (event.kind, order.side) {
            (TradeEventKind::Fill, OrderSide::Buy) => self.on_buy_fill(&cycle, order).await,
            (TradeEventKind::Fill, OrderSide::Sell) => self.on_sell_fill(&cycle, order).await,
            (
                TradeEventKind::Canceled | TradeEventKind::Rejected | TradeEventKind::Expired,
                OrderSide::Buy,
            ) => self.on_buy_order_gone(&cycle, order, event.kind).await,
            (
                TradeEventKind::Canceled | TradeEventKind::Rejected | TradeEventKind::Expired,
                OrderSide::Sell,
            ) => self.on_sell_order_gone(&cycle, order, event.kind).await,
            _ => Ok(()),
        };

        if result.is_ok() {
            self.mark_processed(&order.id, event.kind);
        }
        result
    }

    fn already_processed(&self, order_id: &str, kind: TradeEventKind) -> bool {
        self.seen.lock().expect("seen events poisoned").contains(order_id, kind)
    }

    fn mark_processed(&self, order_id: &str, kind: TradeEventKind) {
        self.seen.lock().expect("seen events poisoned").insert(order_id, kind);
    }

    fn log_orphan(&self, event: &TradeEvent) {
        warn!(
            order_id = %event.order.id,
            symbol = %event.order.symbol,
            event = event.kind.as_str(),
            "trade update for order not tracked by any active cycle, ignoring"
        );
    }

    /// A base or safety buy filled: fold it into the weighted average.
    async fn on_buy_fill(&self, cycle: &Cycle, order: &OrderSnapshot) -> Result<(), EngineError> {
        let filled_qty = order.filled_qty;
        let Some(fill_price) = order.filled_avg_price else {
            return Err(EngineError::MissingFillData(format!(
                "buy fill for order {} has no filled_avg_price",
                order.id
            )));
        };
        if filled_qty <= Decimal::ZERO || fill_price <= Decimal::ZERO {
            return Err(EngineError::MissingFillData(format!(
                "buy fill for order {} has unusable qty {} / price {}",
                order.id, filled_qty, fill_price
            )));
        }

        let is_safety = cycle.has_position();
        let new_quantity = cycle.quantity + filled_qty;
        let new_average = if cycle.has_position() {
            (cycle.average_purchase_price * cycle.quantity + fill_price * filled_qty) / new_quantity
        } else {
            fill_price
        };

        self.deps
            .cycles
            .apply_buy_fill(cycle.id, new_quantity, new_average, fill_price, is_safety)
            .await?;

        info!(
            symbol = %order.symbol,
            cycle_id = cycle.id,
            order_id = %order.id,
            qty = %new_quantity,
            avg = %new_average.round_dp(10),
            fill_price = %fill_price,
            safety_orders = cycle.safety_orders + if is_safety { 1 } else { 0 },
            "{} buy filled, cycle watching",
            if is_safety { "safety" } else { "base" }
        );
        Ok(())
    }

    /// The take-profit sell filled: complete the cycle and open the next.
    async fn on_sell_fill(&self, cycle: &Cycle, order: &OrderSnapshot) -> Result<(), EngineError> {
        let Some(sell_price) = order.filled_avg_price.filter(|p| *p > Decimal::ZERO) else {
            // Open question resolved: without a usable fill price there is no
            // rollover; the consistency checker converges this cycle later.
            return Err(EngineError::MissingFillData(format!(
                "sell fill for order {} has no usable filled_avg_price, skipping rollover",
                order.id
            )));
        };

        let profit_per_unit = sell_price - cycle.average_purchase_price;
        let new_cycle = self
            .deps
            .cycles
            .complete_and_rollover(cycle.id, cycle.asset_id, CycleOutcome::Complete, Some(sell_price))
            .await?;

        self.deps
            .assets
            .set_last_sell_price(cycle.asset_id, sell_price)
            .await?;

        info!(
            symbol = %order.symbol,
            cycle_id = cycle.id,
            new_cycle_id = new_cycle.id,
            sell_price = %sell_price,
            profit_per_unit = %profit_per_unit.round_dp(10),
            "take-profit filled, cycle complete"
        );
        Ok(())
    }

    /// A buy order died without filling: back to watching.
    async fn on_buy_order_gone(
        &self,
        cycle: &Cycle,
        order: &OrderSnapshot,
        kind: TradeEventKind,
    ) -> Result<(), EngineError> {
        if cycle.status != CycleStatus::Buying {
            info!(
                cycle_id = cycle.id,
                status = %cycle.status,
                order_id = %order.id,
                event = kind.as_str(),
                "buy order event for non-buying cycle, no action"
            );
            return Ok(());
        }

        let reverted = self.deps.cycles.revert_to_watching(cycle.id).await?;
        if reverted {
            info!(
                symbol = %order.symbol,
                cycle_id = cycle.id,
                order_id = %order.id,
                "buy order {}, cycle back to watching", kind.as_str()
            );
        }
        Ok(())
    }

    /// A sell order died. The broker may still have filled it moments before
    /// the cancel landed, so the position decides: still held means resync
    /// and keep going, flat means the sell actually completed.
    async fn on_sell_order_gone(
        &self,
        cycle: &Cycle,
        order: &OrderSnapshot,
        kind: TradeEventKind,
    ) -> Result<(), EngineError> {
        if cycle.status != CycleStatus::Selling {
            info!(
                cycle_id = cycle.id,
                status = %cycle.status,
                order_id = %order.id,
                event = kind.as_str(),
                "sell order event for non-selling cycle, no action"
            );
            return Ok(());
        }

        let broker = self.deps.broker.clone();
        let symbol = order.symbol.clone();
        let position = with_retries("get_position", move || {
            let broker = broker.clone();
            let symbol = symbol.clone();
            async move { broker.get_position(&symbol).await }
        })
        .await?;
        let position_qty = position.map(|p| p.qty).unwrap_or(Decimal::ZERO);

        if position_qty > Decimal::ZERO {
            self.deps.cycles.resync_quantity(cycle.id, position_qty).await?;
            info!(
                symbol = %order.symbol,
                cycle_id = cycle.id,
                order_id = %order.id,
                position_qty = %position_qty,
                "sell order {}, position still held, cycle watching", kind.as_str()
            );
        } else {
            // Canceled but flat: the sell filled. Complete with whatever
            // average the broker reported.
            let sell_price = order.filled_avg_price.filter(|p| *p > Decimal::ZERO);
            if sell_price.is_none() {
                error!(
                    symbol = %order.symbol,
                    cycle_id = cycle.id,
                    order_id = %order.id,
                    "sell order {} with flat position but no fill price", kind.as_str()
                );
            }
            let new_cycle = self
                .deps
                .cycles
                .complete_and_rollover(cycle.id, cycle.asset_id, CycleOutcome::Complete, sell_price)
                .await?;
            if let Some(price) = sell_price {
                self.deps.assets.set_last_sell_price(cycle.asset_id, price).await?;
            }
            info!(
                symbol = %order.symbol,
                cycle_id = cycle.id,
                new_cycle_id = new_cycle.id,
                "sell order {} with flat position treated as filled, cycle complete",
                kind.as_str()
            );
        }
        Ok(())
    }
}
