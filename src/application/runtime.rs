//! Live runtime: quote dispatch.
//!
//! Consumes the two event streams and drives the decider. Quotes are
//! throttled per asset: one in-flight decision at a time, with a single
//! pending slot so a quote that arrived mid-decision still gets a look and
//! everything older is dropped. Trade updates are handled in order and never
//! dropped; see `trade_updates`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::application::trade_updates::TradeUpdateHandler;
use crate::application::Dependencies;
use crate::domain::entities::asset::Asset;
use crate::domain::entities::cycle::Cycle;
use crate::domain::entities::order::{OrderSide, TradeEvent};
use crate::domain::entities::quote::{MarketSnapshot, QuoteEvent};
use crate::domain::errors::EngineError;
use crate::domain::services::decider::{
    decide_base_order_action, decide_safety_order_action, decide_take_profit_action, ActionIntent,
    BuyKind, SellKind,
};
use crate::infrastructure::broker::{with_retries, LimitBuyRequest, MarketSellRequest};

/// Quantities cross to the broker with at most this many fractional digits.
const QTY_SCALE: u32 = 15;

pub struct LiveRuntime {
    deps: Arc<Dependencies>,
    trade_updates: TradeUpdateHandler,
    /// Last order submission per asset, for the duplicate-submission guard.
    recent_orders: StdMutex<HashMap<i64, Instant>>,
    /// One coalesced quote per asset, waiting for the lock to free up.
    pending_quotes: StdMutex<HashMap<i64, QuoteEvent>>,
}

impl LiveRuntime {
    pub fn new(deps: Arc<Dependencies>) -> Arc<Self> {
        Arc::new(Self {
            trade_updates: TradeUpdateHandler::new(deps.clone()),
            deps,
            recent_orders: StdMutex::new(HashMap::new()),
            pending_quotes: StdMutex::new(HashMap::new()),
        })
    }

    /// Main loop. Returns when shutdown is signalled or both streams close.
    pub async fn run(
        self: Arc<Self>,
        mut quotes: mpsc::Receiver<QuoteEvent>,
        mut updates: mpsc::Receiver<TradeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Live runtime started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe_quote = quotes.recv() => {
                    let Some(quote) = maybe_quote else { break };
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = runtime.handle_quote(quote).await {
                            error!("Quote handling failed: {}", e);
                        }
                    });
                }
                maybe_update = updates.recv() => {
                    let Some(event) = maybe_update else { break };
                    if let Err(e) = self.trade_updates.handle(&event).await {
                        error!(
                            "Trade update {} for order {} failed: {}",
                            event.kind.as_str(), event.order.id, e
                        );
                    }
                }
            }
        }

        info!("Live runtime stopped");
    }

    /// Process one trade update. Exposed for the run loop and tests; live
    /// traffic arrives through `run`.
    pub async fn handle_trade_update(&self, event: &TradeEvent) -> Result<(), EngineError> {
        self.trade_updates.handle(event).await
    }

    /// Process one quote, then drain the pending slot for the asset.
    pub async fn handle_quote(&self, quote: QuoteEvent) -> Result<(), EngineError> {
        let Some(asset) = self.deps.assets.get_by_symbol(&quote.symbol).await? else {
            // Quotes for symbols we never configured are just noise.
            return Ok(());
        };
        if !asset.enabled {
            return Ok(());
        }

        let mut current = quote;
        loop {
            let Some(guard) = self.deps.locks.try_acquire(asset.id) else {
                // Decision in flight; park this quote if the slot is free,
                // drop it otherwise.
                let mut pending = self.pending_quotes.lock().expect("pending quotes poisoned");
                pending.entry(asset.id).or_insert(current);
                return Ok(());
            };

            let result = self.evaluate_quote(&asset, &current).await;
            drop(guard);
            result?;

            let next = {
                let mut pending = self.pending_quotes.lock().expect("pending quotes poisoned");
                pending.remove(&asset.id)
            };
            match next {
                Some(queued) => current = queued,
                None => return Ok(()),
            }
        }
    }

    /// One decider pass for one quote, under the asset lock.
    async fn evaluate_quote(&self, asset: &Asset, quote: &QuoteEvent) -> Result<(), EngineError> {
        if self.in_submission_cooldown(asset.id) {
            debug!(symbol = %asset.symbol, "recent order placed, skipping quote");
            return Ok(());
        }

        let Some(cycle) = self.deps.cycles.get_active(asset.id).await? else {
            debug!(symbol = %asset.symbol, "no active cycle, skipping quote");
            return Ok(());
        };

        let market = MarketSnapshot::from_quote(quote, Utc::now());
        let pricing = self.deps.settings.pricing;

        let intent = if !cycle.has_position() {
            let prior = self.deps.cycles.get_latest_terminal(asset.id).await?;
            decide_base_order_action(asset, &cycle, prior.as_ref(), &market, pricing)
        } else {
            decide_safety_order_action(asset, &cycle, &market, pricing)
                .or_else(|| decide_take_profit_action(asset, &cycle, &market))
        };

        match intent {
            Some(intent) => self.apply_intent(asset, &cycle, intent).await,
            None => Ok(()),
        }
    }

    async fn apply_intent(
        &self,
        asset: &Asset,
        cycle: &Cycle,
        intent: ActionIntent,
    ) -> Result<(), EngineError> {
        match intent {
            ActionIntent::PlaceBuy {
                kind,
                symbol,
                limit_price,
                quote_amount,
                client_order_id,
            } => {
                let qty = (quote_amount / limit_price).round_dp(QTY_SCALE);
                if qty <= Decimal::ZERO {
                    warn!(symbol = %symbol, qty = %qty, "computed buy quantity unusable");
                    return Ok(());
                }
                if self.deps.settings.dry_run {
                    info!(
                        symbol = %symbol,
                        ?kind,
                        qty = %qty,
                        limit_price = %limit_price,
                        "[dry run] would place limit buy"
                    );
                    return Ok(());
                }

                let request = LimitBuyRequest {
                    symbol: symbol.clone(),
                    qty,
                    limit_price,
                    client_order_id,
                };
                let broker = self.deps.broker.clone();
                let order = with_retries("place_limit_buy", move || {
                    let broker = broker.clone();
                    let request = request.clone();
                    async move { broker.place_limit_buy(&request).await }
                })
                .await?;

                self.deps
                    .cycles
                    .mark_order_placed(cycle.id, OrderSide::Buy, &order.id)
                    .await?;
                self.note_submission(asset.id);

                let label = match kind {
                    BuyKind::Base => "base",
                    BuyKind::Safety => "safety",
                };
                info!(
                    symbol = %symbol,
                    cycle_id = cycle.id,
                    order_id = %order.id,
                    qty = %qty,
                    limit_price = %limit_price,
                    "{} limit buy placed", label
                );
            }

            ActionIntent::PlaceSell {
                kind,
                symbol,
                quantity,
                client_order_id,
            } => {
                if self.deps.settings.dry_run {
                    info!(
                        symbol = %symbol,
                        ?kind,
                        qty = %quantity,
                        "[dry run] would place market sell"
                    );
                    return Ok(());
                }

                let request = MarketSellRequest {
                    symbol: symbol.clone(),
                    qty: quantity.round_dp(QTY_SCALE),
                    client_order_id,
                };
                let broker = self.deps.broker.clone();
                let order = with_retries("place_market_sell", move || {
                    let broker = broker.clone();
                    let request = request.clone();
                    async move { broker.place_market_sell(&request).await }
                })
                .await?;

                self.deps
                    .cycles
                    .mark_order_placed(cycle.id, OrderSide::Sell, &order.id)
                    .await?;
                self.note_submission(asset.id);

                let label = match kind {
                    SellKind::TakeProfit => "take-profit",
                    SellKind::TrailingTakeProfit => "trailing take-profit",
                };
                info!(
                    symbol = %symbol,
                    cycle_id = cycle.id,
                    order_id = %order.id,
                    qty = %quantity,
                    "{} market sell placed", label
                );
            }

            ActionIntent::EnterTrailing { new_peak } => {
                self.deps.cycles.enter_trailing(cycle.id, new_peak).await?;
            }

            ActionIntent::UpdateTrailingPeak { new_peak } => {
                self.deps.cycles.update_trailing_peak(cycle.id, new_peak).await?;
            }
        }

        Ok(())
    }

    fn in_submission_cooldown(&self, asset_id: i64) -> bool {
        let recent = self.recent_orders.lock().expect("recent orders poisoned");
        recent
            .get(&asset_id)
            .map_or(false, |at| at.elapsed() < self.deps.settings.order_cooldown)
    }

    fn note_submission(&self, asset_id: i64) {
        let mut recent = self.recent_orders.lock().expect("recent orders poisoned");
        recent.insert(asset_id, Instant::now());
    }
}
