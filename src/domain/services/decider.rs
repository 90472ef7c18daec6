//! Pure strategy decision functions.
//!
//! Each entry point maps `(asset config, cycle snapshot, market view)` to at
//! most one `ActionIntent`. Nothing here touches the database or the broker;
//! the live runtime owns applying intents and persisting outcomes.
//!
//! Evaluation order per quote is fixed: base order (only when the cycle holds
//! nothing), otherwise safety order first, then take-profit. Threshold
//! comparisons are inclusive; an exact touch fires the rule.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::entities::asset::Asset;
use crate::domain::entities::cycle::{Cycle, CycleStatus};
use crate::domain::entities::quote::MarketSnapshot;

/// Broker minimum order quantity for crypto; anything below is dust.
pub const MIN_ORDER_QTY: Decimal = dec!(0.000000002);

/// Limit-price policy for buy intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPricing {
    /// Limit at the current ask.
    Standard,
    /// Limit 5% above the ask so integration fixtures fill immediately.
    Aggressive,
}

impl OrderPricing {
    fn limit_for(&self, ask: Decimal) -> Decimal {
        match self {
            OrderPricing::Standard => ask,
            OrderPricing::Aggressive => ask * dec!(1.05),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyKind {
    Base,
    Safety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellKind {
    TakeProfit,
    TrailingTakeProfit,
}

/// What the decider wants done. The runtime translates `PlaceBuy`/`PlaceSell`
/// into broker calls and the trailing variants into cycle patches.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionIntent {
    PlaceBuy {
        kind: BuyKind,
        symbol: String,
        limit_price: Decimal,
        quote_amount: Decimal,
        client_order_id: String,
    },
    /// Always a market order for the full cycle quantity.
    PlaceSell {
        kind: SellKind,
        symbol: String,
        quantity: Decimal,
        client_order_id: String,
    },
    EnterTrailing { new_peak: Decimal },
    UpdateTrailingPeak { new_peak: Decimal },
}

fn fresh_client_order_id() -> String {
    Uuid::new_v4().to_string()
}

fn percent(value: Decimal) -> Decimal {
    value / dec!(100)
}

/// Price at which the next safety order arms, given the last buy fill.
fn safety_trigger_price(asset: &Asset, last_fill: Decimal) -> Decimal {
    last_fill * (Decimal::ONE - percent(asset.safety_order_deviation_percent))
}

/// Decide whether to place the base order that opens a cycle.
///
/// Fires only for an enabled asset whose cycle is `watching` with zero
/// quantity, and only once the cooldown gate passes: no prior terminal cycle,
/// the cooldown window elapsed, or the ask dropped far enough below the prior
/// sell price to justify an early restart.
pub fn decide_base_order_action(
    asset: &Asset,
    cycle: &Cycle,
    prior_terminal_cycle: Option<&Cycle>,
    market: &MarketSnapshot,
    pricing: OrderPricing,
) -> Option<ActionIntent> {
    if !asset.enabled {
        debug!(symbol = %asset.symbol, "asset disabled, skipping base order check");
        return None;
    }
    if cycle.status != CycleStatus::Watching || cycle.has_position() {
        return None;
    }
    if !market.is_actionable() {
        warn!(symbol = %asset.symbol, bid = %market.bid, ask = %market.ask, "unusable quote");
        return None;
    }
    if !cooldown_gate_passes(asset, prior_terminal_cycle, market) {
        return None;
    }
    if asset.base_order_amount <= Decimal::ZERO {
        warn!(symbol = %asset.symbol, amount = %asset.base_order_amount, "invalid base order amount");
        return None;
    }

    let limit_price = pricing.limit_for(market.ask);
    info!(
        symbol = %asset.symbol,
        cycle_id = cycle.id,
        limit_price = %limit_price,
        quote_amount = %asset.base_order_amount,
        "base order conditions met"
    );
    Some(ActionIntent::PlaceBuy {
        kind: BuyKind::Base,
        symbol: asset.symbol.clone(),
        limit_price,
        quote_amount: asset.base_order_amount,
        client_order_id: fresh_client_order_id(),
    })
}

/// The cooldown / early-restart gate for base orders.
///
/// There is no `cooldown` cycle status; this gate is the only place the
/// cooldown exists.
fn cooldown_gate_passes(
    asset: &Asset,
    prior_terminal_cycle: Option<&Cycle>,
    market: &MarketSnapshot,
) -> bool {
    let Some(prior) = prior_terminal_cycle else {
        return true;
    };
    let Some(completed_at) = prior.completed_at else {
        // Terminal cycles always carry completed_at; a missing one is data
        // damage, so hold the gate closed unless the restart check passes.
        warn!(cycle_id = prior.id, "terminal cycle missing completed_at");
        return early_restart_triggers(asset, prior, market);
    };

    if market.now >= completed_at + asset.cooldown() {
        return true;
    }
    if early_restart_triggers(asset, prior, market) {
        info!(
            symbol = %asset.symbol,
            ask = %market.ask,
            prior_sell_price = ?prior.sell_price,
            "cooldown preempted by price drop from prior sell"
        );
        return true;
    }
    debug!(symbol = %asset.symbol, "cooldown still active, base order gated");
    false
}

fn early_restart_triggers(asset: &Asset, prior: &Cycle, market: &MarketSnapshot) -> bool {
    match prior.sell_price {
        Some(sell_price) => {
            let restart_price =
                sell_price * (Decimal::ONE - percent(asset.buy_order_price_deviation_percent));
            market.ask < restart_price
        }
        // Error cycles have no sell price to restart from.
        None => false,
    }
}

/// Decide whether to place a safety order.
///
/// Fires when a `watching` cycle holds a position, has safety budget left,
/// and the ask has dropped to or through the trigger derived from the last
/// buy fill.
pub fn decide_safety_order_action(
    asset: &Asset,
    cycle: &Cycle,
    market: &MarketSnapshot,
    pricing: OrderPricing,
) -> Option<ActionIntent> {
    if !asset.enabled {
        debug!(symbol = %asset.symbol, "asset disabled, skipping safety order check");
        return None;
    }
    if cycle.status != CycleStatus::Watching || !cycle.has_position() {
        return None;
    }
    if cycle.safety_orders >= asset.max_safety_orders {
        debug!(
            symbol = %asset.symbol,
            safety_orders = cycle.safety_orders,
            max = asset.max_safety_orders,
            "at max safety orders"
        );
        return None;
    }
    let last_fill = cycle.last_order_fill_price?;
    if !market.is_actionable() {
        warn!(symbol = %asset.symbol, bid = %market.bid, ask = %market.ask, "unusable quote");
        return None;
    }

    let trigger_price = safety_trigger_price(asset, last_fill);
    if market.ask > trigger_price {
        return None;
    }
    if asset.safety_order_amount <= Decimal::ZERO {
        warn!(symbol = %asset.symbol, amount = %asset.safety_order_amount, "invalid safety order amount");
        return None;
    }

    let limit_price = pricing.limit_for(market.ask);
    let drop_pct = (last_fill - market.ask) / last_fill * dec!(100);
    info!(
        symbol = %asset.symbol,
        cycle_id = cycle.id,
        last_fill = %last_fill,
        ask = %market.ask,
        drop_pct = %drop_pct.round_dp(2),
        safety_order = cycle.safety_orders + 1,
        "safety order conditions met"
    );
    Some(ActionIntent::PlaceBuy {
        kind: BuyKind::Safety,
        symbol: asset.symbol.clone(),
        limit_price,
        quote_amount: asset.safety_order_amount,
        client_order_id: fresh_client_order_id(),
    })
}

/// Decide whether to sell, enter trailing, or raise the trailing peak.
///
/// With TTP disabled this is a straight threshold sell. With TTP enabled the
/// first threshold crossing moves the cycle to `trailing`; while trailing, a
/// higher bid raises the peak and a retracement of `ttp_deviation_percent`
/// from the peak fires the sell.
pub fn decide_take_profit_action(
    asset: &Asset,
    cycle: &Cycle,
    market: &MarketSnapshot,
) -> Option<ActionIntent> {
    if !asset.enabled {
        debug!(symbol = %asset.symbol, "asset disabled, skipping take-profit check");
        return None;
    }
    if !matches!(cycle.status, CycleStatus::Watching | CycleStatus::Trailing) {
        return None;
    }
    if !cycle.has_position() {
        return None;
    }
    if cycle.average_purchase_price <= Decimal::ZERO {
        debug!(
            symbol = %asset.symbol,
            avg = %cycle.average_purchase_price,
            "no usable average purchase price"
        );
        return None;
    }
    if !market.is_actionable() {
        warn!(symbol = %asset.symbol, bid = %market.bid, ask = %market.ask, "unusable quote");
        return None;
    }

    // Buying wins over selling within a single quote: if the safety trigger
    // currently holds, leave this quote to the safety path.
    if let Some(last_fill) = cycle.last_order_fill_price {
        if cycle.safety_orders < asset.max_safety_orders
            && market.ask <= safety_trigger_price(asset, last_fill)
        {
            debug!(symbol = %asset.symbol, "safety order would trigger, skipping take-profit");
            return None;
        }
    }

    let tp_trigger = cycle.average_purchase_price * (Decimal::ONE + percent(asset.take_profit_percent));

    let sell_kind = if !asset.ttp_enabled {
        if market.bid < tp_trigger {
            return None;
        }
        SellKind::TakeProfit
    } else {
        match cycle.status {
            CycleStatus::Watching => {
                if market.bid >= tp_trigger {
                    info!(
                        symbol = %asset.symbol,
                        cycle_id = cycle.id,
                        peak = %market.bid,
                        "take-profit threshold crossed, trailing activated"
                    );
                    return Some(ActionIntent::EnterTrailing { new_peak: market.bid });
                }
                return None;
            }
            CycleStatus::Trailing => {
                let peak = cycle.highest_trailing_price.unwrap_or(Decimal::ZERO);
                if market.bid > peak {
                    debug!(symbol = %asset.symbol, cycle_id = cycle.id, peak = %market.bid, "new trailing peak");
                    return Some(ActionIntent::UpdateTrailingPeak { new_peak: market.bid });
                }
                let Some(ttp_deviation) = asset.ttp_deviation_percent else {
                    warn!(symbol = %asset.symbol, "ttp enabled without ttp_deviation_percent");
                    return None;
                };
                let sell_trigger = peak * (Decimal::ONE - percent(ttp_deviation));
                if market.bid > sell_trigger {
                    return None;
                }
                info!(
                    symbol = %asset.symbol,
                    cycle_id = cycle.id,
                    peak = %peak,
                    bid = %market.bid,
                    sell_trigger = %sell_trigger,
                    "trailing retracement hit, selling"
                );
                SellKind::TrailingTakeProfit
            }
            _ => unreachable!("status checked above"),
        }
    };

    let quantity = cycle.quantity;
    if quantity < MIN_ORDER_QTY {
        warn!(
            symbol = %asset.symbol,
            quantity = %quantity,
            "position below broker minimum, skipping sell"
        );
        return None;
    }

    let gain_pct =
        (market.bid - cycle.average_purchase_price) / cycle.average_purchase_price * dec!(100);
    info!(
        symbol = %asset.symbol,
        cycle_id = cycle.id,
        avg = %cycle.average_purchase_price,
        bid = %market.bid,
        gain_pct = %gain_pct.round_dp(2),
        quantity = %quantity,
        "take-profit conditions met"
    );
    Some(ActionIntent::PlaceSell {
        kind: sell_kind,
        symbol: asset.symbol.clone(),
        quantity,
        client_order_id: fresh_client_order_id(),
    })
}
