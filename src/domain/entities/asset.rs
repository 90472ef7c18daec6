//! Per-asset DCA configuration.
//!
//! One row per tradable symbol. Administrators manage rows out of band; the
//! engine only ever writes `last_sell_price` (on take-profit fills).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: i64,
    /// Trading pair in broker notation, e.g. "BTC/USD".
    pub symbol: String,
    pub enabled: bool,
    /// Quote-currency size of the first buy of a cycle.
    pub base_order_amount: Decimal,
    /// Quote-currency size of each safety buy.
    pub safety_order_amount: Decimal,
    pub max_safety_orders: i32,
    /// Percent drop from the last fill that arms a safety buy (> 0).
    pub safety_order_deviation_percent: Decimal,
    /// Percent rise over the weighted average cost that arms the sell (> 0).
    pub take_profit_percent: Decimal,
    pub ttp_enabled: bool,
    /// Percent retracement from the trailing peak that fires the sell.
    /// Required when `ttp_enabled`.
    pub ttp_deviation_percent: Option<Decimal>,
    pub cooldown_period_seconds: i64,
    /// Percent drop from the prior cycle's sell price that preempts the
    /// cooldown and allows an early base buy.
    pub buy_order_price_deviation_percent: Decimal,
    pub last_sell_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_period_seconds)
    }
}
