//! DCA cycle state.
//!
//! A cycle is one end-to-end run of the strategy for one asset: base buy,
//! zero or more safety buys, one take-profit sell. Exactly one non-terminal
//! cycle exists per enabled asset; terminal cycles are kept for reporting
//! and are never mutated.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// No order in flight; the decider may act on the next quote.
    Watching,
    /// A limit buy is open at the broker.
    Buying,
    /// A market sell is open at the broker.
    Selling,
    /// Take-profit threshold crossed with TTP enabled; tracking the peak.
    Trailing,
    /// Terminal: sell filled.
    Complete,
    /// Terminal: abandoned after an unrecoverable inconsistency.
    Error,
}

impl CycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Complete | CycleStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Watching => "watching",
            CycleStatus::Buying => "buying",
            CycleStatus::Selling => "selling",
            CycleStatus::Trailing => "trailing",
            CycleStatus::Complete => "complete",
            CycleStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<CycleStatus> {
        match s {
            "watching" => Some(CycleStatus::Watching),
            "buying" => Some(CycleStatus::Buying),
            "selling" => Some(CycleStatus::Selling),
            "trailing" => Some(CycleStatus::Trailing),
            "complete" => Some(CycleStatus::Complete),
            "error" => Some(CycleStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub id: i64,
    pub asset_id: i64,
    pub status: CycleStatus,
    pub quantity: Decimal,
    pub average_purchase_price: Decimal,
    pub safety_orders: i32,
    /// Broker id of the order currently in flight, if any.
    pub latest_order_id: Option<String>,
    pub latest_order_created_at: Option<DateTime<Utc>>,
    /// Price of the most recent buy fill; safety triggers key off this.
    pub last_order_fill_price: Option<Decimal>,
    /// Highest bid seen while `status == Trailing`.
    pub highest_trailing_price: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cycle {
    pub fn has_position(&self) -> bool {
        self.quantity > Decimal::ZERO
    }
}
