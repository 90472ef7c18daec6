//! Broker-side order and trade-update value types.
//!
//! The broker boundary normalizes whatever the wire carries into these fixed
//! shapes; nothing downstream ever sees raw broker payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// Broker-reported order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected | OrderState::Expired
        )
    }

    /// States in which a cancellation request is still meaningful.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderState::New
                | OrderState::Accepted
                | OrderState::PendingNew
                | OrderState::PartiallyFilled
        )
    }

    pub fn parse(s: &str) -> OrderState {
        match s {
            "new" => OrderState::New,
            "accepted" => OrderState::Accepted,
            "pending_new" => OrderState::PendingNew,
            "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "cancelled" => OrderState::Canceled,
            "rejected" => OrderState::Rejected,
            "expired" => OrderState::Expired,
            _ => OrderState::Unknown,
        }
    }
}

/// Snapshot of a broker order as of one REST response or stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Option<Decimal>,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub status: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Account-stream event kinds the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeEventKind {
    New,
    PartialFill,
    Fill,
    Canceled,
    Rejected,
    Expired,
}

impl TradeEventKind {
    pub fn parse(s: &str) -> Option<TradeEventKind> {
        match s {
            "new" => Some(TradeEventKind::New),
            "partial_fill" => Some(TradeEventKind::PartialFill),
            "fill" => Some(TradeEventKind::Fill),
            "canceled" | "cancelled" => Some(TradeEventKind::Canceled),
            "rejected" => Some(TradeEventKind::Rejected),
            "expired" => Some(TradeEventKind::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeEventKind::New => "new",
            TradeEventKind::PartialFill => "partial_fill",
            TradeEventKind::Fill => "fill",
            TradeEventKind::Canceled => "canceled",
            TradeEventKind::Rejected => "rejected",
            TradeEventKind::Expired => "expired",
        }
    }
}

/// One order lifecycle event from the account stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub kind: TradeEventKind,
    pub order: OrderSnapshot,
}

/// Broker-reported open position for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Option<Decimal>,
}
