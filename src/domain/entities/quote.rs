//! Market-data value types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// One top-of-book quote from the market-data stream.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteEvent {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The market view handed to the strategy decider for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_trade_price: Option<Decimal>,
    pub now: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn from_quote(quote: &QuoteEvent, now: DateTime<Utc>) -> Self {
        Self {
            bid: quote.bid_price,
            ask: quote.ask_price,
            last_trade_price: None,
            now,
        }
    }

    /// Both sides of the book must be positive for any decision to fire.
    pub fn is_actionable(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO
    }
}
