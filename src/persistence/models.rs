//! Database row records and their conversions into domain entities.
//!
//! Decimal columns are TEXT; conversion is the single place where stored
//! text becomes `Decimal`, so a corrupt row surfaces as `DecodeError`
//! instead of silent zeroes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use std::str::FromStr;

use super::DatabaseError;
use crate::domain::entities::asset::Asset;
use crate::domain::entities::cycle::{Cycle, CycleStatus};

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw)
        .map_err(|e| DatabaseError::DecodeError(format!("{}: '{}' ({})", column, raw, e)))
}

fn parse_decimal_opt(column: &str, raw: Option<&str>) -> Result<Option<Decimal>, DatabaseError> {
    raw.map(|s| parse_decimal(column, s)).transpose()
}

/// Asset row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRecord {
    pub id: i64,
    pub symbol: String,
    pub enabled: bool,
    pub base_order_amount: String,
    pub safety_order_amount: String,
    pub max_safety_orders: i32,
    pub safety_order_deviation_percent: String,
    pub take_profit_percent: String,
    pub ttp_enabled: bool,
    pub ttp_deviation_percent: Option<String>,
    pub cooldown_period_seconds: i64,
    pub buy_order_price_deviation_percent: String,
    pub last_sell_price: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetRecord {
    pub fn into_asset(self) -> Result<Asset, DatabaseError> {
        Ok(Asset {
            id: self.id,
            symbol: self.symbol,
            enabled: self.enabled,
            base_order_amount: parse_decimal("base_order_amount", &self.base_order_amount)?,
            safety_order_amount: parse_decimal("safety_order_amount", &self.safety_order_amount)?,
            max_safety_orders: self.max_safety_orders,
            safety_order_deviation_percent: parse_decimal(
                "safety_order_deviation_percent",
                &self.safety_order_deviation_percent,
            )?,
            take_profit_percent: parse_decimal("take_profit_percent", &self.take_profit_percent)?,
            ttp_enabled: self.ttp_enabled,
            ttp_deviation_percent: parse_decimal_opt(
                "ttp_deviation_percent",
                self.ttp_deviation_percent.as_deref(),
            )?,
            cooldown_period_seconds: self.cooldown_period_seconds,
            buy_order_price_deviation_percent: parse_decimal(
                "buy_order_price_deviation_percent",
                &self.buy_order_price_deviation_percent,
            )?,
            last_sell_price: parse_decimal_opt("last_sell_price", self.last_sell_price.as_deref())?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Cycle row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct CycleRecord {
    pub id: i64,
    pub asset_id: i64,
    pub status: String,
    pub quantity: String,
    pub average_purchase_price: String,
    pub safety_orders: i32,
    pub latest_order_id: Option<String>,
    pub latest_order_created_at: Option<DateTime<Utc>>,
    pub last_order_fill_price: Option<String>,
    pub highest_trailing_price: Option<String>,
    pub sell_price: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CycleRecord {
    pub fn into_cycle(self) -> Result<Cycle, DatabaseError> {
        let status = CycleStatus::parse(&self.status).ok_or_else(|| {
            DatabaseError::DecodeError(format!("status: '{}' (cycle {})", self.status, self.id))
        })?;
        Ok(Cycle {
            id: self.id,
            asset_id: self.asset_id,
            status,
            quantity: parse_decimal("quantity", &self.quantity)?,
            average_purchase_price: parse_decimal(
                "average_purchase_price",
                &self.average_purchase_price,
            )?,
            safety_orders: self.safety_orders,
            latest_order_id: self.latest_order_id,
            latest_order_created_at: self.latest_order_created_at,
            last_order_fill_price: parse_decimal_opt(
                "last_order_fill_price",
                self.last_order_fill_price.as_deref(),
            )?,
            highest_trailing_price: parse_decimal_opt(
                "highest_trailing_price",
                self.highest_trailing_price.as_deref(),
            )?,
            sell_price: parse_decimal_opt("sell_price", self.sell_price.as_deref())?,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Input for seeding a new asset row.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub symbol: String,
    pub enabled: bool,
    pub base_order_amount: Decimal,
    pub safety_order_amount: Decimal,
    pub max_safety_orders: i32,
    pub safety_order_deviation_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub ttp_enabled: bool,
    pub ttp_deviation_percent: Option<Decimal>,
    pub cooldown_period_seconds: i64,
    pub buy_order_price_deviation_percent: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_parse_rejects_garbage() {
        let err = parse_decimal("quantity", "not-a-number");
        assert!(matches!(err, Err(DatabaseError::DecodeError(_))));
    }

    #[test]
    fn test_decimal_parse_full_precision() {
        let d = parse_decimal("quantity", "0.000808080808080808").unwrap();
        assert_eq!(d, dec!(0.000808080808080808));
    }

    #[test]
    fn test_cycle_record_rejects_unknown_status() {
        let now = Utc::now();
        let record = CycleRecord {
            id: 1,
            asset_id: 1,
            status: "cooldown".to_string(),
            quantity: "0".to_string(),
            average_purchase_price: "0".to_string(),
            safety_orders: 0,
            latest_order_id: None,
            latest_order_created_at: None,
            last_order_fill_price: None,
            highest_trailing_price: None,
            sell_price: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(record.into_cycle(), Err(DatabaseError::DecodeError(_))));
    }
}
