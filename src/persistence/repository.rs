//! Cycle store: data access for the asset catalog and cycle state.
//!
//! Every public method is one atomic operation: a single statement, or one
//! explicit transaction for the rollover. Mutations are expressed as named
//! updates rather than a generic patch so each caller states exactly which
//! transition it is making, and the terminal-immutability guard
//! (`status NOT IN ('complete', 'error')`) rides along on every one.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use tracing::{debug, error, info};

use super::models::{AssetRecord, CycleRecord, NewAsset};
use super::{DatabaseError, DbPool};
use crate::domain::entities::asset::Asset;
use crate::domain::entities::cycle::{Cycle, CycleStatus};
use crate::domain::entities::order::OrderSide;

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

/// How a cycle leaves the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Complete,
    Error,
}

impl CycleOutcome {
    fn as_status(&self) -> CycleStatus {
        match self {
            CycleOutcome::Complete => CycleStatus::Complete,
            CycleOutcome::Error => CycleStatus::Error,
        }
    }
}

/// Asset catalog repository
#[derive(Clone)]
pub struct AssetRepository {
    pool: DbPool,
}

impl AssetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new asset row. Used by seeding tooling and tests; the engine
    /// itself only reads the catalog.
    pub async fn insert(&self, asset: NewAsset) -> Result<Asset, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, AssetRecord>(
            r#"
            INSERT INTO dca_assets (
                symbol, enabled, base_order_amount, safety_order_amount,
                max_safety_orders, safety_order_deviation_percent,
                take_profit_percent, ttp_enabled, ttp_deviation_percent,
                cooldown_period_seconds, buy_order_price_deviation_percent,
                last_sell_price, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, ?12)
            RETURNING *
            "#,
        )
        .bind(&asset.symbol)
        .bind(asset.enabled)
        .bind(asset.base_order_amount.to_string())
        .bind(asset.safety_order_amount.to_string())
        .bind(asset.max_safety_orders)
        .bind(asset.safety_order_deviation_percent.to_string())
        .bind(asset.take_profit_percent.to_string())
        .bind(asset.ttp_enabled)
        .bind(asset.ttp_deviation_percent.map(|d| d.to_string()))
        .bind(asset.cooldown_period_seconds)
        .bind(asset.buy_order_price_deviation_percent.to_string())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert asset {}: {}", asset.symbol, e);
            DatabaseError::QueryError(format!("Failed to insert asset: {}", e))
        })?;

        debug!("Inserted asset {} ({})", record.id, record.symbol);
        record.into_asset()
    }

    pub async fn get_by_symbol(&self, symbol: &str) -> Result<Option<Asset>, DatabaseError> {
        let record =
            sqlx::query_as::<_, AssetRecord>("SELECT * FROM dca_assets WHERE symbol = ?1")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to get asset {}: {}", symbol, e);
                    DatabaseError::QueryError(format!("Failed to get asset: {}", e))
                })?;

        record.map(AssetRecord::into_asset).transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Asset>, DatabaseError> {
        let record = sqlx::query_as::<_, AssetRecord>("SELECT * FROM dca_assets WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get asset {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get asset: {}", e))
            })?;

        record.map(AssetRecord::into_asset).transpose()
    }

    pub async fn list_enabled(&self) -> Result<Vec<Asset>, DatabaseError> {
        let records = sqlx::query_as::<_, AssetRecord>(
            "SELECT * FROM dca_assets WHERE enabled = 1 ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list enabled assets: {}", e);
            DatabaseError::QueryError(format!("Failed to list enabled assets: {}", e))
        })?;

        records.into_iter().map(AssetRecord::into_asset).collect()
    }

    /// Record the fill price of a completed take-profit sell.
    pub async fn set_last_sell_price(
        &self,
        asset_id: i64,
        price: Decimal,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            "UPDATE dca_assets SET last_sell_price = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(price.to_string())
        .bind(Utc::now())
        .bind(asset_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to set last_sell_price for asset {}: {}", asset_id, e);
            DatabaseError::QueryError(format!("Failed to set last_sell_price: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Asset not found: {}",
                asset_id
            )));
        }

        debug!("Updated last_sell_price for asset {}: {}", asset_id, price);
        Ok(())
    }
}

/// Cycle repository
#[derive(Clone)]
pub struct CycleRepository {
    pool: DbPool,
}

impl CycleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Cycle>, DatabaseError> {
        let record = sqlx::query_as::<_, CycleRecord>("SELECT * FROM dca_cycles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get cycle {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get cycle: {}", e))
            })?;

        record.map(CycleRecord::into_cycle).transpose()
    }

    /// The unique non-terminal cycle for an asset, if one exists.
    pub async fn get_active(&self, asset_id: i64) -> Result<Option<Cycle>, DatabaseError> {
        let record = sqlx::query_as::<_, CycleRecord>(
            r#"
            SELECT * FROM dca_cycles
            WHERE asset_id = ?1 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get active cycle for asset {}: {}", asset_id, e);
            DatabaseError::QueryError(format!("Failed to get active cycle: {}", e))
        })?;

        record.map(CycleRecord::into_cycle).transpose()
    }

    /// The most recently completed terminal cycle; feeds the cooldown gate.
    pub async fn get_latest_terminal(&self, asset_id: i64) -> Result<Option<Cycle>, DatabaseError> {
        let record = sqlx::query_as::<_, CycleRecord>(
            r#"
            SELECT * FROM dca_cycles
            WHERE asset_id = ?1 AND status IN ('complete', 'error')
              AND completed_at IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get latest terminal cycle for asset {}: {}", asset_id, e);
            DatabaseError::QueryError(format!("Failed to get latest terminal cycle: {}", e))
        })?;

        record.map(CycleRecord::into_cycle).transpose()
    }

    /// Locate the cycle tracking a broker order. Only non-terminal cycles
    /// qualify, so fills already processed come back as `None` (orphans).
    pub async fn find_by_latest_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<Cycle>, DatabaseError> {
        let record = sqlx::query_as::<_, CycleRecord>(
            r#"
            SELECT * FROM dca_cycles
            WHERE latest_order_id = ?1 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find cycle by order {}: {}", order_id, e);
            DatabaseError::QueryError(format!("Failed to find cycle by order: {}", e))
        })?;

        record.map(CycleRecord::into_cycle).transpose()
    }

    pub async fn list_by_status(&self, status: CycleStatus) -> Result<Vec<Cycle>, DatabaseError> {
        let records = sqlx::query_as::<_, CycleRecord>(
            "SELECT * FROM dca_cycles WHERE status = ?1 ORDER BY asset_id, created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list {} cycles: {}", status, e);
            DatabaseError::QueryError(format!("Failed to list cycles: {}", e))
        })?;

        records.into_iter().map(CycleRecord::into_cycle).collect()
    }

    /// Cycles with an order in flight at the broker.
    pub async fn list_with_open_orders(&self) -> Result<Vec<Cycle>, DatabaseError> {
        let records = sqlx::query_as::<_, CycleRecord>(
            r#"
            SELECT * FROM dca_cycles
            WHERE status IN ('buying', 'selling') AND latest_order_id IS NOT NULL
            ORDER BY asset_id, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list cycles with open orders: {}", e);
            DatabaseError::QueryError(format!("Failed to list cycles with open orders: {}", e))
        })?;

        records.into_iter().map(CycleRecord::into_cycle).collect()
    }

    /// Watching cycles that believe they hold a position. Quantity lives as
    /// TEXT, so the filter happens after decoding.
    pub async fn list_watching_with_position(&self) -> Result<Vec<Cycle>, DatabaseError> {
        let cycles = self.list_by_status(CycleStatus::Watching).await?;
        Ok(cycles.into_iter().filter(Cycle::has_position).collect())
    }

    /// Create the initial `watching` zero-quantity cycle for an asset if no
    /// non-terminal cycle exists. Idempotent: concurrent callers converge on
    /// the same row via the partial unique index.
    pub async fn create_initial(&self, asset_id: i64) -> Result<Cycle, DatabaseError> {
        if let Some(existing) = self.get_active(asset_id).await? {
            return Ok(existing);
        }

        match self.insert_watching(&self.pool, asset_id).await {
            Ok(cycle) => {
                info!("Created cycle {} for asset {} (watching)", cycle.id, asset_id);
                Ok(cycle)
            }
            Err(DatabaseError::ConnectionError(e)) if is_unique_violation(&e) => {
                // Lost the race; the winner's row is the one we wanted.
                self.get_active(asset_id).await?.ok_or_else(|| {
                    DatabaseError::InvariantViolation(format!(
                        "active cycle for asset {} vanished after unique violation",
                        asset_id
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_watching<'e, E>(&self, executor: E, asset_id: i64) -> Result<Cycle, DatabaseError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let now = Utc::now();
        let record = sqlx::query_as::<_, CycleRecord>(
            r#"
            INSERT INTO dca_cycles (
                asset_id, status, quantity, average_purchase_price, safety_orders,
                latest_order_id, latest_order_created_at, last_order_fill_price,
                highest_trailing_price, sell_price, completed_at, created_at, updated_at
            )
            VALUES (?1, 'watching', '0', '0', 0, NULL, NULL, NULL, NULL, NULL, NULL, ?2, ?2)
            RETURNING *
            "#,
        )
        .bind(asset_id)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(DatabaseError::ConnectionError)?;

        record.into_cycle()
    }

    /// Record a freshly placed order: `watching`/`trailing` becomes `buying`
    /// or `selling` and the order refs are set.
    pub async fn mark_order_placed(
        &self,
        cycle_id: i64,
        side: OrderSide,
        broker_order_id: &str,
    ) -> Result<(), DatabaseError> {
        let status = match side {
            OrderSide::Buy => CycleStatus::Buying,
            OrderSide::Sell => CycleStatus::Selling,
        };
        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET status = ?1, latest_order_id = ?2, latest_order_created_at = ?3, updated_at = ?3
            WHERE id = ?4 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(status.as_str())
        .bind(broker_order_id)
        .bind(now)
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark order placed on cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to mark order placed: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Cycle not found or terminal: {}",
                cycle_id
            )));
        }

        debug!("Cycle {} -> {} (order {})", cycle_id, status, broker_order_id);
        Ok(())
    }

    pub async fn enter_trailing(&self, cycle_id: i64, peak: Decimal) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET status = 'trailing', highest_trailing_price = ?1, updated_at = ?2
            WHERE id = ?3 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(peak.to_string())
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enter trailing on cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to enter trailing: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Cycle not found or terminal: {}",
                cycle_id
            )));
        }

        debug!("Cycle {} -> trailing (peak {})", cycle_id, peak);
        Ok(())
    }

    pub async fn update_trailing_peak(
        &self,
        cycle_id: i64,
        peak: Decimal,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET highest_trailing_price = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'trailing'
            "#,
        )
        .bind(peak.to_string())
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update trailing peak on cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to update trailing peak: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Cycle not trailing: {}",
                cycle_id
            )));
        }

        debug!("Cycle {} trailing peak -> {}", cycle_id, peak);
        Ok(())
    }

    /// Apply a buy fill: new totals, back to `watching`, order refs cleared.
    /// `is_safety` bumps the safety counter by exactly one.
    pub async fn apply_buy_fill(
        &self,
        cycle_id: i64,
        quantity: Decimal,
        average_purchase_price: Decimal,
        fill_price: Decimal,
        is_safety: bool,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET quantity = ?1,
                average_purchase_price = ?2,
                last_order_fill_price = ?3,
                safety_orders = safety_orders + ?4,
                status = 'watching',
                latest_order_id = NULL,
                latest_order_created_at = NULL,
                updated_at = ?5
            WHERE id = ?6 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(quantity.to_string())
        .bind(average_purchase_price.to_string())
        .bind(fill_price.to_string())
        .bind(if is_safety { 1 } else { 0 })
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to apply buy fill on cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to apply buy fill: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Cycle not found or terminal: {}",
                cycle_id
            )));
        }

        debug!(
            "Cycle {} buy fill applied: qty={} avg={} fill={}",
            cycle_id, quantity, average_purchase_price, fill_price
        );
        Ok(())
    }

    /// Revert an order-holding cycle to `watching` with order refs cleared.
    /// Returns false when the cycle was already past that state; callers on
    /// cancellation paths treat that as already-processed.
    pub async fn revert_to_watching(&self, cycle_id: i64) -> Result<bool, DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET status = 'watching', latest_order_id = NULL, latest_order_created_at = NULL,
                updated_at = ?1
            WHERE id = ?2 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to revert cycle {} to watching: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to revert cycle: {}", e))
        })?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Adopt the broker-reported position quantity after a partially filled
    /// sell was canceled.
    pub async fn resync_quantity(
        &self,
        cycle_id: i64,
        quantity: Decimal,
    ) -> Result<(), DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET status = 'watching', quantity = ?1, latest_order_id = NULL,
                latest_order_created_at = NULL, updated_at = ?2
            WHERE id = ?3 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(quantity.to_string())
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to resync quantity on cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to resync quantity: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Cycle not found or terminal: {}",
                cycle_id
            )));
        }

        info!("Cycle {} quantity resynced to {} (watching)", cycle_id, quantity);
        Ok(())
    }

    /// Atomically close out a cycle and open its successor.
    ///
    /// The old cycle goes terminal with `completed_at` set and order refs
    /// cleared; a fresh `watching` zero-quantity cycle is inserted in the
    /// same transaction. Calling this twice for the same cycle is a no-op
    /// that returns the already-created successor (duplicate fill events).
    pub async fn complete_and_rollover(
        &self,
        cycle_id: i64,
        asset_id: i64,
        outcome: CycleOutcome,
        sell_price: Option<Decimal>,
    ) -> Result<Cycle, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            r#"
            UPDATE dca_cycles
            SET status = ?1, completed_at = ?2, sell_price = ?3,
                latest_order_id = NULL, latest_order_created_at = NULL, updated_at = ?2
            WHERE id = ?4 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(outcome.as_status().as_str())
        .bind(now)
        .bind(sell_price.map(|p| p.to_string()))
        .bind(cycle_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to complete cycle {}: {}", cycle_id, e);
            DatabaseError::QueryError(format!("Failed to complete cycle: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            // Already terminal: a duplicate of an event we processed. Hand
            // back whatever successor exists rather than minting another.
            drop(tx);
            debug!("Cycle {} already terminal, rollover is a no-op", cycle_id);
            return match self.get_active(asset_id).await? {
                Some(active) => Ok(active),
                None => self.create_initial(asset_id).await,
            };
        }

        let record = sqlx::query_as::<_, CycleRecord>(
            r#"
            INSERT INTO dca_cycles (
                asset_id, status, quantity, average_purchase_price, safety_orders,
                latest_order_id, latest_order_created_at, last_order_fill_price,
                highest_trailing_price, sell_price, completed_at, created_at, updated_at
            )
            VALUES (?1, 'watching', '0', '0', 0, NULL, NULL, NULL, NULL, NULL, NULL, ?2, ?2)
            RETURNING *
            "#,
        )
        .bind(asset_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DatabaseError::InvariantViolation(format!(
                    "another active cycle exists for asset {} during rollover of cycle {}",
                    asset_id, cycle_id
                ))
            } else {
                error!("Failed to insert rollover cycle for asset {}: {}", asset_id, e);
                DatabaseError::QueryError(format!("Failed to insert rollover cycle: {}", e))
            }
        })?;

        tx.commit().await?;

        let new_cycle = record.into_cycle()?;
        info!(
            "Cycle {} -> {} (sell_price {:?}); new cycle {} watching for asset {}",
            cycle_id,
            outcome.as_status(),
            sell_price,
            new_cycle.id,
            asset_id
        );
        Ok(new_cycle)
    }

    /// Count non-terminal cycles for an asset. Test and consistency surface.
    pub async fn count_active(&self, asset_id: i64) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM dca_cycles
            WHERE asset_id = ?1 AND status NOT IN ('complete', 'error')
            "#,
        )
        .bind(asset_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to count active cycles: {}", e)))?;

        Ok(row.get("count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;
    use rust_decimal_macros::dec;

    async fn setup() -> (AssetRepository, CycleRepository, Asset) {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();
        let assets = AssetRepository::new(pool.clone());
        let cycles = CycleRepository::new(pool);

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
                cooldown_period_seconds: 600,
                buy_order_price_deviation_percent: dec!(2.0),
            })
            .await
            .unwrap();

        (assets, cycles, asset)
    }

    #[tokio::test]
    async fn test_asset_round_trip() {
        let (assets, _, asset) = setup().await;

        let fetched = assets.get_by_symbol("BTC/USD").await.unwrap().unwrap();
        assert_eq!(fetched.id, asset.id);
        assert_eq!(fetched.base_order_amount, dec!(20));
        assert_eq!(fetched.last_sell_price, None);

        assets.set_last_sell_price(asset.id, dec!(50450)).await.unwrap();
        let fetched = assets.get_by_id(asset.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_sell_price, Some(dec!(50450)));

        let enabled = assets.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
    }

    #[tokio::test]
    async fn test_create_initial_is_idempotent() {
        let (_, cycles, asset) = setup().await;

        let first = cycles.create_initial(asset.id).await.unwrap();
        let second = cycles.create_initial(asset.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cycles.count_active(asset.id).await.unwrap(), 1);
        assert_eq!(first.status, CycleStatus::Watching);
        assert_eq!(first.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_second_active_cycle() {
        let (_, cycles, asset) = setup().await;
        cycles.create_initial(asset.id).await.unwrap();

        let result = cycles.insert_watching(&cycles.pool, asset.id).await;
        match result {
            Err(DatabaseError::ConnectionError(e)) => assert!(is_unique_violation(&e)),
            other => panic!("expected unique violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_order_placement_and_buy_fill() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();

        cycles
            .mark_order_placed(cycle.id, OrderSide::Buy, "order-1")
            .await
            .unwrap();
        let buying = cycles.get_active(asset.id).await.unwrap().unwrap();
        assert_eq!(buying.status, CycleStatus::Buying);
        assert_eq!(buying.latest_order_id.as_deref(), Some("order-1"));
        assert!(buying.latest_order_created_at.is_some());

        let found = cycles.find_by_latest_order_id("order-1").await.unwrap();
        assert_eq!(found.unwrap().id, cycle.id);

        cycles
            .apply_buy_fill(cycle.id, dec!(0.0004), dec!(50000), dec!(50000), false)
            .await
            .unwrap();
        let watching = cycles.get_active(asset.id).await.unwrap().unwrap();
        assert_eq!(watching.status, CycleStatus::Watching);
        assert_eq!(watching.quantity, dec!(0.0004));
        assert_eq!(watching.average_purchase_price, dec!(50000));
        assert_eq!(watching.last_order_fill_price, Some(dec!(50000)));
        assert_eq!(watching.safety_orders, 0);
        assert!(watching.latest_order_id.is_none());

        // Safety fill bumps the counter.
        cycles
            .mark_order_placed(cycle.id, OrderSide::Buy, "order-2")
            .await
            .unwrap();
        cycles
            .apply_buy_fill(cycle.id, dec!(0.0012), dec!(49665), dec!(49500), true)
            .await
            .unwrap();
        let watching = cycles.get_active(asset.id).await.unwrap().unwrap();
        assert_eq!(watching.safety_orders, 1);
    }

    #[tokio::test]
    async fn test_rollover_completes_and_replaces() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();

        let new_cycle = cycles
            .complete_and_rollover(cycle.id, asset.id, CycleOutcome::Complete, Some(dec!(50450)))
            .await
            .unwrap();

        assert_ne!(new_cycle.id, cycle.id);
        assert_eq!(new_cycle.status, CycleStatus::Watching);
        assert_eq!(new_cycle.quantity, Decimal::ZERO);

        let old = cycles.get_by_id(cycle.id).await.unwrap().unwrap();
        assert_eq!(old.status, CycleStatus::Complete);
        assert_eq!(old.sell_price, Some(dec!(50450)));
        assert!(old.completed_at.is_some());
        assert!(old.latest_order_id.is_none());

        assert_eq!(cycles.count_active(asset.id).await.unwrap(), 1);

        let terminal = cycles.get_latest_terminal(asset.id).await.unwrap().unwrap();
        assert_eq!(terminal.id, cycle.id);
    }

    #[tokio::test]
    async fn test_rollover_is_idempotent() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();

        let first = cycles
            .complete_and_rollover(cycle.id, asset.id, CycleOutcome::Complete, Some(dec!(50450)))
            .await
            .unwrap();
        let second = cycles
            .complete_and_rollover(cycle.id, asset.id, CycleOutcome::Complete, Some(dec!(50450)))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(cycles.count_active(asset.id).await.unwrap(), 1);

        // The terminal row kept its original completion data.
        let old = cycles.get_by_id(cycle.id).await.unwrap().unwrap();
        assert_eq!(old.sell_price, Some(dec!(50450)));
    }

    #[tokio::test]
    async fn test_error_rollover_has_no_sell_price() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();

        cycles
            .complete_and_rollover(cycle.id, asset.id, CycleOutcome::Error, None)
            .await
            .unwrap();

        let old = cycles.get_by_id(cycle.id).await.unwrap().unwrap();
        assert_eq!(old.status, CycleStatus::Error);
        assert_eq!(old.sell_price, None);
        assert!(old.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_cycles_are_immutable() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();
        cycles
            .complete_and_rollover(cycle.id, asset.id, CycleOutcome::Complete, Some(dec!(100)))
            .await
            .unwrap();

        assert!(!cycles.revert_to_watching(cycle.id).await.unwrap());
        assert!(cycles
            .mark_order_placed(cycle.id, OrderSide::Sell, "order-x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_trailing_transitions() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();
        cycles
            .mark_order_placed(cycle.id, OrderSide::Buy, "order-1")
            .await
            .unwrap();
        cycles
            .apply_buy_fill(cycle.id, dec!(0.001), dec!(50000), dec!(50000), false)
            .await
            .unwrap();

        cycles.enter_trailing(cycle.id, dec!(50500)).await.unwrap();
        let trailing = cycles.get_active(asset.id).await.unwrap().unwrap();
        assert_eq!(trailing.status, CycleStatus::Trailing);
        assert_eq!(trailing.highest_trailing_price, Some(dec!(50500)));

        cycles.update_trailing_peak(cycle.id, dec!(50800)).await.unwrap();
        let trailing = cycles.get_active(asset.id).await.unwrap().unwrap();
        assert_eq!(trailing.highest_trailing_price, Some(dec!(50800)));

        // Peak updates only apply while trailing.
        cycles.revert_to_watching(cycle.id).await.unwrap();
        assert!(cycles.update_trailing_peak(cycle.id, dec!(51000)).await.is_err());
    }

    #[tokio::test]
    async fn test_list_queries() {
        let (_, cycles, asset) = setup().await;
        let cycle = cycles.create_initial(asset.id).await.unwrap();

        assert!(cycles.list_with_open_orders().await.unwrap().is_empty());
        assert!(cycles.list_watching_with_position().await.unwrap().is_empty());

        cycles
            .mark_order_placed(cycle.id, OrderSide::Buy, "order-1")
            .await
            .unwrap();
        assert_eq!(cycles.list_with_open_orders().await.unwrap().len(), 1);

        cycles
            .apply_buy_fill(cycle.id, dec!(0.0004), dec!(50000), dec!(50000), false)
            .await
            .unwrap();
        assert_eq!(cycles.list_watching_with_position().await.unwrap().len(), 1);
        assert!(cycles.list_with_open_orders().await.unwrap().is_empty());
    }
}
