//! State/broker consistency checker.
//!
//! Two sweeps, both under the per-asset lock:
//!
//! 1. Cycles claiming an order is in flight whose order the broker reports
//!    missing or terminal go back to `watching`. A `buying`/`selling` cycle
//!    with no order id at all is malformed and gets the same treatment.
//! 2. Watching cycles claiming a position the broker does not hold are
//!    abandoned as `error` and replaced with a fresh watching cycle.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::Dependencies;
use crate::domain::entities::cycle::{Cycle, CycleStatus};
use crate::infrastructure::broker::with_retries;
use crate::persistence::repository::CycleOutcome;

/// Broker positions at or below this are dust, not holdings.
const POSITION_DUST: Decimal = dec!(0.0001);

/// Lock budget per cycle; a contended asset is retried next sweep.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConsistencyChecker {
    deps: Arc<Dependencies>,
}

impl ConsistencyChecker {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self { deps }
    }

    pub async fn run_once(&self) -> Result<(), String> {
        self.sweep_order_holding_cycles().await?;
        self.sweep_position_holding_cycles().await?;
        Ok(())
    }

    async fn sweep_order_holding_cycles(&self) -> Result<(), String> {
        let mut cycles = self
            .deps
            .cycles
            .list_by_status(CycleStatus::Buying)
            .await
            .map_err(|e| format!("fetching buying cycles: {}", e))?;
        cycles.extend(
            self.deps
                .cycles
                .list_by_status(CycleStatus::Selling)
                .await
                .map_err(|e| format!("fetching selling cycles: {}", e))?,
        );

        for cycle in cycles {
            if let Err(e) = self.check_order_holding_cycle(&cycle).await {
                warn!(cycle_id = cycle.id, "consistency check failed: {}", e);
            }
        }
        Ok(())
    }

    async fn check_order_holding_cycle(&self, cycle: &Cycle) -> Result<(), String> {
        let order_state = match &cycle.latest_order_id {
            // Malformed: holding-an-order status with no order reference.
            None => None,
            Some(order_id) => {
                let broker = self.deps.broker.clone();
                let order_id = order_id.clone();
                with_retries("get_order", move || {
                    let broker = broker.clone();
                    let order_id = order_id.clone();
                    async move { broker.get_order(&order_id).await }
                })
                .await
                .map_err(|e| format!("order lookup: {}", e))?
                .map(|order| order.status)
            }
        };

        let inactive = match order_state {
            None => true,
            Some(state) => state.is_terminal(),
        };
        if !inactive {
            return Ok(());
        }

        if self.deps.settings.dry_run {
            info!(cycle_id = cycle.id, "[dry run] would revert cycle to watching");
            return Ok(());
        }

        let Some(_guard) = self.deps.locks.acquire_timeout(cycle.asset_id, LOCK_TIMEOUT).await
        else {
            debug!(cycle_id = cycle.id, "asset busy, deferring consistency fix");
            return Ok(());
        };

        // Re-read under the lock; the trade stream may have beaten us here.
        let current = self
            .deps
            .cycles
            .get_by_id(cycle.id)
            .await
            .map_err(|e| format!("re-reading cycle: {}", e))?;
        let Some(current) = current else { return Ok(()) };
        if current.status != cycle.status || current.latest_order_id != cycle.latest_order_id {
            return Ok(());
        }

        let reverted = self
            .deps
            .cycles
            .revert_to_watching(cycle.id)
            .await
            .map_err(|e| format!("reverting cycle: {}", e))?;
        if reverted {
            warn!(
                cycle_id = cycle.id,
                status = %cycle.status,
                order_id = ?cycle.latest_order_id,
                "cycle referenced a dead order, reverted to watching"
            );
        }
        Ok(())
    }

    async fn sweep_position_holding_cycles(&self) -> Result<(), String> {
        let cycles = self
            .deps
            .cycles
            .list_watching_with_position()
            .await
            .map_err(|e| format!("fetching watching cycles: {}", e))?;

        for cycle in cycles {
            if let Err(e) = self.check_position_holding_cycle(&cycle).await {
                warn!(cycle_id = cycle.id, "position consistency check failed: {}", e);
            }
        }
        Ok(())
    }

    async fn check_position_holding_cycle(&self, cycle: &Cycle) -> Result<(), String> {
        let asset = self
            .deps
            .assets
            .get_by_id(cycle.asset_id)
            .await
            .map_err(|e| format!("fetching asset: {}", e))?
            .ok_or_else(|| format!("asset {} missing", cycle.asset_id))?;

        let broker = self.deps.broker.clone();
        let symbol = asset.symbol.clone();
        let position = with_retries("get_position", move || {
            let broker = broker.clone();
            let symbol = symbol.clone();
            async move { broker.get_position(&symbol).await }
        })
        .await
        .map_err(|e| format!("position lookup: {}", e))?;

        let held = position.map(|p| p.qty.abs()).unwrap_or(Decimal::ZERO);
        if held > POSITION_DUST {
            return Ok(());
        }

        if self.deps.settings.dry_run {
            info!(
                cycle_id = cycle.id,
                symbol = %asset.symbol,
                "[dry run] would mark cycle error and replace it"
            );
            return Ok(());
        }

        let Some(_guard) = self.deps.locks.acquire_timeout(cycle.asset_id, LOCK_TIMEOUT).await
        else {
            debug!(cycle_id = cycle.id, "asset busy, deferring position fix");
            return Ok(());
        };

        let current = self
            .deps
            .cycles
            .get_by_id(cycle.id)
            .await
            .map_err(|e| format!("re-reading cycle: {}", e))?;
        let Some(current) = current else { return Ok(()) };
        if current.status != CycleStatus::Watching || !current.has_position() {
            return Ok(());
        }

        error!(
            cycle_id = cycle.id,
            symbol = %asset.symbol,
            believed_qty = %cycle.quantity,
            "cycle holds quantity the broker does not, abandoning as error"
        );

        let new_cycle = self
            .deps
            .cycles
            .complete_and_rollover(cycle.id, cycle.asset_id, CycleOutcome::Error, None)
            .await
            .map_err(|e| format!("error rollover: {}", e))?;

        info!(
            cycle_id = cycle.id,
            new_cycle_id = new_cycle.id,
            symbol = %asset.symbol,
            "fresh watching cycle created after error abandon"
        );
        Ok(())
    }
}
