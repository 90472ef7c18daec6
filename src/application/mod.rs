//! Application layer: the live runtime, trade-update handling, and the
//! reconciliation workers, all sharing one `Dependencies` context.

pub mod lock_table;
pub mod runtime;
pub mod trade_updates;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::services::decider::OrderPricing;
use crate::infrastructure::broker::BrokerClient;
use crate::persistence::repository::{AssetRepository, CycleRepository};

use lock_table::AssetLockTable;

/// Engine tunables, resolved once from configuration at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Minimum gap between order submissions for one asset.
    pub order_cooldown: Duration,
    /// Broker-open orders older than this are stale/orphaned.
    pub stale_order_threshold: chrono::Duration,
    /// Market sells open longer than this are stuck.
    pub stuck_sell_timeout: chrono::Duration,
    pub dry_run: bool,
    pub pricing: OrderPricing,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            order_cooldown: Duration::from_secs(5),
            stale_order_threshold: chrono::Duration::minutes(5),
            stuck_sell_timeout: chrono::Duration::seconds(75),
            dry_run: false,
            pricing: OrderPricing::Standard,
        }
    }
}

/// Explicit dependency context threaded through every task. There are no
/// globals; process init builds exactly one of these.
pub struct Dependencies {
    pub settings: EngineSettings,
    pub assets: AssetRepository,
    pub cycles: CycleRepository,
    pub broker: Arc<dyn BrokerClient>,
    pub locks: AssetLockTable,
}

impl Dependencies {
    pub fn new(
        settings: EngineSettings,
        assets: AssetRepository,
        cycles: CycleRepository,
        broker: Arc<dyn BrokerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            assets,
            cycles,
            broker,
            locks: AssetLockTable::new(),
        })
    }
}
