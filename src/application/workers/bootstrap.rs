//! Bootstrap worker.
//!
//! Every enabled asset must always have exactly one non-terminal cycle.
//! This worker creates the missing ones: for assets freshly added to the
//! catalog, and as a heal path if a rollover ever half-failed. Runs once at
//! startup and then periodically.

use std::sync::Arc;
use tracing::{info, warn};

use crate::application::Dependencies;

pub struct Bootstrapper {
    deps: Arc<Dependencies>,
}

impl Bootstrapper {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self { deps }
    }

    pub async fn run_once(&self) -> Result<(), String> {
        let assets = self
            .deps
            .assets
            .list_enabled()
            .await
            .map_err(|e| format!("fetching enabled assets: {}", e))?;

        let mut created = 0usize;
        for asset in assets {
            let active = self
                .deps
                .cycles
                .get_active(asset.id)
                .await
                .map_err(|e| format!("checking cycles for {}: {}", asset.symbol, e))?;
            if active.is_some() {
                continue;
            }

            match self.deps.cycles.create_initial(asset.id).await {
                Ok(cycle) => {
                    created += 1;
                    info!(
                        symbol = %asset.symbol,
                        cycle_id = cycle.id,
                        "created watching cycle for asset without one"
                    );
                }
                Err(e) => {
                    warn!(symbol = %asset.symbol, "failed to create initial cycle: {}", e);
                }
            }
        }

        if created > 0 {
            info!("Bootstrap created {} cycle(s)", created);
        }
        Ok(())
    }
}
