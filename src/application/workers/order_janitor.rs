//! Stale-buy and orphan order janitor.
//!
//! One sweep over the broker's open orders: limit buys that sat unfilled
//! past the stale threshold get canceled (the resulting cancel event reverts
//! their cycle), and orders that no active cycle references at all (orphans)
//! get canceled regardless of side. Aged stuck sells are left to the
//! dedicated stuck-sell sweeper, which verifies order state first.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::Dependencies;
use crate::domain::entities::order::{OrderSide, OrderSnapshot, OrderType};
use crate::infrastructure::broker::with_retries;

pub struct OrderJanitor {
    deps: Arc<Dependencies>,
}

impl OrderJanitor {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self { deps }
    }

    pub async fn run_once(&self) -> Result<(), String> {
        let broker = self.deps.broker.clone();
        let open_orders = with_retries("get_open_orders", move || {
            let broker = broker.clone();
            async move { broker.get_open_orders().await }
        })
        .await
        .map_err(|e| format!("fetching open orders: {}", e))?;

        if open_orders.is_empty() {
            debug!("Janitor: no open orders");
            return Ok(());
        }

        let tracked: HashSet<String> = self
            .deps
            .cycles
            .list_with_open_orders()
            .await
            .map_err(|e| format!("fetching tracked orders: {}", e))?
            .into_iter()
            .filter_map(|cycle| cycle.latest_order_id)
            .collect();

        let now = Utc::now();
        let threshold = self.deps.settings.stale_order_threshold;
        let mut canceled = 0usize;

        for order in &open_orders {
            let age = now - order.created_at;
            if age < threshold {
                continue;
            }

            let is_tracked = tracked.contains(&order.id);
            let reason = if order.side == OrderSide::Buy && order.order_type == OrderType::Limit {
                "stale buy"
            } else if !is_tracked {
                "orphaned"
            } else {
                // A tracked, aged non-buy order is a stuck sell; the
                // stuck-sell sweeper owns those.
                continue;
            };

            if self.cancel(order, reason, age.num_seconds()).await {
                canceled += 1;
            }
        }

        if canceled > 0 {
            info!("Janitor canceled {} order(s)", canceled);
        }
        Ok(())
    }

    async fn cancel(&self, order: &OrderSnapshot, reason: &str, age_seconds: i64) -> bool {
        if self.deps.settings.dry_run {
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                age_seconds,
                "[dry run] would cancel {} order", reason
            );
            return true;
        }

        let broker = self.deps.broker.clone();
        let order_id = order.id.clone();
        let cancel = with_retries("cancel_order", move || {
            let broker = broker.clone();
            let order_id = order_id.clone();
            async move { broker.cancel_order(&order_id).await }
        })
        .await;
        match cancel {
            Ok(()) => {
                info!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    side = %order.side,
                    age_seconds,
                    "canceled {} order", reason
                );
                true
            }
            Err(e) => {
                warn!(order_id = %order.id, "failed to cancel {} order: {}", reason, e);
                false
            }
        }
    }
}
