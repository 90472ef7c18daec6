//! Broker client boundary.
//!
//! This trait is the only way the engine talks to the broker's REST surface.
//! It keeps trading logic independent of any one broker SDK, and mocking it
//! is how the runtime and worker tests run without a network.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::domain::entities::order::{OrderSnapshot, Position};

/// Common result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// Network trouble, broker 5xx, and anything else worth retrying.
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("rate limit exceeded")]
    RateLimited,

    /// Bad credentials or missing permissions; retrying cannot help.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The broker rejected the request as malformed (bad symbol, bad qty).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The broker answered with something we could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Transient(_) | BrokerError::RateLimited | BrokerError::Timeout(_) => true,
            BrokerError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A limit buy request; `client_order_id` makes resubmission idempotent on
/// the broker side.
#[derive(Debug, Clone)]
pub struct LimitBuyRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub limit_price: Decimal,
    pub client_order_id: String,
}

/// A market sell for the whole cycle position.
#[derive(Debug, Clone)]
pub struct MarketSellRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub client_order_id: String,
}

/// Narrow capability interface to the broker's REST API.
///
/// Lookups return `Ok(None)` when the broker does not know the id/symbol;
/// only real failures surface as errors.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn name(&self) -> &str;

    async fn place_limit_buy(&self, request: &LimitBuyRequest) -> BrokerResult<OrderSnapshot>;

    async fn place_market_sell(&self, request: &MarketSellRequest) -> BrokerResult<OrderSnapshot>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    async fn get_order(&self, order_id: &str) -> BrokerResult<Option<OrderSnapshot>>;

    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>>;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Run a broker call with bounded exponential backoff on transient errors.
/// Permanent errors surface immediately.
pub async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BrokerResult<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(
                    "Broker call '{}' failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, RETRY_ATTEMPTS, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
