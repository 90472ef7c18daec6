//! Alpaca REST client.
//!
//! Implements `BrokerClient` over the Alpaca trading API. All decimals cross
//! this boundary as strings; quantities are rounded to 15 fractional digits
//! and prices to 10 on the way out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::broker::{
    BrokerClient, BrokerError, BrokerResult, LimitBuyRequest, MarketSellRequest,
};
use crate::domain::entities::order::{
    OrderSide, OrderSnapshot, OrderState, OrderType, Position,
};

const PAPER_API_BASE: &str = "https://paper-api.alpaca.markets";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const PRICE_SCALE: u32 = 10;
const QTY_SCALE: u32 = 15;

#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    pub api_base: String,
    pub api_key: String,
    pub api_secret: String,
}

impl AlpacaConfig {
    pub fn new(api_key: &str, api_secret: &str, api_base: Option<&str>) -> Self {
        Self {
            api_base: api_base.unwrap_or(PAPER_API_BASE).trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    pub fn is_paper(&self) -> bool {
        self.api_base.contains("paper-api")
    }
}

/// Order payload for POST /v2/orders.
#[derive(Debug, Serialize)]
struct AlpacaOrderRequest {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    client_order_id: String,
}

/// Order as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub qty: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
    pub limit_price: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaApiError {
    message: Option<String>,
}

fn parse_decimal(field: &str, raw: &str) -> BrokerResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| BrokerError::Protocol(format!("{}: '{}' ({})", field, raw, e)))
}

fn parse_decimal_opt(field: &str, raw: Option<&str>) -> BrokerResult<Option<Decimal>> {
    match raw {
        Some(s) if !s.is_empty() => parse_decimal(field, s).map(Some),
        _ => Ok(None),
    }
}

impl AlpacaOrder {
    pub fn into_snapshot(self) -> BrokerResult<OrderSnapshot> {
        let side = match self.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => return Err(BrokerError::Protocol(format!("side: '{}'", other))),
        };
        let order_type = match self.order_type.as_str() {
            "market" => OrderType::Market,
            "limit" => OrderType::Limit,
            other => return Err(BrokerError::Protocol(format!("order type: '{}'", other))),
        };
        Ok(OrderSnapshot {
            id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side,
            order_type,
            qty: parse_decimal_opt("qty", self.qty.as_deref())?,
            filled_qty: parse_decimal_opt("filled_qty", self.filled_qty.as_deref())?
                .unwrap_or(Decimal::ZERO),
            filled_avg_price: parse_decimal_opt(
                "filled_avg_price",
                self.filled_avg_price.as_deref(),
            )?,
            limit_price: parse_decimal_opt("limit_price", self.limit_price.as_deref())?,
            status: OrderState::parse(&self.status),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Alpaca REST client
pub struct AlpacaClient {
    client: Client,
    config: AlpacaConfig,
}

impl AlpacaClient {
    pub fn new(config: AlpacaConfig) -> Self {
        info!(
            "Alpaca client targeting {} ({})",
            config.api_base,
            if config.is_paper() { "paper" } else { "LIVE" }
        );
        Self {
            client: Client::new(),
            config,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.api_base, path);
        self.client
            .request(method, url)
            .timeout(timeout)
            .header("APCA-API-KEY-ID", &self.config.api_key)
            .header("APCA-API-SECRET-KEY", &self.config.api_secret)
    }

    async fn error_for_status(response: reqwest::Response) -> BrokerError {
        let status = response.status();
        let message = match response.json::<AlpacaApiError>().await {
            Ok(body) => body.message.unwrap_or_default(),
            Err(_) => String::new(),
        };
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            BrokerError::Auth(message)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            BrokerError::RateLimited
        } else if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            BrokerError::InvalidRequest(message)
        } else {
            BrokerError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    fn map_send_error(timeout: Duration, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout(timeout)
        } else {
            BrokerError::Transient(e.to_string())
        }
    }

    async fn submit_order(&self, payload: &AlpacaOrderRequest) -> BrokerResult<OrderSnapshot> {
        let response = self
            .request(reqwest::Method::POST, "/v2/orders", WRITE_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| Self::map_send_error(WRITE_TIMEOUT, e))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let order: AlpacaOrder = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("order response: {}", e)))?;

        info!(
            "Order placed: {} {} {} (id {})",
            payload.side, payload.qty, payload.symbol, order.id
        );
        order.into_snapshot()
    }

    /// Position lookup path; the broker wants the slash encoded.
    fn position_path(symbol: &str) -> String {
        format!("/v2/positions/{}", symbol.replace('/', "%2F"))
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    fn name(&self) -> &str {
        "alpaca"
    }

    async fn place_limit_buy(&self, request: &LimitBuyRequest) -> BrokerResult<OrderSnapshot> {
        let payload = AlpacaOrderRequest {
            symbol: request.symbol.clone(),
            qty: request.qty.round_dp(QTY_SCALE).normalize().to_string(),
            side: "buy".to_string(),
            order_type: "limit".to_string(),
            // Crypto rejects 'day'; everything the engine places is GTC.
            time_in_force: "gtc".to_string(),
            limit_price: Some(request.limit_price.round_dp(PRICE_SCALE).normalize().to_string()),
            client_order_id: request.client_order_id.clone(),
        };
        self.submit_order(&payload).await
    }

    async fn place_market_sell(&self, request: &MarketSellRequest) -> BrokerResult<OrderSnapshot> {
        let payload = AlpacaOrderRequest {
            symbol: request.symbol.clone(),
            qty: request.qty.round_dp(QTY_SCALE).normalize().to_string(),
            side: "sell".to_string(),
            order_type: "market".to_string(),
            time_in_force: "gtc".to_string(),
            limit_price: None,
            client_order_id: request.client_order_id.clone(),
        };
        self.submit_order(&payload).await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let path = format!("/v2/orders/{}", order_id);
        let response = self
            .request(reqwest::Method::DELETE, &path, WRITE_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::map_send_error(WRITE_TIMEOUT, e))?;

        // 404 means the order is already gone, which is what we wanted.
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            debug!("Cancel requested for order {}", order_id);
            return Ok(());
        }
        Err(Self::error_for_status(response).await)
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<Option<OrderSnapshot>> {
        let path = format!("/v2/orders/{}", order_id);
        let response = self
            .request(reqwest::Method::GET, &path, READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::map_send_error(READ_TIMEOUT, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let order: AlpacaOrder = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("order response: {}", e)))?;
        order.into_snapshot().map(Some)
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let response = self
            .request(
                reqwest::Method::GET,
                "/v2/orders?status=open&limit=500",
                READ_TIMEOUT,
            )
            .send()
            .await
            .map_err(|e| Self::map_send_error(READ_TIMEOUT, e))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let orders: Vec<AlpacaOrder> = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("open orders response: {}", e)))?;
        orders.into_iter().map(AlpacaOrder::into_snapshot).collect()
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
        let response = self
            .request(reqwest::Method::GET, &Self::position_path(symbol), READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::map_send_error(READ_TIMEOUT, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let position: AlpacaPosition = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("position response: {}", e)))?;

        Ok(Some(Position {
            symbol: position.symbol,
            qty: parse_decimal("qty", &position.qty)?,
            avg_entry_price: parse_decimal_opt(
                "avg_entry_price",
                position.avg_entry_price.as_deref(),
            )?,
        }))
    }
}
