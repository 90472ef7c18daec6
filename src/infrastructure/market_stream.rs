//! Market-data stream consumer.
//!
//! Connects to the broker's crypto quote stream, authenticates, subscribes
//! to every enabled symbol, and forwards parsed quotes into the runtime's
//! channel. Reconnects forever with jittered exponential backoff and
//! re-subscribes after every reconnect.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::ws::{ReconnectPolicy, IDLE_TIMEOUT};
use crate::domain::entities::quote::QuoteEvent;

const MARKET_STREAM_URL: &str = "wss://stream.data.alpaca.markets/v1beta3/crypto/us";

#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl MarketStreamConfig {
    pub fn new(api_key: &str, api_secret: &str, url: Option<&str>) -> Self {
        Self {
            url: url.unwrap_or(MARKET_STREAM_URL).to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }
}

pub struct MarketStream {
    config: MarketStreamConfig,
    symbols: Vec<String>,
    tx: mpsc::Sender<QuoteEvent>,
    connected: Arc<AtomicBool>,
}

impl MarketStream {
    /// Spawn the consumer task. It runs until the quote channel closes.
    pub fn spawn(
        config: MarketStreamConfig,
        symbols: Vec<String>,
        tx: mpsc::Sender<QuoteEvent>,
        connected: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let stream = Self {
            config,
            symbols,
            tx,
            connected,
        };
        tokio::spawn(async move {
            stream.run().await;
        })
    }

    async fn run(self) {
        let policy = ReconnectPolicy::default();
        let mut attempt: u32 = 0;

        loop {
            if self.tx.is_closed() {
                info!("Quote channel closed, market stream stopping");
                return;
            }

            match self.run_session().await {
                Ok(()) => {
                    // Clean close from the server; reconnect promptly.
                    attempt = 1;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!("Market stream session ended: {} (attempt {})", e, attempt);
                }
            }
            self.connected.store(false, Ordering::Relaxed);

            let delay = policy.delay(attempt.max(1));
            debug!("Market stream reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&self) -> Result<(), String> {
        let url = Url::parse(&self.config.url).map_err(|e| format!("bad stream url: {}", e))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| format!("connect failed: {}", e))?;
        let (mut write, mut read) = ws_stream.split();

        let auth = json!({
            "action": "auth",
            "key": self.config.api_key,
            "secret": self.config.api_secret,
        });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| format!("auth send failed: {}", e))?;

        let subscribe = json!({
            "action": "subscribe",
            "quotes": self.symbols,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| format!("subscribe send failed: {}", e))?;

        info!(
            "Market stream connected, subscribed to {} symbols",
            self.symbols.len()
        );
        self.connected.store(true, Ordering::Relaxed);

        loop {
            let message = match tokio::time::timeout(IDLE_TIMEOUT, read.next()).await {
                Ok(Some(message)) => message.map_err(|e| format!("read failed: {}", e))?,
                Ok(None) => return Ok(()),
                Err(_) => return Err(format!("idle for {:?}", IDLE_TIMEOUT)),
            };

            match message {
                Message::Text(text) => {
                    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
                        warn!("Unparseable market stream message: {}", text);
                        continue;
                    };
                    // The stream wraps everything in arrays of tagged events.
                    if let Some(events) = payload.as_array() {
                        for event in events {
                            self.dispatch(event).await?;
                        }
                    } else {
                        self.dispatch(&payload).await?;
                    }
                }
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| format!("pong failed: {}", e))?;
                }
                Message::Close(frame) => {
                    info!("Market stream closed by server: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn dispatch(&self, event: &serde_json::Value) -> Result<(), String> {
        match event["T"].as_str() {
            Some("q") => {
                if let Some(quote) = parse_quote(event) {
                    if self.tx.send(quote).await.is_err() {
                        return Err("quote channel closed".to_string());
                    }
                }
            }
            Some("error") => {
                error!("Market stream error event: {}", event);
            }
            Some("success") | Some("subscription") => {
                debug!("Market stream control event: {}", event);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Decode a JSON number or numeric string into a `Decimal`. Shared with the
/// trade stream, whose execution fields arrive in the same two shapes.
pub(crate) fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        // Render the JSON number token and reparse so the digits survive
        // without a float round trip through arithmetic.
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Parse one `"T":"q"` event into a quote. Returns None (and is logged by
/// the caller's silence) for structurally broken events.
fn parse_quote(event: &serde_json::Value) -> Option<QuoteEvent> {
    let symbol = event["S"].as_str()?.to_string();
    let bid_price = json_decimal(&event["bp"])?;
    let ask_price = json_decimal(&event["ap"])?;
    let bid_size = json_decimal(&event["bs"]).unwrap_or(Decimal::ZERO);
    let ask_size = json_decimal(&event["as"]).unwrap_or(Decimal::ZERO);
    let timestamp = event["t"]
        .as_str()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(QuoteEvent {
        symbol,
        bid_price,
        bid_size,
        ask_price,
        ask_size,
        timestamp,
    })
}
