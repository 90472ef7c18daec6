//! Account trade-update stream consumer.
//!
//! Listens to the broker's order lifecycle stream and forwards normalized
//! `TradeEvent`s into the runtime. These events drive every cycle state
//! mutation, so unlike quotes they are never dropped: the channel send
//! awaits instead of trying.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::alpaca_client::AlpacaOrder;
use super::ws::{ReconnectPolicy, IDLE_TIMEOUT};
use crate::domain::entities::order::{TradeEvent, TradeEventKind};

#[derive(Debug, Clone)]
pub struct TradeStreamConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl TradeStreamConfig {
    /// Derive the stream endpoint from the REST base URL.
    pub fn from_rest_base(api_key: &str, api_secret: &str, rest_base: &str) -> Self {
        let url = format!(
            "{}/stream",
            rest_base
                .trim_end_matches('/')
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1)
        );
        Self {
            url,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }
}

pub struct TradeStream {
    config: TradeStreamConfig,
    tx: mpsc::Sender<TradeEvent>,
    connected: Arc<AtomicBool>,
}

impl TradeStream {
    pub fn spawn(
        config: TradeStreamConfig,
        tx: mpsc::Sender<TradeEvent>,
        connected: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let stream = Self {
            config,
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
                info!("Trade-update channel closed, trade stream stopping");
                return;
            }

            match self.run_session().await {
                Ok(()) => {
                    attempt = 1;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!("Trade stream session ended: {} (attempt {})", e, attempt);
                }
            }
            self.connected.store(false, Ordering::Relaxed);

            let delay = policy.delay(attempt.max(1));
            debug!("Trade stream reconnecting in {:?}", delay);
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

        let listen = json!({
            "action": "listen",
            "data": { "streams": ["trade_updates"] },
        });
        write
            .send(Message::Text(listen.to_string()))
            .await
            .map_err(|e| format!("listen send failed: {}", e))?;

        info!("Trade-update stream connected");
        self.connected.store(true, Ordering::Relaxed);

        loop {
            let message = match tokio::time::timeout(IDLE_TIMEOUT, read.next()).await {
                Ok(Some(message)) => message.map_err(|e| format!("read failed: {}", e))?,
                Ok(None) => return Ok(()),
                Err(_) => return Err(format!("idle for {:?}", IDLE_TIMEOUT)),
            };

            match message {
                Message::Text(text) => {
                    if let Some(event) = parse_trade_update(&text) {
                        // State mutations ride on these; block rather than drop.
                        if self.tx.send(event).await.is_err() {
                            return Err("trade-update channel closed".to_string());
                        }
                    }
                }
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        if let Some(event) = parse_trade_update(&text) {
                            if self.tx.send(event).await.is_err() {
                                return Err("trade-update channel closed".to_string());
                            }
                        }
                    }
                }
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| format!("pong failed: {}", e))?;
                }
                Message::Close(frame) => {
                    info!("Trade stream closed by server: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

/// Parse one stream message into a `TradeEvent`.
///
/// Non-trade-update frames (auth acks, listen acks) return None. A
/// recognized event whose order payload cannot be decoded is logged and
/// dropped; reconciliation picks up whatever it implied.
fn parse_trade_update(text: &str) -> Option<TradeEvent> {
    let payload: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable trade stream message: {} ({})", text, e);
            return None;
        }
    };

    if payload["stream"].as_str() != Some("trade_updates") {
        debug!("Trade stream control message: {}", payload);
        return None;
    }

    let data = &payload["data"];
    let kind = TradeEventKind::parse(data["event"].as_str()?)?;

    let order: AlpacaOrder = match serde_json::from_value(data["order"].clone()) {
        Ok(order) => order,
        Err(e) => {
            error!("Trade update order payload undecodable: {} ({})", data, e);
            return None;
        }
    };
    let mut snapshot = match order.into_snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Trade update order payload invalid: {}", e);
            return None;
        }
    };

    // Execution-level price/qty fill in when the order object lags behind.
    if snapshot.filled_avg_price.is_none() {
        snapshot.filled_avg_price = super::market_stream::json_decimal(&data["price"]);
    }
    if snapshot.filled_qty.is_zero() {
        if let Some(qty) = super::market_stream::json_decimal(&data["qty"]) {
            snapshot.filled_qty = qty;
        }
    }

    Some(TradeEvent {
        kind,
        order: snapshot,
    })
}
