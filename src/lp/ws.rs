// =============================================================================
// WebSocket LP Adapter — streamed quotes, HTTP order placement
// =============================================================================
//
// Quotes arrive over a WebSocket subscription; orders go out over the LP's
// HTTP order endpoint (the usual split for streaming venues).  One
// `run_quote_session` call drives one socket session: dial, subscribe,
// consume until the stream ends or errors, then return so the manager can
// handle reconnection.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::adapter::{AdapterStatus, LpAdapter, OrderRequest, Quote};
use crate::types::{ExecutionReport, Side};

/// Connection settings carried in `LpConfig::settings` for WebSocket LPs.
/// No Debug derive: the API key must never reach a log line.
#[derive(Clone, Deserialize)]
pub struct WsSettings {
    pub ws_url: String,
    /// HTTP endpoint for order placement. Orders are unsupported without it.
    #[serde(default)]
    pub order_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
}

pub struct WsAdapter {
    lp_id: String,
    settings: WsSettings,
    http: reqwest::Client,
    connected: AtomicBool,
    /// Set by `disconnect` to make the read loop exit.
    shutdown: AtomicBool,
    subscribed: RwLock<Vec<String>>,
    quote_tx: mpsc::UnboundedSender<Quote>,
    quote_rx: Mutex<Option<mpsc::UnboundedReceiver<Quote>>>,
    last_quote: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
}

impl WsAdapter {
    pub fn new(lp_id: impl Into<String>, settings: WsSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (quote_tx, quote_rx) = mpsc::unbounded_channel();

        Self {
            lp_id: lp_id.into(),
            settings,
            http,
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            subscribed: RwLock::new(Vec::new()),
            quote_tx,
            quote_rx: Mutex::new(Some(quote_rx)),
            last_quote: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Parse a quote push message.
    ///
    /// Expected shape:
    /// ```json
    /// { "symbol": "EURUSD", "bid": 1.1000, "ask": 1.1001 }
    /// ```
    fn parse_quote(&self, text: &str) -> Option<Quote> {
        let root: serde_json::Value = serde_json::from_str(text).ok()?;
        let symbol = root["symbol"].as_str()?;
        let quote = Quote {
            lp_id: self.lp_id.clone(),
            symbol: symbol.to_string(),
            bid: root["bid"].as_f64().unwrap_or(0.0),
            ask: root["ask"].as_f64().unwrap_or(0.0),
            at: Instant::now(),
        };
        quote.is_valid().then_some(quote)
    }
}

#[async_trait]
impl LpAdapter for WsAdapter {
    fn id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> Result<()> {
        if !self.settings.ws_url.starts_with("ws://") && !self.settings.ws_url.starts_with("wss://")
        {
            anyhow::bail!("invalid WebSocket url {}", self.settings.ws_url);
        }
        self.shutdown.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        debug!(lp = %self.lp_id, "WebSocket adapter disconnect requested");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        *self.subscribed.write() = symbols.to_vec();
        debug!(lp = %self.lp_id, ?symbols, "WebSocket subscription set (applies on next session)");
        Ok(())
    }

    fn take_quote_stream(&self) -> Option<mpsc::UnboundedReceiver<Quote>> {
        self.quote_rx.lock().take()
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            connected: self.is_connected(),
            last_quote_age_ms: self
                .last_quote
                .read()
                .map(|t| t.elapsed().as_millis() as u64),
            error: self.last_error.read().clone(),
        }
    }

    async fn send_order(&self, req: &OrderRequest) -> Result<ExecutionReport> {
        let Some(order_url) = &self.settings.order_url else {
            anyhow::bail!("LP {} has no order endpoint configured", self.lp_id);
        };

        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let body = serde_json::json!({
            "clientOrderId": req.order_id,
            "symbol": req.symbol,
            "side": side,
            "volume": req.volume,
            "price": req.price,
        });

        let started = Instant::now();
        let resp = self
            .http
            .post(order_url)
            .header("X-API-KEY", &self.settings.api_key)
            .json(&body)
            .send()
            .await
            .context("order POST request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order body")?;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let rejected = !status.is_success()
            || body["status"].as_str().map(|s| s != "FILLED").unwrap_or(true);
        let fill_price = if rejected { None } else { body["price"].as_f64() };

        if rejected {
            warn!(lp = %self.lp_id, order = %req.order_id, %status, "order rejected");
        }

        Ok(ExecutionReport {
            lp_id: self.lp_id.clone(),
            order_id: req.order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            volume: req.volume,
            fill_price,
            rejected,
            latency_ms,
        })
    }

    async fn run_quote_session(&self) -> Result<()> {
        let url = &self.settings.ws_url;
        info!(lp = %self.lp_id, url = %url, "connecting to quote WebSocket");

        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to quote WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        // Subscribe to the configured symbol set.
        let symbols = self.subscribed.read().clone();
        let sub = serde_json::json!({ "op": "subscribe", "symbols": symbols });
        write
            .send(tokio_tungstenite::tungstenite::Message::Text(sub.to_string()))
            .await
            .context("failed to send subscription")?;

        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;
        info!(lp = %self.lp_id, ?symbols, "quote WebSocket connected");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.connected.store(false, Ordering::SeqCst);
                return Ok(());
            }
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        if let Some(quote) = self.parse_quote(&text) {
                            *self.last_quote.write() = Some(quote.at);
                            if self.quote_tx.send(quote).is_err() {
                                self.connected.store(false, Ordering::SeqCst);
                                anyhow::bail!("quote stream consumer dropped");
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    *self.last_error.write() = Some(e.to_string());
                    return Err(e.into());
                }
                None => {
                    warn!(lp = %self.lp_id, "quote WebSocket stream ended");
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for WsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsAdapter")
            .field("lp_id", &self.lp_id)
            .field("ws_url", &self.settings.ws_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WsAdapter {
        WsAdapter::new(
            "lp-ws",
            WsSettings {
                ws_url: "wss://example.invalid/quotes".into(),
                order_url: None,
                api_key: String::new(),
            },
        )
    }

    #[test]
    fn parses_valid_quote_message() {
        let a = adapter();
        let q = a
            .parse_quote(r#"{ "symbol": "EURUSD", "bid": 1.1000, "ask": 1.1001 }"#)
            .unwrap();
        assert_eq!(q.symbol, "EURUSD");
        assert_eq!(q.lp_id, "lp-ws");
        assert!((q.bid - 1.1000).abs() < 1e-12);
    }

    #[test]
    fn drops_malformed_quote_messages() {
        let a = adapter();
        assert!(a.parse_quote("not json").is_none());
        assert!(a.parse_quote(r#"{ "bid": 1.0, "ask": 1.1 }"#).is_none());
        // Crossed market.
        assert!(a
            .parse_quote(r#"{ "symbol": "EURUSD", "bid": 1.2, "ask": 1.1 }"#)
            .is_none());
    }

    #[tokio::test]
    async fn rejects_bad_url_scheme() {
        let a = WsAdapter::new(
            "lp-ws",
            WsSettings {
                ws_url: "http://example.invalid".into(),
                order_url: None,
                api_key: String::new(),
            },
        );
        assert!(a.connect().await.is_err());
    }

    #[tokio::test]
    async fn order_without_endpoint_is_an_error() {
        let a = adapter();
        let req = OrderRequest {
            order_id: "o1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 1.0,
            price: None,
        };
        assert!(a.send_order(&req).await.is_err());
    }
}
