// =============================================================================
// REST LP Adapter — HMAC-SHA256 signed requests, polled quotes
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed
// requests carry the API key as a header and a recvWindow to tolerate minor
// clock drift between the engine and the LP.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::adapter::{AdapterStatus, LpAdapter, OrderRequest, Quote};
use crate::types::{ExecutionReport, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// Connection settings carried in `LpConfig::settings` for REST LPs.
/// No Debug derive: the secret must never reach a log line.
#[derive(Clone, Deserialize)]
pub struct RestSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
    /// Quote poll cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

pub struct RestAdapter {
    lp_id: String,
    settings: RestSettings,
    client: reqwest::Client,
    connected: AtomicBool,
    subscribed: RwLock<Vec<String>>,
    quote_tx: mpsc::UnboundedSender<Quote>,
    quote_rx: Mutex<Option<mpsc::UnboundedReceiver<Quote>>>,
    last_quote: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
}

impl RestAdapter {
    pub fn new(lp_id: impl Into<String>, settings: RestSettings) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&settings.api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (quote_tx, quote_rx) = mpsc::unbounded_channel();

        Self {
            lp_id: lp_id.into(),
            settings,
            client,
            connected: AtomicBool::new(false),
            subscribed: RwLock::new(Vec::new()),
            quote_tx,
            quote_rx: Mutex::new(Some(quote_rx)),
            last_quote: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.settings.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn note_error(&self, err: &anyhow::Error) {
        *self.last_error.write() = Some(err.to_string());
    }

    // -------------------------------------------------------------------------
    // Quote polling
    // -------------------------------------------------------------------------

    /// One poll of the quote endpoint for all subscribed symbols.
    async fn poll_quotes(&self) -> Result<()> {
        let symbols = self.subscribed.read().clone();
        if symbols.is_empty() {
            return Ok(());
        }

        let url = format!(
            "{}/quotes?symbols={}",
            self.settings.base_url,
            symbols.join(",")
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /quotes request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse quotes body")?;
        if !status.is_success() {
            anyhow::bail!("quote poll returned {status}: {body}");
        }

        let now = Instant::now();
        for row in body.as_array().map(|a| a.as_slice()).unwrap_or_default() {
            let Some(symbol) = row["symbol"].as_str() else {
                continue;
            };
            let bid = row["bid"].as_f64().unwrap_or(0.0);
            let ask = row["ask"].as_f64().unwrap_or(0.0);
            let quote = Quote {
                lp_id: self.lp_id.clone(),
                symbol: symbol.to_string(),
                bid,
                ask,
                at: now,
            };
            if !quote.is_valid() {
                continue;
            }
            *self.last_quote.write() = Some(now);
            if self.quote_tx.send(quote).is_err() {
                // Consumer gone: treat the session as over.
                anyhow::bail!("quote stream consumer dropped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LpAdapter for RestAdapter {
    fn id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("{}/ping", self.settings.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /ping request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("LP ping returned {}", resp.status());
        }
        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;
        debug!(lp = %self.lp_id, "REST adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!(lp = %self.lp_id, "REST adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        *self.subscribed.write() = symbols.to_vec();
        debug!(lp = %self.lp_id, ?symbols, "REST subscription set");
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
        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = format!(
            "symbol={}&side={}&volume={}&clientOrderId={}",
            req.symbol, side, req.volume, req.order_id
        );
        if let Some(price) = req.price {
            params.push_str(&format!("&price={price}"));
        }
        let qs = self.signed_query(&params);
        let url = format!("{}/orders?{}", self.settings.base_url, qs);

        let started = Instant::now();
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /orders request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order body")?;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        if !status.is_success() {
            warn!(lp = %self.lp_id, order = %req.order_id, %status, "order rejected at transport");
            return Ok(ExecutionReport {
                lp_id: self.lp_id.clone(),
                order_id: req.order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                volume: req.volume,
                fill_price: None,
                rejected: true,
                latency_ms,
            });
        }

        let fill_price = body["price"].as_f64();
        let rejected = body["status"].as_str().map(|s| s != "FILLED").unwrap_or(true);

        debug!(
            lp = %self.lp_id,
            order = %req.order_id,
            rejected,
            fill_price = ?fill_price,
            latency_ms,
            "order response"
        );

        Ok(ExecutionReport {
            lp_id: self.lp_id.clone(),
            order_id: req.order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            volume: req.volume,
            fill_price: if rejected { None } else { fill_price },
            rejected,
            latency_ms,
        })
    }

    async fn run_quote_session(&self) -> Result<()> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms));
        loop {
            ticker.tick().await;
            if !self.is_connected() {
                return Ok(());
            }
            if let Err(e) = self.poll_quotes().await {
                self.note_error(&e);
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
    }
}

impl std::fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAdapter")
            .field("lp_id", &self.lp_id)
            .field("base_url", &self.settings.base_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RestAdapter {
        RestAdapter::new(
            "lp-rest",
            RestSettings {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "key".into(),
                secret: "secret".into(),
                poll_interval_ms: 50,
            },
        )
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let a = adapter();
        let sig1 = a.sign("symbol=EURUSD&volume=1");
        let sig2 = a.sign("symbol=EURUSD&volume=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn quote_stream_taken_once() {
        let a = adapter();
        assert!(a.take_quote_stream().is_some());
        assert!(a.take_quote_stream().is_none());
    }

    #[test]
    fn starts_disconnected() {
        let a = adapter();
        assert!(!a.is_connected());
        let status = a.status();
        assert!(!status.connected);
        assert!(status.last_quote_age_ms.is_none());
    }
}
