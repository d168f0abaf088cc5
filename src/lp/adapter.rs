// =============================================================================
// LP Adapter capability — one trait, three transports
// =============================================================================
//
// Every liquidity provider, whatever its transport, exposes the same narrow
// capability: connect, subscribe, a quote stream, order sending, and a
// status probe.  Adapters are safe for one concurrent reader on the quote
// stream and many concurrent callers on send_order.
//
// Quote production runs inside `run_quote_session`: one call drives one
// transport session until it ends or errors, and the manager loops it with
// a reconnect delay.
// =============================================================================

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ExecutionReport, Side};

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

/// A single two-way price from an LP.
#[derive(Debug, Clone)]
pub struct Quote {
    pub lp_id: String,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub at: Instant,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// A quote with a crossed or non-positive market never enters the book.
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask >= self.bid && self.bid.is_finite() && self.ask.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Requests / status
// ---------------------------------------------------------------------------

/// An order handed to an LP adapter.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// Limit price; `None` sends at market.
    pub price: Option<f64>,
}

/// Transport-level status of an adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub connected: bool,
    /// Milliseconds since the last quote, if any was ever received.
    pub last_quote_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LpAdapter: Send + Sync {
    /// Stable LP id this adapter serves.
    fn id(&self) -> &str;

    /// Establish the transport. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport. Idempotent.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Replace the symbol subscription set.
    async fn subscribe(&self, symbols: &[String]) -> Result<()>;

    /// Take the receiving end of the quote stream. Yields `Some` exactly
    /// once; the stream supports a single concurrent reader.
    fn take_quote_stream(&self) -> Option<mpsc::UnboundedReceiver<Quote>>;

    fn status(&self) -> AdapterStatus;

    /// Send one order and wait for its execution report. Callers enforce
    /// their own deadline; dropping the future cancels the attempt.
    async fn send_order(&self, req: &OrderRequest) -> Result<ExecutionReport>;

    /// Drive one quote-producing transport session to completion. Returns
    /// `Ok` on orderly stream end and `Err` on transport failure; the
    /// manager loops this with a reconnect delay either way.
    async fn run_quote_session(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote {
            lp_id: "lp1".into(),
            symbol: "EURUSD".into(),
            bid,
            ask,
            at: Instant::now(),
        }
    }

    #[test]
    fn quote_validity() {
        assert!(quote(1.1000, 1.1001).is_valid());
        // Crossed market.
        assert!(!quote(1.1002, 1.1001).is_valid());
        assert!(!quote(0.0, 1.1001).is_valid());
        assert!(!quote(f64::NAN, 1.1001).is_valid());
    }

    #[test]
    fn quote_mid() {
        let q = quote(1.0, 1.2);
        assert!((q.mid() - 1.1).abs() < 1e-12);
    }
}
