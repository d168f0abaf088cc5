// =============================================================================
// FIX LP Adapter — thin wrapper over a session abstraction
// =============================================================================
//
// The FIX wire protocol lives outside this engine.  What the engine
// consumes is a `FixSession`: logon/logout, a market-data subscription that
// pushes quotes into a sink, and single-order send yielding an execution
// report.  The adapter adapts that session to the common LP capability.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::adapter::{AdapterStatus, LpAdapter, OrderRequest, Quote};
use crate::types::ExecutionReport;

// ---------------------------------------------------------------------------
// Session abstraction
// ---------------------------------------------------------------------------

/// A live FIX session owned by the surrounding infrastructure.
///
/// Implementations push market data into the sink handed to `subscribe`
/// and answer `send_order` with the terminal execution report for that
/// order. They must tolerate many concurrent `send_order` callers.
#[async_trait]
pub trait FixSession: Send + Sync {
    async fn logon(&self) -> Result<()>;
    async fn logout(&self);
    fn is_logged_on(&self) -> bool;
    async fn subscribe(&self, symbols: &[String], sink: mpsc::UnboundedSender<Quote>)
        -> Result<()>;
    async fn send_order(&self, req: &OrderRequest) -> Result<ExecutionReport>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Cadence at which the session loop re-checks logon state.
const SESSION_POLL: Duration = Duration::from_secs(1);

pub struct FixAdapter {
    lp_id: String,
    session: Arc<dyn FixSession>,
    quote_tx: mpsc::UnboundedSender<Quote>,
    quote_rx: Mutex<Option<mpsc::UnboundedReceiver<Quote>>>,
    subscribed: RwLock<Vec<String>>,
    last_quote: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
}

impl FixAdapter {
    pub fn new(lp_id: impl Into<String>, session: Arc<dyn FixSession>) -> Self {
        let (quote_tx, quote_rx) = mpsc::unbounded_channel();
        Self {
            lp_id: lp_id.into(),
            session,
            quote_tx,
            quote_rx: Mutex::new(Some(quote_rx)),
            subscribed: RwLock::new(Vec::new()),
            last_quote: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

#[async_trait]
impl LpAdapter for FixAdapter {
    fn id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> Result<()> {
        self.session.logon().await?;
        *self.last_error.write() = None;
        debug!(lp = %self.lp_id, "FIX session logged on");
        Ok(())
    }

    async fn disconnect(&self) {
        self.session.logout().await;
        debug!(lp = %self.lp_id, "FIX session logged out");
    }

    fn is_connected(&self) -> bool {
        self.session.is_logged_on()
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        *self.subscribed.write() = symbols.to_vec();
        self.session
            .subscribe(symbols, self.quote_tx.clone())
            .await?;
        debug!(lp = %self.lp_id, ?symbols, "FIX market data subscription sent");
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
        let report = self.session.send_order(req).await?;
        if report.rejected {
            warn!(lp = %self.lp_id, order = %req.order_id, "FIX order rejected");
        }
        Ok(report)
    }

    async fn run_quote_session(&self) -> Result<()> {
        if !self.is_connected() {
            self.connect().await?;
            let symbols = self.subscribed.read().clone();
            if !symbols.is_empty() {
                self.session
                    .subscribe(&symbols, self.quote_tx.clone())
                    .await?;
            }
        }
        // Quotes flow from the session directly; this loop only watches the
        // logon state so the manager can drive reconnects.
        loop {
            tokio::time::sleep(SESSION_POLL).await;
            if !self.session.is_logged_on() {
                let msg = "FIX session lost logon".to_string();
                *self.last_error.write() = Some(msg.clone());
                anyhow::bail!(msg);
            }
        }
    }
}

impl std::fmt::Debug for FixAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixAdapter")
            .field("lp_id", &self.lp_id)
            .field("logged_on", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Side;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted in-memory session for adapter and manager tests.
    pub(crate) struct ScriptedSession {
        logged_on: AtomicBool,
        pub fill_price: f64,
    }

    impl ScriptedSession {
        pub(crate) fn new(fill_price: f64) -> Self {
            Self {
                logged_on: AtomicBool::new(false),
                fill_price,
            }
        }
    }

    #[async_trait]
    impl FixSession for ScriptedSession {
        async fn logon(&self) -> Result<()> {
            self.logged_on.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn logout(&self) {
            self.logged_on.store(false, Ordering::SeqCst);
        }

        fn is_logged_on(&self) -> bool {
            self.logged_on.load(Ordering::SeqCst)
        }

        async fn subscribe(
            &self,
            symbols: &[String],
            sink: mpsc::UnboundedSender<Quote>,
        ) -> Result<()> {
            for symbol in symbols {
                let _ = sink.send(Quote {
                    lp_id: "lp-fix".into(),
                    symbol: symbol.clone(),
                    bid: self.fill_price - 0.0001,
                    ask: self.fill_price,
                    at: Instant::now(),
                });
            }
            Ok(())
        }

        async fn send_order(&self, req: &OrderRequest) -> Result<ExecutionReport> {
            Ok(ExecutionReport {
                lp_id: "lp-fix".into(),
                order_id: req.order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                volume: req.volume,
                fill_price: Some(self.fill_price),
                rejected: false,
                latency_ms: 1.0,
            })
        }
    }

    #[tokio::test]
    async fn logon_logout_roundtrip() {
        let adapter = FixAdapter::new("lp-fix", Arc::new(ScriptedSession::new(1.1)));
        assert!(!adapter.is_connected());
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
        adapter.disconnect().await;
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn subscription_pushes_quotes_into_stream() {
        let adapter = FixAdapter::new("lp-fix", Arc::new(ScriptedSession::new(1.1)));
        adapter.connect().await.unwrap();
        let mut rx = adapter.take_quote_stream().unwrap();
        adapter.subscribe(&["EURUSD".to_string()]).await.unwrap();

        let quote = rx.recv().await.unwrap();
        assert_eq!(quote.symbol, "EURUSD");
        assert!((quote.ask - 1.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn orders_flow_through_the_session() {
        let adapter = FixAdapter::new("lp-fix", Arc::new(ScriptedSession::new(1.2345)));
        adapter.connect().await.unwrap();

        let report = adapter
            .send_order(&OrderRequest {
                order_id: "o1".into(),
                symbol: "EURUSD".into(),
                side: Side::Buy,
                volume: 2.0,
                price: None,
            })
            .await
            .unwrap();

        assert!(report.is_fill());
        assert!((report.fill_price.unwrap() - 1.2345).abs() < 1e-12);
        assert!((report.volume - 2.0).abs() < 1e-12);
    }
}
