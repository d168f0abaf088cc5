// =============================================================================
// Smart Order Router — LP selection over the aggregated quote book
// =============================================================================
//
// Selection for (symbol, side, volume):
//   1. Candidates: LPs with a fresh quote, not disconnected, enabled, and
//      whitelisted for the symbol.
//   2. Sort by taker-side price (lowest ask for buys, highest bid for
//      sells), then health score descending, then config priority
//      ascending, then lp id for a stable total order.
//   3. If the best candidate's score is below the unhealthy threshold,
//      fail over to the first candidate at or above it whose price is
//      within the pip tolerance of the best; otherwise take the best
//      anyway and tag the selection degraded.
//
// Selection failure is a value (`Unavailable`), never an error.
// =============================================================================

pub mod book;
pub mod health;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

pub use self::book::{BestBook, QuoteBook};
pub use self::health::{ConnectionState, ExecOutcome, HealthTracker, LpHealthSnapshot};

use crate::config::EngineConfig;
use crate::lp::{LpManager, Quote};
use crate::types::Side;
use crate::volatility::VolatilityTracker;

/// A concrete LP pick.
#[derive(Debug, Clone, Serialize)]
pub struct LpSelection {
    pub lp_id: String,
    pub session_handle: String,
    /// Indicative taker price used for the pick.
    pub price: f64,
    /// True when every eligible LP was below the health threshold.
    pub degraded: bool,
}

/// Outcome of a selection attempt.
#[derive(Debug, Clone, Serialize)]
pub enum SelectOutcome {
    Selected(LpSelection),
    /// No fresh quote from any eligible LP.
    Unavailable,
}

impl SelectOutcome {
    pub fn selection(&self) -> Option<&LpSelection> {
        match self {
            Self::Selected(sel) => Some(sel),
            Self::Unavailable => None,
        }
    }
}

struct Candidate {
    quote: Quote,
    taker_price: f64,
    score: f64,
    priority: u32,
}

pub struct SmartOrderRouter {
    book: QuoteBook,
    health: Arc<HealthTracker>,
    lp_manager: Arc<LpManager>,
    volatility: Arc<VolatilityTracker>,
    staleness: Duration,
    pip_tolerance: f64,
    unhealthy_below: f64,
}

impl SmartOrderRouter {
    pub fn new(
        config: &EngineConfig,
        lp_manager: Arc<LpManager>,
        volatility: Arc<VolatilityTracker>,
    ) -> Self {
        let health = Arc::new(HealthTracker::new(
            config.health_weights,
            config.lp_health_unhealthy_below,
            config.lp_health_recovery_above,
        ));
        Self {
            book: QuoteBook::new(),
            health,
            lp_manager,
            volatility,
            staleness: Duration::from_millis(config.quote_staleness_ms),
            pip_tolerance: config.pip_tolerance,
            unhealthy_below: config.lp_health_unhealthy_below,
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Accept one LP quote: book slot, health heartbeat, volatility sample.
    pub fn ingest_quote(&self, quote: Quote) {
        if !quote.is_valid() {
            trace!(lp = %quote.lp_id, symbol = %quote.symbol, "invalid quote dropped");
            return;
        }
        self.health.record_quote(&quote.lp_id);
        self.volatility.record_mid(&quote.symbol, quote.mid());
        self.book.insert(quote);
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Pick an LP for (symbol, side, volume).
    pub fn select(&self, symbol: &str, side: Side, volume: f64) -> SelectOutcome {
        let mut candidates: Vec<Candidate> = self
            .book
            .fresh(symbol, self.staleness)
            .into_iter()
            .filter_map(|quote| {
                let config = self.lp_manager.config(&quote.lp_id)?;
                if !config.enabled || !config.allows_symbol(symbol) {
                    return None;
                }
                if self.health.state(&quote.lp_id) == ConnectionState::Disconnected {
                    return None;
                }
                let taker_price = match side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                Some(Candidate {
                    score: self.health.score(&quote.lp_id),
                    priority: config.priority,
                    taker_price,
                    quote,
                })
            })
            .collect();

        if candidates.is_empty() {
            debug!(symbol, side = %side, volume, "no eligible LP");
            return SelectOutcome::Unavailable;
        }

        candidates.sort_by(|a, b| {
            let price = match side {
                Side::Buy => a
                    .taker_price
                    .partial_cmp(&b.taker_price)
                    .unwrap_or(std::cmp::Ordering::Equal),
                Side::Sell => b
                    .taker_price
                    .partial_cmp(&a.taker_price)
                    .unwrap_or(std::cmp::Ordering::Equal),
            };
            price
                .then(
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.priority.cmp(&b.priority))
                .then(a.quote.lp_id.cmp(&b.quote.lp_id))
        });

        let best = &candidates[0];
        let (chosen, degraded) = if best.score < self.unhealthy_below {
            // Failover: a healthy LP within the pip tolerance of the best
            // price beats a sick LP at the top of the book.
            match candidates.iter().find(|c| {
                c.score >= self.unhealthy_below
                    && (c.taker_price - best.taker_price).abs() <= self.pip_tolerance
            }) {
                Some(healthy) => (healthy, false),
                None => {
                    warn!(symbol, lp = %best.quote.lp_id, score = best.score, "degraded selection");
                    (best, true)
                }
            }
        } else {
            (best, false)
        };

        debug!(
            symbol,
            side = %side,
            volume,
            lp = %chosen.quote.lp_id,
            price = chosen.taker_price,
            score = chosen.score,
            degraded,
            "LP selected"
        );

        SelectOutcome::Selected(LpSelection {
            lp_id: chosen.quote.lp_id.clone(),
            session_handle: self.lp_manager.session_handle(&chosen.quote.lp_id),
            price: chosen.taker_price,
            degraded,
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn book(&self) -> &QuoteBook {
        &self.book
    }
}

impl std::fmt::Debug for SmartOrderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartOrderRouter")
            .field("staleness", &self.staleness)
            .field("pip_tolerance", &self.pip_tolerance)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp::{LpConfig, LpKind};
    use std::time::Instant;

    fn lp_config(id: &str, priority: u32) -> LpConfig {
        LpConfig {
            id: id.into(),
            name: id.into(),
            kind: LpKind::Fix,
            enabled: true,
            priority,
            session_handle: Some(format!("sess-{id}")),
            symbol_whitelist: None,
            settings: serde_json::Value::Null,
        }
    }

    fn sor_with(configs: Vec<LpConfig>) -> SmartOrderRouter {
        let manager = Arc::new(LpManager::new(vec![]));
        for cfg in configs {
            manager.add_lp(cfg).unwrap();
        }
        let volatility = Arc::new(VolatilityTracker::new(Duration::from_secs(300)));
        SmartOrderRouter::new(&EngineConfig::default(), manager, volatility)
    }

    fn quote(lp: &str, symbol: &str, bid: f64, ask: f64) -> Quote {
        Quote {
            lp_id: lp.into(),
            symbol: symbol.into(),
            bid,
            ask,
            at: Instant::now(),
        }
    }

    #[test]
    fn picks_best_ask_for_buys() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1001));

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        let sel = sel.selection().expect("selection");
        assert_eq!(sel.lp_id, "LP1");
        assert!((sel.price - 1.1000).abs() < 1e-12);
        assert_eq!(sel.session_handle, "sess-LP1");
        assert!(!sel.degraded);
    }

    #[test]
    fn picks_best_bid_for_sells() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0998, 1.1001));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1001));

        let sel = sor.select("EURUSD", Side::Sell, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");
    }

    #[test]
    fn stale_quotes_never_selected() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        // LP1 is connected but its only quote (the better ask) has aged out.
        sor.health.record_quote("LP1");
        let mut stale = quote("LP1", "EURUSD", 1.0990, 1.0995);
        stale.at = Instant::now() - Duration::from_secs(6);
        sor.book.insert(stale);
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1001));

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");
    }

    #[test]
    fn all_stale_is_unavailable() {
        let sor = sor_with(vec![lp_config("LP1", 1)]);
        sor.health.record_quote("LP1");
        let mut stale = quote("LP1", "EURUSD", 1.0999, 1.1000);
        stale.at = Instant::now() - Duration::from_secs(10);
        sor.book.insert(stale);

        assert!(matches!(
            sor.select("EURUSD", Side::Buy, 0.1),
            SelectOutcome::Unavailable
        ));
    }

    #[test]
    fn disconnected_lps_excluded() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1001));
        sor.health.mark_disconnected("LP1");

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");
    }

    #[test]
    fn whitelist_excludes_symbol() {
        let mut cfg = lp_config("LP1", 1);
        cfg.symbol_whitelist = Some(vec!["GBPUSD".into()]);
        let sor = sor_with(vec![cfg, lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1001));

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");
    }

    #[test]
    fn failover_to_healthy_lp_within_one_pip() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.10005));

        // Drive LP1 below the health threshold.
        sor.health.record_execution("LP1", ExecOutcome::reject(100.0));
        sor.health.record_execution("LP1", ExecOutcome::reject(200.0));
        assert!(sor.health.score("LP1") < 0.5);

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        let sel = sel.selection().unwrap();
        assert_eq!(sel.lp_id, "LP2");
        assert!(!sel.degraded);
    }

    #[test]
    fn no_healthy_alternative_is_degraded_best() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        // LP2 is more than one pip worse, so failover cannot use it.
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1005));

        sor.health.record_execution("LP1", ExecOutcome::reject(100.0));
        sor.health.record_execution("LP1", ExecOutcome::reject(200.0));

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        let sel = sel.selection().unwrap();
        assert_eq!(sel.lp_id, "LP1");
        assert!(sel.degraded);
    }

    #[test]
    fn equal_price_breaks_on_health_then_priority() {
        let sor = sor_with(vec![lp_config("LP1", 1), lp_config("LP2", 2)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1000));

        // LP2 has slightly better health than LP1.
        sor.health.record_execution("LP1", ExecOutcome::fill(0.0, 20.0));
        sor.health.record_execution("LP1", ExecOutcome::timeout());
        sor.health.record_execution("LP2", ExecOutcome::fill(0.0, 20.0));

        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");

        // With identical health, lower priority wins.
        let sor = sor_with(vec![lp_config("LP1", 2), lp_config("LP2", 1)]);
        sor.ingest_quote(quote("LP1", "EURUSD", 1.0999, 1.1000));
        sor.ingest_quote(quote("LP2", "EURUSD", 1.0999, 1.1000));
        let sel = sor.select("EURUSD", Side::Buy, 0.1);
        assert_eq!(sel.selection().unwrap().lp_id, "LP2");
    }

    #[test]
    fn ingest_feeds_volatility() {
        let manager = Arc::new(LpManager::new(vec![]));
        manager.add_lp(lp_config("LP1", 1)).unwrap();
        let volatility = Arc::new(VolatilityTracker::new(Duration::from_secs(300)));
        let sor = SmartOrderRouter::new(
            &EngineConfig::default(),
            manager,
            Arc::clone(&volatility),
        );

        sor.ingest_quote(quote("LP1", "EURUSD", 1.0, 1.0));
        sor.ingest_quote(quote("LP1", "EURUSD", 1.03, 1.03));
        assert!(volatility.realized_vol("EURUSD") > 0.02);
    }
}
