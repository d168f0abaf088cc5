// =============================================================================
// Aggregated Quote Book — per-symbol top-of-book across LPs
// =============================================================================
//
// Each LP owns exactly one slot per symbol; a new quote replaces the old
// one.  Readers lock only the symbol they are interested in.  Staleness is
// applied at read time so a stale quote can never feed selection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::lp::Quote;

pub struct QuoteBook {
    /// symbol -> (lp_id -> latest quote). The outer lock guards map growth.
    books: RwLock<HashMap<String, Arc<RwLock<HashMap<String, Quote>>>>>,
}

/// Derived best bid/ask for a symbol, with the owning LPs.
#[derive(Debug, Clone, Serialize)]
pub struct BestBook {
    pub symbol: String,
    pub bid: f64,
    pub bid_lp: String,
    pub ask: f64,
    pub ask_lp: String,
}

impl QuoteBook {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, symbol: &str) -> Arc<RwLock<HashMap<String, Quote>>> {
        if let Some(slot) = self.books.read().get(symbol) {
            return Arc::clone(slot);
        }
        let mut books = self.books.write();
        Arc::clone(
            books
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new()))),
        )
    }

    /// Insert (replace) an LP's quote for its symbol.
    pub fn insert(&self, quote: Quote) {
        let slot = self.slot(&quote.symbol);
        slot.write().insert(quote.lp_id.clone(), quote);
    }

    /// All quotes for `symbol` no older than `staleness`.
    pub fn fresh(&self, symbol: &str, staleness: Duration) -> Vec<Quote> {
        let now = Instant::now();
        let slot = self.slot(symbol);
        let quotes = slot.read();
        let mut out: Vec<Quote> = quotes
            .values()
            .filter(|q| now.duration_since(q.at) <= staleness)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.lp_id.cmp(&b.lp_id));
        out
    }

    /// Best bid/ask across fresh quotes for `symbol`.
    pub fn best(&self, symbol: &str, staleness: Duration) -> Option<BestBook> {
        let fresh = self.fresh(symbol, staleness);
        let best_bid = fresh
            .iter()
            .max_by(|a, b| a.bid.partial_cmp(&b.bid).unwrap_or(std::cmp::Ordering::Equal))?;
        let best_ask = fresh
            .iter()
            .min_by(|a, b| a.ask.partial_cmp(&b.ask).unwrap_or(std::cmp::Ordering::Equal))?;
        Some(BestBook {
            symbol: symbol.to_string(),
            bid: best_bid.bid,
            bid_lp: best_bid.lp_id.clone(),
            ask: best_ask.ask,
            ask_lp: best_ask.lp_id.clone(),
        })
    }

    /// Symbols with at least one quote ever received.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.books.read().keys().cloned().collect();
        out.sort();
        out
    }
}

impl Default for QuoteBook {
    fn default() -> Self {
        Self::new()
    }
}
