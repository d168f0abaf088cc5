// =============================================================================
// Exposure Tracker — per-symbol net/gross notional with striped locks
// =============================================================================
//
// Tracks the broker's aggregate long/short notional per symbol.  Client
// fills grow one leg; hedge fills shrink net exposure back toward zero in
// the direction of the client trade.  Notional is measured in lots.
//
// Locking: one mutex per symbol (striped), so projections and applications
// for different symbols never contend.  The symbol map itself is only
// write-locked when a new symbol is first seen.
//
// Invariants:
//   - long_notional and short_notional are >= 0 after every update.
//   - Net exposure changes by exactly +/- notional per fill.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{EngineAlert, FillSource, Side};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Exposure limits for a single symbol (lots notional).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExposureLimit {
    pub max_net: f64,
    pub max_gross: f64,
    /// Above this absolute net, routing forces new orders fully A-Book.
    pub auto_hedge_level: f64,
}

impl Default for ExposureLimit {
    fn default() -> Self {
        Self {
            max_net: 500.0,
            max_gross: 1_000.0,
            auto_hedge_level: 300.0,
        }
    }
}

impl ExposureLimit {
    /// Structural check: max_net >= auto_hedge_level >= 0, max_gross >= max_net.
    pub fn validate(&self) -> Result<()> {
        if self.auto_hedge_level < 0.0 {
            anyhow::bail!("auto_hedge_level must be >= 0");
        }
        if self.max_net < self.auto_hedge_level {
            anyhow::bail!(
                "max_net ({}) must be >= auto_hedge_level ({})",
                self.max_net,
                self.auto_hedge_level
            );
        }
        if self.max_gross < self.max_net {
            anyhow::bail!(
                "max_gross ({}) must be >= max_net ({})",
                self.max_gross,
                self.max_net
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-symbol book
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Book {
    long_notional: f64,
    short_notional: f64,
}

impl Book {
    fn net(&self) -> f64 {
        self.long_notional - self.short_notional
    }

    fn gross(&self) -> f64 {
        self.long_notional + self.short_notional
    }
}

/// Serialisable exposure snapshot for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub symbol: String,
    pub long_notional: f64,
    pub short_notional: f64,
    pub net: f64,
    pub gross: f64,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct ExposureTracker {
    /// Striped per-symbol books. The outer lock guards map growth only.
    books: RwLock<HashMap<String, Arc<Mutex<Book>>>>,
    /// Per-symbol limit overrides.
    limits: RwLock<HashMap<String, ExposureLimit>>,
    /// Limit applied to symbols without an override.
    default_limit: ExposureLimit,
    alerts: broadcast::Sender<EngineAlert>,
}

impl ExposureTracker {
    pub fn new(default_limit: ExposureLimit, alerts: broadcast::Sender<EngineAlert>) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            limits: RwLock::new(HashMap::new()),
            default_limit,
            alerts,
        }
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<Book>> {
        if let Some(slot) = self.books.read().get(symbol) {
            return Arc::clone(slot);
        }
        let mut books = self.books.write();
        Arc::clone(
            books
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Book::default()))),
        )
    }

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------

    /// Configure (or replace) the limit for a symbol.
    pub fn set_limit(&self, symbol: &str, limit: ExposureLimit) -> Result<()> {
        limit.validate()?;
        self.limits.write().insert(symbol.to_string(), limit);
        debug!(
            symbol,
            max_net = limit.max_net,
            max_gross = limit.max_gross,
            auto_hedge_level = limit.auto_hedge_level,
            "exposure limit set"
        );
        Ok(())
    }

    /// The effective limit for a symbol: configured or default.
    pub fn limit(&self, symbol: &str) -> ExposureLimit {
        self.limits
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// All configured per-symbol overrides (for persistence).
    pub fn limit_overrides(&self) -> Vec<(String, ExposureLimit)> {
        self.limits
            .read()
            .iter()
            .map(|(s, l)| (s.clone(), *l))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Projection (pure)
    // -------------------------------------------------------------------------

    /// Projected (net, gross) if a client order of `volume` lots on `side`
    /// were accepted. Does not mutate.
    pub fn projection(&self, symbol: &str, side: Side, volume: f64) -> (f64, f64) {
        let slot = self.slot(symbol);
        let book = slot.lock();
        let (long, short) = match side {
            Side::Buy => (book.long_notional + volume, book.short_notional),
            Side::Sell => (book.long_notional, book.short_notional + volume),
        };
        (long - short, long + short)
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply a fill atomically. `price` is carried for the audit log only;
    /// exposure magnitude is the lot volume.
    ///
    /// Client fills grow the leg matching the client side.  Hedge fills
    /// shrink net exposure by exactly `volume` in the direction of the
    /// client trade; if the matching leg is smaller than the hedge, the
    /// remainder flips onto the opposite leg so both legs stay non-negative
    /// and the net delta stays exact.
    pub fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        source: FillSource,
    ) -> Result<ExposureSnapshot> {
        if volume <= 0.0 || !volume.is_finite() {
            anyhow::bail!("invalid fill volume {volume} for {symbol}");
        }

        let slot = self.slot(symbol);
        let snapshot = {
            let mut book = slot.lock();
            match (source, side) {
                (FillSource::Client, Side::Buy) => book.long_notional += volume,
                (FillSource::Client, Side::Sell) => book.short_notional += volume,
                (FillSource::Hedge, Side::Buy) => {
                    let offset = book.long_notional.min(volume);
                    book.long_notional -= offset;
                    book.short_notional += volume - offset;
                }
                (FillSource::Hedge, Side::Sell) => {
                    let offset = book.short_notional.min(volume);
                    book.short_notional -= offset;
                    book.long_notional += volume - offset;
                }
            }
            ExposureSnapshot {
                symbol: symbol.to_string(),
                long_notional: book.long_notional,
                short_notional: book.short_notional,
                net: book.net(),
                gross: book.gross(),
            }
        };

        debug!(
            symbol,
            side = %side,
            volume,
            price,
            source = %source,
            net = snapshot.net,
            gross = snapshot.gross,
            "fill applied"
        );

        let limit = self.limit(symbol);
        if snapshot.net.abs() > limit.max_net {
            warn!(
                symbol,
                net = snapshot.net,
                max_net = limit.max_net,
                "net exposure limit breached"
            );
            // Best-effort: nobody listening is fine.
            let _ = self.alerts.send(EngineAlert::ExposureBreach {
                symbol: symbol.to_string(),
                net: snapshot.net,
                max_net: limit.max_net,
            });
        }

        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Current exposure for one symbol.
    pub fn snapshot(&self, symbol: &str) -> ExposureSnapshot {
        let slot = self.slot(symbol);
        let book = slot.lock();
        ExposureSnapshot {
            symbol: symbol.to_string(),
            long_notional: book.long_notional,
            short_notional: book.short_notional,
            net: book.net(),
            gross: book.gross(),
        }
    }

    /// Current exposure across all symbols seen so far.
    pub fn snapshot_all(&self) -> Vec<ExposureSnapshot> {
        let symbols: Vec<String> = self.books.read().keys().cloned().collect();
        let mut out: Vec<ExposureSnapshot> = symbols.iter().map(|s| self.snapshot(s)).collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

impl std::fmt::Debug for ExposureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureTracker")
            .field("symbols", &self.books.read().len())
            .field("default_limit", &self.default_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ExposureTracker {
        let (tx, _rx) = broadcast::channel(16);
        ExposureTracker::new(ExposureLimit::default(), tx)
    }

    #[test]
    fn client_fills_grow_the_matching_leg() {
        let t = tracker();
        t.apply_fill("EURUSD", Side::Buy, 2.0, 1.1, FillSource::Client)
            .unwrap();
        t.apply_fill("EURUSD", Side::Sell, 0.5, 1.1, FillSource::Client)
            .unwrap();

        let snap = t.snapshot("EURUSD");
        assert!((snap.long_notional - 2.0).abs() < 1e-12);
        assert!((snap.short_notional - 0.5).abs() < 1e-12);
        assert!((snap.net - 1.5).abs() < 1e-12);
        assert!((snap.gross - 2.5).abs() < 1e-12);
    }

    #[test]
    fn hedge_reduces_net_toward_zero() {
        let t = tracker();
        t.apply_fill("EURUSD", Side::Buy, 3.0, 1.1, FillSource::Client)
            .unwrap();
        t.apply_fill("EURUSD", Side::Buy, 1.0, 1.1, FillSource::Hedge)
            .unwrap();

        let snap = t.snapshot("EURUSD");
        assert!((snap.long_notional - 2.0).abs() < 1e-12);
        assert!((snap.net - 2.0).abs() < 1e-12);
    }

    #[test]
    fn hedge_overflow_flips_to_opposite_leg() {
        let t = tracker();
        t.apply_fill("EURUSD", Side::Buy, 1.0, 1.1, FillSource::Client)
            .unwrap();
        // Hedge larger than the long leg: net must still drop by exactly 2.5.
        t.apply_fill("EURUSD", Side::Buy, 2.5, 1.1, FillSource::Hedge)
            .unwrap();

        let snap = t.snapshot("EURUSD");
        assert!(snap.long_notional >= 0.0);
        assert!(snap.short_notional >= 0.0);
        assert!((snap.net - (1.0 - 2.5)).abs() < 1e-12);
    }

    #[test]
    fn projection_does_not_mutate() {
        let t = tracker();
        t.apply_fill("XAUUSD", Side::Buy, 250.0, 2_000.0, FillSource::Client)
            .unwrap();

        let (net, gross) = t.projection("XAUUSD", Side::Buy, 15.0);
        assert!((net - 265.0).abs() < 1e-9);
        assert!((gross - 265.0).abs() < 1e-9);

        let snap = t.snapshot("XAUUSD");
        assert!((snap.net - 250.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_volume_rejected() {
        let t = tracker();
        assert!(t
            .apply_fill("EURUSD", Side::Buy, 0.0, 1.1, FillSource::Client)
            .is_err());
        assert!(t
            .apply_fill("EURUSD", Side::Buy, -1.0, 1.1, FillSource::Client)
            .is_err());
        assert!(t
            .apply_fill("EURUSD", Side::Buy, f64::NAN, 1.1, FillSource::Client)
            .is_err());
    }

    #[test]
    fn limit_defaults_and_overrides() {
        let t = tracker();
        let d = t.limit("EURUSD");
        assert!((d.max_net - 500.0).abs() < f64::EPSILON);

        t.set_limit(
            "EURUSD",
            ExposureLimit {
                max_net: 100.0,
                max_gross: 200.0,
                auto_hedge_level: 50.0,
            },
        )
        .unwrap();
        assert!((t.limit("EURUSD").max_net - 100.0).abs() < f64::EPSILON);
        // Other symbols keep the default.
        assert!((t.limit("GBPUSD").max_net - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_limit_rejected() {
        let t = tracker();
        assert!(t
            .set_limit(
                "EURUSD",
                ExposureLimit {
                    max_net: 100.0,
                    max_gross: 50.0,
                    auto_hedge_level: 10.0,
                },
            )
            .is_err());
        assert!(t
            .set_limit(
                "EURUSD",
                ExposureLimit {
                    max_net: 100.0,
                    max_gross: 200.0,
                    auto_hedge_level: 150.0,
                },
            )
            .is_err());
    }

    #[test]
    fn breach_emits_alert() {
        let (tx, mut rx) = broadcast::channel(16);
        let t = ExposureTracker::new(
            ExposureLimit {
                max_net: 10.0,
                max_gross: 20.0,
                auto_hedge_level: 5.0,
            },
            tx,
        );

        t.apply_fill("EURUSD", Side::Buy, 11.0, 1.1, FillSource::Client)
            .unwrap();

        match rx.try_recv() {
            Ok(EngineAlert::ExposureBreach { symbol, net, max_net }) => {
                assert_eq!(symbol, "EURUSD");
                assert!((net - 11.0).abs() < 1e-12);
                assert!((max_net - 10.0).abs() < 1e-12);
            }
            other => panic!("expected ExposureBreach alert, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_fills_sum_exactly() {
        use std::sync::Arc;

        let t = Arc::new(tracker());
        let threads = 4;
        let ops_per_thread = 25_000u64;

        let mut handles = Vec::new();
        for i in 0..threads {
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || {
                for n in 0..ops_per_thread {
                    // Alternate sides deterministically per thread.
                    let side = if (i + n as usize) % 2 == 0 {
                        Side::Buy
                    } else {
                        Side::Sell
                    };
                    t.apply_fill("EURUSD", side, 1.0, 1.1, FillSource::Client)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let snap = t.snapshot("EURUSD");
        let total = threads as f64 * ops_per_thread as f64;
        // Sides alternate evenly: half long, half short.
        assert!((snap.long_notional - total / 2.0).abs() < 1e-6);
        assert!((snap.short_notional - total / 2.0).abs() < 1e-6);
        assert!((snap.gross - total).abs() < 1e-6);
        assert!(snap.net.abs() < 1e-6);
    }
}
