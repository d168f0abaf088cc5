// =============================================================================
// Volatility Tracker — short-window realized volatility per symbol
// =============================================================================
//
// Fed a mid price on every accepted quote.  Realized volatility over the
// window is the square root of the sum of squared log-returns between
// consecutive samples, which the routing pipeline compares against its
// volatility threshold.  Samples older than the window are pruned on every
// write.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Sample {
    mid: f64,
    at: Instant,
}

pub struct VolatilityTracker {
    window: Duration,
    series: RwLock<HashMap<String, VecDeque<Sample>>>,
}

impl VolatilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Record a mid price observation for `symbol`.
    pub fn record_mid(&self, symbol: &str, mid: f64) {
        if mid <= 0.0 || !mid.is_finite() {
            return;
        }
        let now = Instant::now();
        let mut series = self.series.write();
        let samples = series.entry(symbol.to_string()).or_default();
        samples.push_back(Sample { mid, at: now });
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
        trace!(symbol, mid, samples = samples.len(), "mid recorded");
    }

    /// Realized volatility of `symbol` over the window, as a fraction.
    /// Returns 0.0 with fewer than two in-window samples.
    pub fn realized_vol(&self, symbol: &str) -> f64 {
        let now = Instant::now();
        let series = self.series.read();
        let Some(samples) = series.get(symbol) else {
            return 0.0;
        };

        let mut prev: Option<f64> = None;
        let mut sum_sq = 0.0;
        for s in samples {
            if now.duration_since(s.at) > self.window {
                continue;
            }
            if let Some(p) = prev {
                let r = (s.mid / p).ln();
                sum_sq += r * r;
            }
            prev = Some(s.mid);
        }
        sum_sq.sqrt()
    }

    /// Symbols with at least one sample (dashboard snapshot).
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.series.read().keys().cloned().collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for VolatilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatilityTracker")
            .field("window", &self.window)
            .field("symbols", &self.series.read().len())
            .finish()
    }
}
