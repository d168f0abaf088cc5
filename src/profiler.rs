// =============================================================================
// Client Profiler — per-account metrics, toxicity score, classification
// =============================================================================
//
// Ingests completed round-trip trades and order-lifecycle outcomes, keeps a
// rolling window per account, and recomputes the account's metrics and
// classification on every event.  Routing reads the cached profile through
// a short read lock; a decision may observe a profile that is one trade
// stale, which is acceptable.
//
// Bootstrap floor: below `min_trades` closed trades the account is always
// Retail with toxicity 0, whatever the raw metrics say.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Classification, TradeEvent};

// ---------------------------------------------------------------------------
// Profile snapshot
// ---------------------------------------------------------------------------

/// Per-account profile as seen by the routing engine and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub account_id: String,
    pub classification: Classification,
    /// 0–100. Higher means more costly for the B-Book.
    pub toxicity_score: f64,
    pub win_rate: f64,
    pub sharpe: f64,
    pub avg_hold_time_secs: f64,
    pub cancel_rate: f64,
    pub instrument_concentration: f64,
    pub sample_size: usize,
}

impl ClientProfile {
    /// The profile assumed for accounts with no history.
    pub fn bootstrap(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            classification: Classification::Retail,
            toxicity_score: 0.0,
            win_rate: 0.0,
            sharpe: 0.0,
            avg_hold_time_secs: 0.0,
            cancel_rate: 0.0,
            instrument_concentration: 0.0,
            sample_size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal per-account state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AccountState {
    /// Most recent closed trades, oldest first. Capped at the window size.
    trades: VecDeque<TradeEvent>,
    /// Outcomes of recent order submissions: `true` = cancelled. Capped at
    /// the window size.
    order_outcomes: VecDeque<bool>,
    profile: Option<Arc<ClientProfile>>,
}

// ---------------------------------------------------------------------------
// Profiler
// ---------------------------------------------------------------------------

pub struct ClientProfiler {
    accounts: RwLock<HashMap<String, AccountState>>,
    /// Closed trades below this count force Retail/0.
    min_trades: usize,
    /// Rolling window of closed trades per account.
    window_trades: usize,
    /// Sharpe annualization used when fewer than 5 days are observed.
    fallback_annualization: f64,
    /// Malformed events dropped.
    dropped_events: AtomicU64,
}

/// Observation span below which the fallback annualization applies.
const MIN_OBSERVED_DAYS: f64 = 5.0;

impl ClientProfiler {
    pub fn new(min_trades: usize, window_trades: usize, fallback_annualization: f64) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            min_trades,
            window_trades,
            fallback_annualization,
            dropped_events: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Record a completed trade and recompute the account's profile.
    ///
    /// Malformed events are dropped with a counter; classification is always
    /// defined afterwards.
    pub fn record_trade(&self, event: TradeEvent) {
        if !event.is_well_formed() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!(account = %event.account_id, symbol = %event.symbol, "malformed trade event dropped");
            return;
        }

        let account_id = event.account_id.clone();
        let mut accounts = self.accounts.write();
        let state = accounts.entry(account_id.clone()).or_default();

        state.trades.push_back(event);
        while state.trades.len() > self.window_trades {
            state.trades.pop_front();
        }

        let profile = self.compute(state, &account_id);
        state.profile = Some(Arc::new(profile));
    }

    /// Record the terminal outcome of an order submission (`cancelled` =
    /// the order was cancelled before executing). Feeds cancel_rate.
    pub fn record_order_outcome(&self, account_id: &str, cancelled: bool) {
        let mut accounts = self.accounts.write();
        let state = accounts.entry(account_id.to_string()).or_default();

        state.order_outcomes.push_back(cancelled);
        while state.order_outcomes.len() > self.window_trades {
            state.order_outcomes.pop_front();
        }

        let profile = self.compute(state, account_id);
        state.profile = Some(Arc::new(profile));
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Cached profile for an account, if any trades have been seen.
    pub fn profile(&self, account_id: &str) -> Option<Arc<ClientProfile>> {
        self.accounts
            .read()
            .get(account_id)
            .and_then(|s| s.profile.clone())
    }

    /// All cached profiles (dashboard snapshot).
    pub fn profiles(&self) -> Vec<ClientProfile> {
        let mut out: Vec<ClientProfile> = self
            .accounts
            .read()
            .values()
            .filter_map(|s| s.profile.as_deref().cloned())
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }

    /// Number of malformed events dropped so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Metric computation
    // -------------------------------------------------------------------------

    fn compute(&self, state: &AccountState, account_id: &str) -> ClientProfile {
        let trades = &state.trades;
        let n = trades.len();

        let cancel_rate = if state.order_outcomes.is_empty() {
            0.0
        } else {
            let cancelled = state.order_outcomes.iter().filter(|c| **c).count();
            cancelled as f64 / state.order_outcomes.len() as f64
        };

        if n == 0 {
            let mut p = ClientProfile::bootstrap(account_id);
            p.cancel_rate = cancel_rate;
            return p;
        }

        let winners = trades.iter().filter(|t| t.pnl > 0.0).count();
        let win_rate = winners as f64 / n as f64;

        let sharpe = self.sharpe(trades);

        let avg_hold_time_secs = trades
            .iter()
            .map(|t| (t.close_ts - t.open_ts) as f64 / 1_000.0)
            .sum::<f64>()
            / n as f64;

        let instrument_concentration = {
            let mut by_symbol: HashMap<&str, f64> = HashMap::new();
            let mut total = 0.0;
            for t in trades {
                *by_symbol.entry(t.symbol.as_str()).or_default() += t.volume;
                total += t.volume;
            }
            if total > 0.0 {
                by_symbol.values().fold(0.0f64, |m, v| m.max(*v)) / total
            } else {
                0.0
            }
        };

        let (toxicity_score, classification) = if n < self.min_trades {
            (0.0, Classification::Retail)
        } else {
            let mut score: f64 = 0.0;
            if win_rate > 0.55 {
                score += 30.0;
            }
            if sharpe > 2.0 {
                score += 25.0;
            }
            if avg_hold_time_secs < 60.0 {
                score += 20.0;
            }
            if cancel_rate > 0.50 {
                score += 15.0;
            }
            if instrument_concentration > 0.80 {
                score += 10.0;
            }
            let score = score.clamp(0.0, 100.0);

            let classification = if score >= 70.0 {
                Classification::Toxic
            } else if win_rate > 0.52 {
                Classification::Professional
            } else if win_rate >= 0.48 {
                Classification::SemiPro
            } else {
                Classification::Retail
            };
            (score, classification)
        };

        debug!(
            account = account_id,
            classification = %classification,
            toxicity = toxicity_score,
            win_rate,
            sharpe,
            sample_size = n,
            "profile recomputed"
        );

        ClientProfile {
            account_id: account_id.to_string(),
            classification,
            toxicity_score,
            win_rate,
            sharpe,
            avg_hold_time_secs,
            cancel_rate,
            instrument_concentration,
            sample_size: n,
        }
    }

    /// Annualized Sharpe over the window: mean(pnl) / stdev(pnl) · √A.
    ///
    /// A is the trades-per-year estimate from event timestamps when at
    /// least [`MIN_OBSERVED_DAYS`] of history is visible, otherwise the
    /// configured fallback (252 by default).
    fn sharpe(&self, trades: &VecDeque<TradeEvent>) -> f64 {
        let n = trades.len();
        if n < 2 {
            return 0.0;
        }

        let mean = trades.iter().map(|t| t.pnl).sum::<f64>() / n as f64;
        let var = trades
            .iter()
            .map(|t| {
                let d = t.pnl - mean;
                d * d
            })
            .sum::<f64>()
            / (n as f64 - 1.0);
        let stdev = var.sqrt();
        if stdev < 1e-12 {
            return 0.0;
        }

        let first_close = trades.front().map(|t| t.close_ts).unwrap_or(0);
        let last_close = trades.back().map(|t| t.close_ts).unwrap_or(0);
        let observed_days = (last_close - first_close) as f64 / 86_400_000.0;

        let annualization = if observed_days < MIN_OBSERVED_DAYS {
            self.fallback_annualization
        } else {
            n as f64 * 365.0 / observed_days
        };

        (mean / stdev) * annualization.sqrt()
    }
}

impl std::fmt::Debug for ClientProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProfiler")
            .field("accounts", &self.accounts.read().len())
            .field("min_trades", &self.min_trades)
            .field("window_trades", &self.window_trades)
            .finish()
    }
}
