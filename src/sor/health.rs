// =============================================================================
// LP Health — rolling execution quality, score, connection state machine
// =============================================================================
//
// Per-LP state machine:
//   Connected  -> Degraded      when the rolling score crosses below the
//                               unhealthy threshold (default 0.5).
//   Degraded   -> Connected     when the score recovers above the recovery
//                               threshold (default 0.6, hysteresis).
//   any        -> Disconnected  when the probe sees no transport or no
//                               heartbeat.
//   Disconnected -> Connected   on the first valid quote after reconnect.
//
// Score = w1·fill_rate + w2·(1 − slippage_norm) + w3·(1 − latency_norm)
//       + w4·(1 − reject_rate), clamped to [0, 1].  Slippage and latency
// are min-max normalised over a rolling window of executions.  A
// disconnected LP always scores 0.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::HealthWeights;
use crate::lp::LpManager;

/// Rolling window of executions feeding the score.
const EXECUTION_WINDOW: usize = 1_000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connected,
    Degraded,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// One execution's contribution to an LP's health.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub filled: bool,
    pub rejected: bool,
    /// Absolute difference between the indicative and fill price.
    pub slippage: Option<f64>,
    pub latency_ms: Option<f64>,
}

impl ExecOutcome {
    pub fn fill(slippage: f64, latency_ms: f64) -> Self {
        Self {
            filled: true,
            rejected: false,
            slippage: Some(slippage),
            latency_ms: Some(latency_ms),
        }
    }

    pub fn reject(latency_ms: f64) -> Self {
        Self {
            filled: false,
            rejected: true,
            slippage: None,
            latency_ms: Some(latency_ms),
        }
    }

    /// A deadline miss: reduces fill rate without counting as a reject.
    pub fn timeout() -> Self {
        Self {
            filled: false,
            rejected: false,
            slippage: None,
            latency_ms: None,
        }
    }
}

/// Serialisable health row for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct LpHealthSnapshot {
    pub lp_id: String,
    pub state: ConnectionState,
    pub fill_rate: f64,
    pub avg_slippage: f64,
    pub avg_latency_ms: f64,
    pub reject_rate: f64,
    pub score: f64,
    pub last_quote_age_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Internal per-LP state
// ---------------------------------------------------------------------------

struct HealthInner {
    state: ConnectionState,
    outcomes: VecDeque<ExecOutcome>,
    last_quote: Option<Instant>,
}

impl HealthInner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            outcomes: VecDeque::new(),
            last_quote: None,
        }
    }

    fn fill_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let filled = self.outcomes.iter().filter(|o| o.filled).count();
        filled as f64 / self.outcomes.len() as f64
    }

    fn reject_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let rejected = self.outcomes.iter().filter(|o| o.rejected).count();
        rejected as f64 / self.outcomes.len() as f64
    }

    /// Min-max normalised mean of a sample series, in [0, 1]. A constant
    /// series normalises to 0 (no spread means no penalty).
    fn normalised_mean(samples: impl Iterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let (mut sum, mut min, mut max) = (0.0f64, f64::INFINITY, f64::NEG_INFINITY);
        for v in samples {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 || (max - min) < 1e-12 {
            return 0.0;
        }
        (((sum / count as f64) - min) / (max - min)).clamp(0.0, 1.0)
    }

    fn avg(samples: impl Iterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let mut sum = 0.0;
        for v in samples {
            count += 1;
            sum += v;
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn score(&self, weights: &HealthWeights) -> f64 {
        if self.state == ConnectionState::Disconnected {
            return 0.0;
        }
        let slippage_norm =
            Self::normalised_mean(self.outcomes.iter().filter_map(|o| o.slippage));
        let latency_norm =
            Self::normalised_mean(self.outcomes.iter().filter_map(|o| o.latency_ms));

        let score = weights.fill_rate * self.fill_rate()
            + weights.slippage * (1.0 - slippage_norm)
            + weights.latency * (1.0 - latency_norm)
            + weights.reject_rate * (1.0 - self.reject_rate());
        score.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct HealthTracker {
    lps: RwLock<HashMap<String, Arc<Mutex<HealthInner>>>>,
    weights: HealthWeights,
    unhealthy_below: f64,
    recovery_above: f64,
}

impl HealthTracker {
    pub fn new(weights: HealthWeights, unhealthy_below: f64, recovery_above: f64) -> Self {
        Self {
            lps: RwLock::new(HashMap::new()),
            weights,
            unhealthy_below,
            recovery_above,
        }
    }

    fn slot(&self, lp_id: &str) -> Arc<Mutex<HealthInner>> {
        if let Some(slot) = self.lps.read().get(lp_id) {
            return Arc::clone(slot);
        }
        let mut lps = self.lps.write();
        Arc::clone(
            lps.entry(lp_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HealthInner::new()))),
        )
    }

    /// Note a valid quote. The first quote after a disconnect restores the
    /// LP to Connected.
    pub fn record_quote(&self, lp_id: &str) {
        let slot = self.slot(lp_id);
        let mut inner = slot.lock();
        inner.last_quote = Some(Instant::now());
        if inner.state == ConnectionState::Disconnected {
            inner.state = ConnectionState::Connected;
            info!(lp = lp_id, "LP reconnected (first quote)");
        }
    }

    /// Note an execution result and run the Connected/Degraded transitions.
    pub fn record_execution(&self, lp_id: &str, outcome: ExecOutcome) {
        let slot = self.slot(lp_id);
        let mut inner = slot.lock();
        inner.outcomes.push_back(outcome);
        while inner.outcomes.len() > EXECUTION_WINDOW {
            inner.outcomes.pop_front();
        }

        let score = inner.score(&self.weights);
        match inner.state {
            ConnectionState::Connected if score < self.unhealthy_below => {
                inner.state = ConnectionState::Degraded;
                warn!(lp = lp_id, score, "LP degraded");
            }
            ConnectionState::Degraded if score >= self.recovery_above => {
                inner.state = ConnectionState::Connected;
                info!(lp = lp_id, score, "LP recovered");
            }
            _ => {}
        }
    }

    /// Force an LP into Disconnected (transport closed).
    pub fn mark_disconnected(&self, lp_id: &str) {
        let slot = self.slot(lp_id);
        let mut inner = slot.lock();
        if inner.state != ConnectionState::Disconnected {
            inner.state = ConnectionState::Disconnected;
            warn!(lp = lp_id, "LP disconnected");
        }
    }

    /// Periodic connectivity check: transport down or heartbeat silence
    /// moves the LP to Disconnected.
    pub fn probe(&self, lp_id: &str, transport_connected: bool, heartbeat_timeout: Duration) {
        let slot = self.slot(lp_id);
        let mut inner = slot.lock();
        let heartbeat_ok = inner
            .last_quote
            .map(|t| t.elapsed() <= heartbeat_timeout)
            .unwrap_or(false);
        if !(transport_connected && heartbeat_ok) && inner.state != ConnectionState::Disconnected {
            inner.state = ConnectionState::Disconnected;
            warn!(
                lp = lp_id,
                transport_connected, heartbeat_ok, "probe marked LP disconnected"
            );
        }
    }

    pub fn state(&self, lp_id: &str) -> ConnectionState {
        self.lps
            .read()
            .get(lp_id)
            .map(|s| s.lock().state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn score(&self, lp_id: &str) -> f64 {
        self.lps
            .read()
            .get(lp_id)
            .map(|s| s.lock().score(&self.weights))
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self, lp_id: &str) -> LpHealthSnapshot {
        let slot = self.slot(lp_id);
        let inner = slot.lock();
        LpHealthSnapshot {
            lp_id: lp_id.to_string(),
            state: inner.state,
            fill_rate: inner.fill_rate(),
            avg_slippage: HealthInner::avg(inner.outcomes.iter().filter_map(|o| o.slippage)),
            avg_latency_ms: HealthInner::avg(inner.outcomes.iter().filter_map(|o| o.latency_ms)),
            reject_rate: inner.reject_rate(),
            score: inner.score(&self.weights),
            last_quote_age_ms: inner.last_quote.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    pub fn snapshots(&self) -> Vec<LpHealthSnapshot> {
        let mut ids: Vec<String> = self.lps.read().keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }
}

// ---------------------------------------------------------------------------
// Probe task
// ---------------------------------------------------------------------------

/// Periodically probe every configured LP's transport and heartbeat. Runs
/// until the task is aborted; spawned once at engine startup.
pub async fn run_health_probe(
    lp_manager: Arc<LpManager>,
    health: Arc<HealthTracker>,
    probe_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let mut ticker = interval(probe_interval);
    loop {
        ticker.tick().await;
        for lp_id in lp_manager.lp_ids() {
            let transport_connected = lp_manager
                .adapter(&lp_id)
                .map(|a| a.is_connected())
                .unwrap_or(false);
            health.probe(&lp_id, transport_connected, heartbeat_timeout);
        }
        debug!("LP health probe pass complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthWeights::default(), 0.5, 0.6)
    }

    #[test]
    fn unknown_lp_is_disconnected_with_zero_score() {
        let t = tracker();
        assert_eq!(t.state("lp1"), ConnectionState::Disconnected);
        assert!(t.score("lp1") < f64::EPSILON);
    }

    #[test]
    fn first_quote_connects() {
        let t = tracker();
        t.record_quote("lp1");
        assert_eq!(t.state("lp1"), ConnectionState::Connected);
        // Fresh LP with no executions scores 1.0.
        assert!((t.score("lp1") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn perfect_fills_score_one() {
        let t = tracker();
        t.record_quote("lp1");
        for _ in 0..10 {
            t.record_execution("lp1", ExecOutcome::fill(0.0, 20.0));
        }
        assert!((t.score("lp1") - 1.0).abs() < 1e-9);
        assert_eq!(t.state("lp1"), ConnectionState::Connected);
    }

    #[test]
    fn rejects_with_latency_spread_degrade() {
        let t = tracker();
        t.record_quote("lp1");
        // All rejects, latency spread 100..200: fill_rate 0, reject 1,
        // latency_norm 0.5 -> score = 0.3 + 0.2*0.5 = 0.4 < 0.5.
        t.record_execution("lp1", ExecOutcome::reject(100.0));
        t.record_execution("lp1", ExecOutcome::reject(200.0));
        let score = t.score("lp1");
        assert!(score < 0.5, "score {score}");
        assert_eq!(t.state("lp1"), ConnectionState::Degraded);
    }

    #[test]
    fn recovery_needs_hysteresis_margin() {
        let t = tracker();
        t.record_quote("lp1");
        t.record_execution("lp1", ExecOutcome::reject(100.0));
        t.record_execution("lp1", ExecOutcome::reject(200.0));
        assert_eq!(t.state("lp1"), ConnectionState::Degraded);

        // Pile on good fills until the score clears 0.6.
        for _ in 0..8 {
            t.record_execution("lp1", ExecOutcome::fill(0.0, 150.0));
        }
        assert!(t.score("lp1") >= 0.6);
        assert_eq!(t.state("lp1"), ConnectionState::Connected);
    }

    #[test]
    fn timeouts_reduce_fill_rate_not_rejects() {
        let t = tracker();
        t.record_quote("lp1");
        t.record_execution("lp1", ExecOutcome::fill(0.0, 20.0));
        t.record_execution("lp1", ExecOutcome::timeout());

        let snap = t.snapshot("lp1");
        assert!((snap.fill_rate - 0.5).abs() < 1e-12);
        assert!(snap.reject_rate < f64::EPSILON);
    }

    #[test]
    fn probe_disconnects_on_transport_loss() {
        let t = tracker();
        t.record_quote("lp1");
        assert_eq!(t.state("lp1"), ConnectionState::Connected);

        t.probe("lp1", false, Duration::from_secs(10));
        assert_eq!(t.state("lp1"), ConnectionState::Disconnected);
        assert!(t.score("lp1") < f64::EPSILON);

        // Reconnect: first valid quote restores Connected.
        t.record_quote("lp1");
        assert_eq!(t.state("lp1"), ConnectionState::Connected);
    }

    #[test]
    fn probe_disconnects_on_heartbeat_silence() {
        let t = tracker();
        t.record_quote("lp1");
        // Heartbeat window of zero: the last quote is already too old.
        t.probe("lp1", true, Duration::from_millis(0));
        assert_eq!(t.state("lp1"), ConnectionState::Disconnected);
    }

    #[test]
    fn window_is_bounded() {
        let t = tracker();
        t.record_quote("lp1");
        for _ in 0..(EXECUTION_WINDOW + 100) {
            t.record_execution("lp1", ExecOutcome::fill(0.0, 20.0));
        }
        let slot = t.slot("lp1");
        assert_eq!(slot.lock().outcomes.len(), EXECUTION_WINDOW);
    }
}
