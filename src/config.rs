// =============================================================================
// Engine Configuration — Hot-reloadable routing settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian routing engine.  Every tunable
// parameter of the decision pipeline, SOR, profiler, and exposure tracker
// lives here so that the engine can be reconfigured without a restart:
// hot-reload replaces the whole struct behind the state lock atomically.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exposure::ExposureLimit;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "USDJPY".to_string(),
        "XAUUSD".to_string(),
    ]
}

fn default_large_volume_threshold() -> f64 {
    10.0
}

fn default_volatility_threshold() -> f64 {
    0.02
}

fn default_volatility_window_secs() -> u64 {
    300
}

fn default_quote_staleness_ms() -> u64 {
    5_000
}

fn default_unhealthy_below() -> f64 {
    0.5
}

fn default_recovery_above() -> f64 {
    0.6
}

fn default_pip_tolerance() -> f64 {
    0.0001
}

fn default_history_ring_size() -> usize {
    10_000
}

fn default_hedge_retry_buffer_size() -> usize {
    10_000
}

fn default_hedge_backpressure_watermark() -> usize {
    10_000
}

fn default_profiler_min_trades() -> usize {
    20
}

fn default_profiler_window_trades() -> usize {
    200
}

fn default_sharpe_annualization() -> f64 {
    252.0
}

fn default_send_order_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_timeout_ms() -> u64 {
    2_000
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> Vec<u64> {
    vec![100, 500, 2_000, 5_000]
}

fn default_shutdown_deadline_secs() -> u64 {
    10
}

// =============================================================================
// HealthWeights
// =============================================================================

/// Weights of the four LP health components. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthWeights {
    pub fill_rate: f64,
    pub slippage: f64,
    pub latency: f64,
    pub reject_rate: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            fill_rate: 0.4,
            slippage: 0.3,
            latency: 0.2,
            reject_rate: 0.1,
        }
    }
}

impl HealthWeights {
    /// Check that all weights are non-negative and sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        let parts = [self.fill_rate, self.slippage, self.latency, self.reject_rate];
        if parts.iter().any(|w| *w < 0.0) {
            anyhow::bail!("health weights must be non-negative");
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("health weights must sum to 1.0 (got {sum})");
        }
        Ok(())
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Symbols -------------------------------------------------------------

    /// Symbols the LP adapters subscribe to at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Routing pipeline ----------------------------------------------------

    /// Orders at or above this volume (lots) are forced fully A-Book.
    #[serde(default = "default_large_volume_threshold")]
    pub large_volume_threshold: f64,

    /// Realized volatility (fraction) above which the hedge fraction is
    /// bumped by 30 points.
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,

    /// Window over which realized volatility is computed.
    #[serde(default = "default_volatility_window_secs")]
    pub volatility_window_secs: u64,

    // --- SOR -----------------------------------------------------------------

    /// Quotes older than this never feed LP selection.
    #[serde(default = "default_quote_staleness_ms")]
    pub quote_staleness_ms: u64,

    /// Health score below which an LP is considered degraded.
    #[serde(default = "default_unhealthy_below")]
    pub lp_health_unhealthy_below: f64,

    /// Health score a degraded LP must regain before being trusted again.
    #[serde(default = "default_recovery_above")]
    pub lp_health_recovery_above: f64,

    /// Price window (absolute) within which a healthier LP may replace the
    /// best-priced one during failover.
    #[serde(default = "default_pip_tolerance")]
    pub pip_tolerance: f64,

    /// Component weights of the LP health score.
    #[serde(default)]
    pub health_weights: HealthWeights,

    /// Interval of the LP connection probe.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    // --- Exposure ------------------------------------------------------------

    /// Limits applied to symbols without an explicit override.
    #[serde(default)]
    pub default_exposure_limit: ExposureLimit,

    // --- History / retry -----------------------------------------------------

    /// Capacity of the decision history ring.
    #[serde(default = "default_history_ring_size")]
    pub history_ring_size: usize,

    /// Capacity of the hedge retry buffer (oldest dropped on overflow).
    #[serde(default = "default_hedge_retry_buffer_size")]
    pub hedge_retry_buffer_size: usize,

    /// Pending-retry count above which decisions are tagged
    /// `hedge-backpressure` and the internal desk is notified.
    #[serde(default = "default_hedge_backpressure_watermark")]
    pub hedge_backpressure_watermark: usize,

    /// Backoff schedule for hedge retries, in milliseconds. Exhausting the
    /// schedule abandons the hedge with an alert.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: Vec<u64>,

    // --- Profiler ------------------------------------------------------------

    /// Below this many closed trades an account is always Retail/0.
    #[serde(default = "default_profiler_min_trades")]
    pub profiler_min_trades: usize,

    /// Rolling window of closed trades per account.
    #[serde(default = "default_profiler_window_trades")]
    pub profiler_window_trades: usize,

    /// Annualization factor for the Sharpe ratio when fewer than 5 days of
    /// events have been observed.
    #[serde(default = "default_sharpe_annualization")]
    pub sharpe_annualization: f64,

    // --- Adapter timeouts ----------------------------------------------------

    /// Deadline for a single LP SendOrder.
    #[serde(default = "default_send_order_timeout_ms")]
    pub send_order_timeout_ms: u64,

    /// Deadline for an adapter reconnect attempt.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    // --- Shutdown ------------------------------------------------------------

    /// Global deadline for cooperative shutdown (drain + join).
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            large_volume_threshold: default_large_volume_threshold(),
            volatility_threshold: default_volatility_threshold(),
            volatility_window_secs: default_volatility_window_secs(),
            quote_staleness_ms: default_quote_staleness_ms(),
            lp_health_unhealthy_below: default_unhealthy_below(),
            lp_health_recovery_above: default_recovery_above(),
            pip_tolerance: default_pip_tolerance(),
            health_weights: HealthWeights::default(),
            probe_interval_secs: default_probe_interval_secs(),
            default_exposure_limit: ExposureLimit::default(),
            history_ring_size: default_history_ring_size(),
            hedge_retry_buffer_size: default_hedge_retry_buffer_size(),
            hedge_backpressure_watermark: default_hedge_backpressure_watermark(),
            retry_backoff_ms: default_retry_backoff_ms(),
            profiler_min_trades: default_profiler_min_trades(),
            profiler_window_trades: default_profiler_window_trades(),
            sharpe_annualization: default_sharpe_annualization(),
            send_order_timeout_ms: default_send_order_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.health_weights.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            large_volume_threshold = config.large_volume_threshold,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
