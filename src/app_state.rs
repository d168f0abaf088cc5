// =============================================================================
// Central Engine State — Meridian Routing Engine
// =============================================================================
//
// The single wiring point for the engine. All subsystems own their internal
// state; EngineState ties them together, tracks a monotone version counter,
// and builds the unified snapshot served to dashboards and embedding hosts.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the error ring.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::exposure::{ExposureSnapshot, ExposureTracker};
use crate::internal::InternalDesk;
use crate::lp::{LpManager, LpStatusSnapshot};
use crate::profiler::{ClientProfile, ClientProfiler};
use crate::repository::Repository;
use crate::router::{RouterStatsSnapshot, RoutingDecision, RoutingEngine};
use crate::sor::{LpHealthSnapshot, SmartOrderRouter};
use crate::types::{EngineAlert, TradeEvent};
use crate::volatility::VolatilityTracker;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Decisions included in the snapshot tail.
const SNAPSHOT_DECISIONS: usize = 100;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// EngineState
// =============================================================================

/// Engine-wide state shared across tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub state_version: AtomicU64,
    pub config: Arc<RwLock<EngineConfig>>,
    pub profiler: Arc<ClientProfiler>,
    pub exposure: Arc<ExposureTracker>,
    pub volatility: Arc<VolatilityTracker>,
    pub lp_manager: Arc<LpManager>,
    pub sor: Arc<SmartOrderRouter>,
    pub router: Arc<RoutingEngine>,
    pub alerts: broadcast::Sender<EngineAlert>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Wire every subsystem from config and persisted admin state.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        desk: Arc<dyn InternalDesk>,
    ) -> Result<Arc<Self>> {
        let (alerts, _) = broadcast::channel(256);
        let config = Arc::new(RwLock::new(config));

        let (profiler, exposure, volatility, lp_manager, sor) = {
            let cfg = config.read();

            let profiler = Arc::new(ClientProfiler::new(
                cfg.profiler_min_trades,
                cfg.profiler_window_trades,
                cfg.sharpe_annualization,
            ));
            let exposure = Arc::new(ExposureTracker::new(
                cfg.default_exposure_limit,
                alerts.clone(),
            ));
            let volatility = Arc::new(VolatilityTracker::new(Duration::from_secs(
                cfg.volatility_window_secs,
            )));
            let lp_manager = Arc::new(LpManager::new(cfg.symbols.clone()));
            let sor = Arc::new(SmartOrderRouter::new(
                &cfg,
                Arc::clone(&lp_manager),
                Arc::clone(&volatility),
            ));
            (profiler, exposure, volatility, lp_manager, sor)
        };

        lp_manager.set_reconnect_timeout(Duration::from_millis(
            config.read().reconnect_timeout_ms,
        ));
        lp_manager.set_repository(Arc::clone(&repository));
        {
            let sor = Arc::clone(&sor);
            lp_manager.set_quote_sink(Arc::new(move |quote| sor.ingest_quote(quote)));
        }
        for lp_config in repository
            .load_lp_configs()
            .context("failed to load LP configs")?
        {
            lp_manager
                .add_lp(lp_config)
                .context("failed to restore LP config")?;
        }

        let router = Arc::new(RoutingEngine::new(
            Arc::clone(&config),
            Arc::clone(&profiler),
            Arc::clone(&exposure),
            Arc::clone(&volatility),
            Arc::clone(&sor),
            desk,
            repository,
        )?);

        Ok(Arc::new(Self {
            state_version: AtomicU64::new(1),
            config,
            profiler,
            exposure,
            volatility,
            lp_manager,
            sor,
            router,
            alerts,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }))
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Replace the runtime configuration atomically. Readers pick up the
    /// new values on their next access; no restart required.
    pub fn reload_config(&self, new: EngineConfig) -> Result<()> {
        new.health_weights.validate()?;
        new.default_exposure_limit.validate()?;
        *self.config.write() = new;
        self.increment_version();
        info!("engine config hot-reloaded");
        Ok(())
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the engine.
    pub fn build_snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            stats: self.router.stats(),
            recent_decisions: self.router.history(SNAPSHOT_DECISIONS),
            exposure: self.exposure.snapshot_all(),
            lps: self.lp_manager.status(),
            lp_health: self.sor.health().snapshots(),
            profiles: self.profiler.profiles(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Full engine snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub stats: RouterStatsSnapshot,
    pub recent_decisions: Vec<RoutingDecision>,
    pub exposure: Vec<ExposureSnapshot>,
    pub lps: Vec<LpStatusSnapshot>,
    pub lp_health: Vec<LpHealthSnapshot>,
    pub profiles: Vec<ClientProfile>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Long-lived ingest tasks
// =============================================================================

/// Consume the fill collaborator's trade events into the profiler. Runs
/// until the sending side closes.
pub async fn run_fill_ingest(state: Arc<EngineState>, mut events: mpsc::Receiver<TradeEvent>) {
    info!("fill ingest started");
    while let Some(event) = events.recv().await {
        state.profiler.record_trade(event);
        state.increment_version();
    }
    warn!("fill ingest stream closed");
}

/// Mirror engine alerts into the error ring so dashboards surface them.
pub async fn run_alert_monitor(state: Arc<EngineState>) {
    let mut rx = state.alerts.subscribe();
    loop {
        match rx.recv().await {
            Ok(EngineAlert::ExposureBreach {
                symbol,
                net,
                max_net,
            }) => {
                state.push_error_with_code(
                    format!("net exposure breach on {symbol}: {net:.2} (limit {max_net:.2})"),
                    Some("exposure-breach".into()),
                );
            }
            Ok(EngineAlert::HedgeAbandoned {
                order_id,
                symbol,
                volume,
            }) => {
                state.push_error_with_code(
                    format!("hedge abandoned for order {order_id}: {volume} {symbol}"),
                    Some("hedge-abandoned".into()),
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                error!(missed, "alert monitor lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::ChannelDesk;
    use crate::repository::MemoryRepository;
    use crate::types::{Order, OrderKind, Side};

    fn state() -> (Arc<EngineState>, mpsc::Receiver<crate::internal::BBookTicket>) {
        let (desk, rx) = ChannelDesk::new(64);
        let state = EngineState::new(
            EngineConfig::default(),
            Arc::new(MemoryRepository::default()),
            desk,
        )
        .unwrap();
        (state, rx)
    }

    #[tokio::test]
    async fn snapshot_reflects_decisions() {
        let (s, _rx) = state();
        s.router.decide(&Order {
            id: "o1".into(),
            account_id: "A1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.1,
            price: None,
            kind: OrderKind::Market,
        });

        let snap = s.build_snapshot();
        assert_eq!(snap.stats.decisions_total, 1);
        assert_eq!(snap.recent_decisions.len(), 1);
        assert_eq!(snap.recent_decisions[0].order_id, "o1");
        assert_eq!(snap.exposure.len(), 1);
        assert_eq!(snap.exposure[0].symbol, "EURUSD");
    }

    #[tokio::test]
    async fn error_ring_is_bounded() {
        let (s, _rx) = state();
        for n in 0..(MAX_RECENT_ERRORS + 10) {
            s.push_error(format!("error {n}"));
        }
        let errors = s.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "error 59");
    }

    #[tokio::test]
    async fn version_increments_on_error() {
        let (s, _rx) = state();
        let v0 = s.current_state_version();
        s.push_error("boom".into());
        assert!(s.current_state_version() > v0);
    }

    #[tokio::test]
    async fn snapshot_serialises() {
        let (s, _rx) = state();
        let snap = s.build_snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("state_version"));
        assert!(json.contains("decisions_total"));
    }

    #[tokio::test]
    async fn config_hot_reload_swaps_atomically() {
        let (s, _rx) = state();
        let mut new = EngineConfig::default();
        new.large_volume_threshold = 99.0;
        s.reload_config(new).unwrap();
        assert!((s.config.read().large_volume_threshold - 99.0).abs() < f64::EPSILON);

        // Invalid weights are refused and the old config stays.
        let mut bad = EngineConfig::default();
        bad.health_weights.fill_rate = 0.9;
        assert!(s.reload_config(bad).is_err());
        assert!((s.config.read().large_volume_threshold - 99.0).abs() < f64::EPSILON);
    }
}
