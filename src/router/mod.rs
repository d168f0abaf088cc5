// =============================================================================
// Routing Engine — per-order A/B/C-Book decisions
// =============================================================================
//
// The decision pipeline, in this exact order; the first conclusive outcome
// wins, and later stages may only *raise* the hedged fraction:
//
//   1. Manual rules         (admin overrides, first enabled match)
//   2. Classification       (profiler verdict, only when no rule matched)
//   3. Volume override      (large orders fully hedged)
//   4. Exposure override    (projected net vs auto-hedge level)
//   5. Volatility override  (turbulent symbols hedged harder)
//
// The decision is recorded in the history ring *before* any handoff, so it
// stays observable even when downstream execution fails.  `decide` never
// blocks on I/O and never fails: degradations fold into reason tags.
// =============================================================================

pub mod decision;
pub mod history;
pub mod retry;
pub mod rules;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use self::decision::RoutingDecision;
pub use self::history::DecisionHistory;
pub use self::retry::{HedgeDispatcher, PendingExecution, PendingKind, RetryBuffer};
pub use self::rules::{RoutingRule, RuleStore};

use crate::config::EngineConfig;
use crate::exposure::{ExposureLimit, ExposureSnapshot, ExposureTracker};
use crate::internal::{BBookTicket, InternalDesk};
use crate::profiler::{ClientProfile, ClientProfiler};
use crate::repository::Repository;
use crate::sor::{SelectOutcome, SmartOrderRouter};
use crate::types::{Classification, FillSource, Order, RouteAction};
use crate::volatility::VolatilityTracker;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RouterStats {
    decisions_total: AtomicU64,
    a_book: AtomicU64,
    b_book: AtomicU64,
    partial_hedge: AtomicU64,
    reject: AtomicU64,
    reasons: RwLock<HashMap<String, u64>>,
}

impl RouterStats {
    fn record(&self, decision: &RoutingDecision) {
        self.decisions_total.fetch_add(1, Ordering::Relaxed);
        match decision.action {
            RouteAction::ABook => &self.a_book,
            RouteAction::BBook => &self.b_book,
            RouteAction::PartialHedge => &self.partial_hedge,
            RouteAction::Reject => &self.reject,
        }
        .fetch_add(1, Ordering::Relaxed);

        let mut reasons = self.reasons.write();
        for reason in &decision.reasons {
            *reasons.entry(reason.clone()).or_default() += 1;
        }
    }
}

/// Serialisable stats for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub decisions_total: u64,
    pub a_book: u64,
    pub b_book: u64,
    pub partial_hedge: u64,
    pub reject: u64,
    pub reasons: HashMap<String, u64>,
    pub retry_pending: usize,
    pub retry_dropped: u64,
    pub retry_abandoned: u64,
    pub send_timeouts: u64,
    pub profiler_dropped_events: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RoutingEngine {
    config: Arc<RwLock<EngineConfig>>,
    rules: RuleStore,
    profiler: Arc<ClientProfiler>,
    exposure: Arc<ExposureTracker>,
    volatility: Arc<VolatilityTracker>,
    sor: Arc<SmartOrderRouter>,
    desk: Arc<dyn InternalDesk>,
    repository: Arc<dyn Repository>,
    history: DecisionHistory,
    stats: RouterStats,
    retry: Arc<RetryBuffer>,
    /// Per-account striped locks serialising same-account decisions.
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    backpressure_active: AtomicBool,
}

impl RoutingEngine {
    /// Wire the engine and load persisted rules and limits.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        profiler: Arc<ClientProfiler>,
        exposure: Arc<ExposureTracker>,
        volatility: Arc<VolatilityTracker>,
        sor: Arc<SmartOrderRouter>,
        desk: Arc<dyn InternalDesk>,
        repository: Arc<dyn Repository>,
    ) -> Result<Self> {
        let (history_size, retry_size) = {
            let cfg = config.read();
            (cfg.history_ring_size, cfg.hedge_retry_buffer_size)
        };

        let rules = RuleStore::new();
        rules.load(repository.load_rules().context("failed to load rules")?);

        for (symbol, limit) in repository
            .load_exposure_limits()
            .context("failed to load exposure limits")?
        {
            exposure.set_limit(&symbol, limit)?;
        }

        info!(history_size, retry_size, "routing engine initialised");

        Ok(Self {
            config,
            rules,
            profiler,
            exposure,
            volatility,
            sor,
            desk,
            repository,
            history: DecisionHistory::new(history_size),
            stats: RouterStats::default(),
            retry: Arc::new(RetryBuffer::new(retry_size)),
            account_locks: Mutex::new(HashMap::new()),
            backpressure_active: AtomicBool::new(false),
        })
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock();
        Arc::clone(
            locks
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // -------------------------------------------------------------------------
    // The hot path
    // -------------------------------------------------------------------------

    /// Route one order. Never blocks on I/O, never fails; degradations and
    /// overrides fold into the decision's reason tags.
    pub fn decide(&self, order: &Order) -> RoutingDecision {
        let mut decision = RoutingDecision::draft(order);

        if !order.is_valid() {
            decision.action = RouteAction::Reject;
            decision.push_reason("invalid-order");
            warn!(order = %order.id, "invalid order rejected");
            return self.seal(decision);
        }

        // Same-account orders decide in submission order.
        let account_lock = self.account_lock(&order.account_id);
        let _serialised = account_lock.lock();

        let (large_volume_threshold, volatility_threshold, watermark) = {
            let cfg = self.config.read();
            (
                cfg.large_volume_threshold,
                cfg.volatility_threshold,
                cfg.hedge_backpressure_watermark,
            )
        };

        let profile = self
            .profiler
            .profile(&order.account_id)
            .unwrap_or_else(|| Arc::new(ClientProfile::bootstrap(&order.account_id)));

        // ── 1. Manual rules ─────────────────────────────────────────────
        let mut rule_matched = false;
        for rule in self.rules.snapshot().iter().filter(|r| r.enabled) {
            if !rule.matches(order, &profile) {
                continue;
            }
            decision.push_reason(format!("rule:{}", rule.id));
            if let Some(tag) = &rule.reason_tag {
                decision.push_reason(tag.clone());
            }
            match rule.action {
                RouteAction::Reject => {
                    decision.action = RouteAction::Reject;
                    return self.seal(decision);
                }
                RouteAction::ABook => decision.set_a_book_pct(100.0),
                RouteAction::BBook => decision.set_a_book_pct(0.0),
                RouteAction::PartialHedge => {
                    decision.set_a_book_pct(rule.hedge_percent.unwrap_or(50.0))
                }
            }
            rule_matched = true;
            break;
        }

        // ── 2. Classification default ───────────────────────────────────
        if !rule_matched {
            match profile.classification {
                Classification::Toxic => {
                    if profile.toxicity_score > 80.0 {
                        decision.action = RouteAction::Reject;
                        decision.push_reason("toxic-reject");
                        return self.seal(decision);
                    }
                    decision.set_a_book_pct(100.0);
                    decision.push_reason("classification:toxic-hedge");
                }
                Classification::Professional => {
                    decision.set_a_book_pct(80.0);
                    decision.push_reason("classification:pro");
                }
                Classification::SemiPro => {
                    decision.set_a_book_pct(50.0);
                    decision.push_reason("classification:semipro");
                }
                Classification::Retail => {
                    decision.set_a_book_pct(10.0);
                    decision.push_reason("classification:retail");
                }
            }
        }

        // ── 3. Volume override ──────────────────────────────────────────
        if order.volume >= large_volume_threshold {
            decision.raise_a_book_pct(100.0);
            decision.push_reason("large-volume");
        }

        // ── 4. Exposure override ────────────────────────────────────────
        let (projected_net, _projected_gross) =
            self.exposure
                .projection(&order.symbol, order.side, order.volume);
        let level = self.exposure.limit(&order.symbol).auto_hedge_level;
        if level > 0.0 {
            let magnitude = projected_net.abs();
            if magnitude > level {
                decision.raise_a_book_pct(100.0);
                decision.push_reason("exposure-cap");
            } else if magnitude > 0.7 * level {
                decision.raise_a_book_pct(decision.a_book_pct + 30.0 * (magnitude / level));
                decision.push_reason("exposure-approaching");
            }
        }

        // ── 5. Volatility override ──────────────────────────────────────
        if self.volatility.realized_vol(&order.symbol) > volatility_threshold {
            decision.raise_a_book_pct(decision.a_book_pct + 30.0);
            decision.push_reason("high-vol");
        }

        decision.finalise_action();

        // LP selection for the hedged fraction: read locks only, no I/O.
        if decision.a_book_pct > 0.0 {
            match self
                .sor
                .select(&order.symbol, order.side, decision.a_book_volume())
            {
                SelectOutcome::Selected(sel) => {
                    if sel.degraded {
                        decision.push_reason("degraded");
                    }
                    decision.target_lp = Some(sel.lp_id);
                    decision.session_handle = Some(sel.session_handle);
                    decision.indicative_price = Some(sel.price);
                }
                SelectOutcome::Unavailable => decision.push_reason("sor-unavailable"),
            }
        }

        // Backpressure: tag hedge-bearing decisions and notify the desk on
        // edge transitions.
        let over = self.retry.len() > watermark;
        if over && decision.a_book_pct > 0.0 {
            decision.push_reason("hedge-backpressure");
        }
        if self.backpressure_active.swap(over, Ordering::Relaxed) != over {
            self.desk.notify_backpressure(over);
        }

        let decision = self.seal(decision);
        self.handoff(order, &decision);
        decision
    }

    /// Record the decision (history + stats) before anything downstream can
    /// fail.
    fn seal(&self, decision: RoutingDecision) -> RoutingDecision {
        self.history.push(decision.clone());
        self.stats.record(&decision);
        debug!(
            order = %decision.order_id,
            action = %decision.action,
            a_book_pct = decision.a_book_pct,
            reasons = ?decision.reasons,
            "decision recorded"
        );
        decision
    }

    /// Fire-and-forget dispatch of both portions.
    fn handoff(&self, order: &Order, decision: &RoutingDecision) {
        if decision.action == RouteAction::Reject {
            return;
        }

        // The accepted order is client risk in full; hedge fills walk the
        // net back as they execute.
        let audit_price = decision.indicative_price.or(order.price).unwrap_or(0.0);
        if let Err(e) = self.exposure.apply_fill(
            &order.symbol,
            order.side,
            order.volume,
            audit_price,
            FillSource::Client,
        ) {
            warn!(order = %order.id, error = %e, "client fill not applied to exposure");
        }

        if decision.a_book_volume() > 0.0 {
            self.retry.push(PendingExecution {
                kind: PendingKind::Hedge,
                order_id: order.id.clone(),
                account_id: order.account_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                volume: decision.a_book_volume(),
                price: decision.indicative_price,
                attempt: 0,
                not_before: None,
            });
        }

        if decision.b_book_volume() > 0.0 {
            let accepted = self.desk.try_accept(BBookTicket {
                order_id: order.id.clone(),
                account_id: order.account_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                volume: decision.b_book_volume(),
                price: decision.indicative_price.or(order.price),
            });
            if !accepted {
                self.retry.push(PendingExecution {
                    kind: PendingKind::Internal,
                    order_id: order.id.clone(),
                    account_id: order.account_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    volume: decision.b_book_volume(),
                    price: decision.indicative_price.or(order.price),
                    attempt: 0,
                    not_before: None,
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Admin: rules
    // -------------------------------------------------------------------------

    /// Create or replace a rule. Writes through the repository before the
    /// in-memory swap is published.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        rule.validate()?;
        self.repository
            .save_rule(&rule)
            .with_context(|| format!("failed to persist rule {}", rule.id))?;
        self.rules.upsert(rule.clone())?;
        info!(rule = %rule.id, priority = rule.priority, "rule saved");
        Ok(())
    }

    /// Alias of `add_rule`: admin mutations are idempotent by id.
    pub fn update_rule(&self, rule: RoutingRule) -> Result<()> {
        self.add_rule(rule)
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.repository
            .delete_rule(id)
            .with_context(|| format!("failed to delete rule {id}"))?;
        let removed = self.rules.delete(id);
        info!(rule = %id, removed, "rule deleted");
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<RoutingRule> {
        self.rules.snapshot().as_ref().clone()
    }

    // -------------------------------------------------------------------------
    // Admin: exposure limits
    // -------------------------------------------------------------------------

    pub fn set_exposure_limit(&self, symbol: &str, limit: ExposureLimit) -> Result<()> {
        limit.validate()?;
        self.repository
            .save_exposure_limit(symbol, &limit)
            .with_context(|| format!("failed to persist exposure limit for {symbol}"))?;
        self.exposure.set_limit(symbol, limit)
    }

    pub fn get_exposure(&self, symbol: &str) -> ExposureSnapshot {
        self.exposure.snapshot(symbol)
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            decisions_total: self.stats.decisions_total.load(Ordering::Relaxed),
            a_book: self.stats.a_book.load(Ordering::Relaxed),
            b_book: self.stats.b_book.load(Ordering::Relaxed),
            partial_hedge: self.stats.partial_hedge.load(Ordering::Relaxed),
            reject: self.stats.reject.load(Ordering::Relaxed),
            reasons: self.stats.reasons.read().clone(),
            retry_pending: self.retry.len(),
            retry_dropped: self.retry.dropped(),
            retry_abandoned: self.retry.abandoned(),
            send_timeouts: self.retry.timeouts(),
            profiler_dropped_events: self.profiler.dropped_events(),
        }
    }

    /// The most recent `limit` decisions.
    pub fn history(&self, limit: usize) -> Vec<RoutingDecision> {
        self.history.tail(limit)
    }

    /// Shared retry buffer, for wiring the hedge dispatcher.
    pub fn retry_buffer(&self) -> Arc<RetryBuffer> {
        Arc::clone(&self.retry)
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("rules", &self.rules.snapshot().len())
            .field("history", &self.history)
            .field("retry", &self.retry)
            .finish()
    }
}
