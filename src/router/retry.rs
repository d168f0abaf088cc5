// =============================================================================
// Hedge Retry — bounded pending-execution buffer and dispatch loop
// =============================================================================
//
// Both halves of a decision's handoff can fail transiently: the SOR may
// have no eligible LP, the chosen LP may time out or reject, and the
// internal desk may refuse a ticket.  Those portions land here.
//
// The buffer is bounded; overflow drops the oldest entry and counts it.
// The dispatch loop replays entries on an exponential backoff schedule and
// abandons with an alert once the schedule is exhausted.  Decisions are
// never retried — only executions are.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::exposure::ExposureTracker;
use crate::internal::{BBookTicket, InternalDesk};
use crate::lp::{LpManager, OrderRequest};
use crate::sor::{ExecOutcome, SelectOutcome, SmartOrderRouter};
use crate::types::{EngineAlert, FillSource, Side};

// ---------------------------------------------------------------------------
// Pending work
// ---------------------------------------------------------------------------

/// Which side of the split this entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// External hedge to be sent to an LP.
    Hedge,
    /// Internalized portion awaiting desk acceptance.
    Internal,
}

#[derive(Debug, Clone)]
pub struct PendingExecution {
    pub kind: PendingKind,
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: Option<f64>,
    pub attempt: usize,
    /// Earliest instant this entry may be retried.
    pub not_before: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

pub struct RetryBuffer {
    queue: Mutex<VecDeque<PendingExecution>>,
    capacity: usize,
    wakeup: Notify,
    dropped: AtomicU64,
    abandoned: AtomicU64,
    timeouts: AtomicU64,
}

impl RetryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            wakeup: Notify::new(),
            dropped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Enqueue; oldest entry is dropped (and counted) on overflow.
    pub fn push(&self, entry: PendingExecution) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(entry);
            while queue.len() > self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.wakeup.notify_one();
    }

    /// Pop the next entry whose backoff has elapsed, if any.
    pub fn pop_due(&self) -> Option<PendingExecution> {
        let mut queue = self.queue.lock();
        let due = queue
            .front()
            .map(|e| e.not_before.map(|t| t <= Instant::now()).unwrap_or(true))
            .unwrap_or(false);
        if due {
            queue.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.wakeup.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

impl std::fmt::Debug for RetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .field("abandoned", &self.abandoned())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

pub struct HedgeDispatcher {
    pub buffer: Arc<RetryBuffer>,
    pub sor: Arc<SmartOrderRouter>,
    pub lp_manager: Arc<LpManager>,
    pub exposure: Arc<ExposureTracker>,
    pub desk: Arc<dyn InternalDesk>,
    pub alerts: broadcast::Sender<EngineAlert>,
    /// Backoff schedule; exhausting it abandons the entry.
    pub backoff: Vec<Duration>,
    pub send_timeout: Duration,
}

impl HedgeDispatcher {
    /// Run until aborted. Spawned once at engine startup.
    pub async fn run(self) {
        info!(backoff = ?self.backoff, "hedge dispatcher started");
        loop {
            let Some(entry) = self.buffer.pop_due() else {
                self.buffer.wait_for_work().await;
                continue;
            };
            self.dispatch(entry).await;
        }
    }

    async fn dispatch(&self, entry: PendingExecution) {
        let ok = match entry.kind {
            PendingKind::Internal => self.dispatch_internal(&entry),
            PendingKind::Hedge => self.dispatch_hedge(&entry).await,
        };
        if !ok {
            self.requeue(entry);
        }
    }

    fn dispatch_internal(&self, entry: &PendingExecution) -> bool {
        self.desk.try_accept(BBookTicket {
            order_id: entry.order_id.clone(),
            account_id: entry.account_id.clone(),
            symbol: entry.symbol.clone(),
            side: entry.side,
            volume: entry.volume,
            price: entry.price,
        })
    }

    /// One hedge attempt: select an LP, send with a deadline, apply the
    /// fill. Returns false when the attempt should be retried.
    async fn dispatch_hedge(&self, entry: &PendingExecution) -> bool {
        let selection = match self.sor.select(&entry.symbol, entry.side, entry.volume) {
            SelectOutcome::Selected(sel) => sel,
            SelectOutcome::Unavailable => {
                debug!(order = %entry.order_id, symbol = %entry.symbol, "no LP for hedge");
                return false;
            }
        };

        let Some(adapter) = self.lp_manager.adapter(&selection.lp_id) else {
            debug!(order = %entry.order_id, lp = %selection.lp_id, "adapter gone before send");
            return false;
        };

        // Fresh id per attempt so LP-side idempotency never swallows a retry.
        let hedge_order_id = uuid::Uuid::new_v4().to_string();
        let request = OrderRequest {
            order_id: hedge_order_id,
            symbol: entry.symbol.clone(),
            side: entry.side,
            volume: entry.volume,
            price: entry.price,
        };

        // Dropping the send future on deadline cancels the attempt; a
        // racing execution report dies with it and is only counted.
        let result = tokio::time::timeout(self.send_timeout, adapter.send_order(&request)).await;

        let health = self.sor.health();
        match result {
            Err(_elapsed) => {
                self.buffer.timeouts.fetch_add(1, Ordering::Relaxed);
                health.record_execution(&selection.lp_id, ExecOutcome::timeout());
                warn!(order = %entry.order_id, lp = %selection.lp_id, "hedge send timed out");
                false
            }
            Ok(Err(e)) => {
                health.record_execution(&selection.lp_id, ExecOutcome::timeout());
                warn!(order = %entry.order_id, lp = %selection.lp_id, error = %e, "hedge send failed");
                false
            }
            Ok(Ok(report)) if report.is_fill() => {
                let fill_price = report.fill_price.unwrap_or(selection.price);
                let slippage = (fill_price - selection.price).abs();
                health.record_execution(
                    &selection.lp_id,
                    ExecOutcome::fill(slippage, report.latency_ms),
                );
                if let Err(e) = self.exposure.apply_fill(
                    &entry.symbol,
                    entry.side,
                    entry.volume,
                    fill_price,
                    FillSource::Hedge,
                ) {
                    warn!(order = %entry.order_id, error = %e, "hedge fill not applied");
                }
                info!(
                    order = %entry.order_id,
                    lp = %selection.lp_id,
                    volume = entry.volume,
                    fill_price,
                    "hedge executed"
                );
                true
            }
            Ok(Ok(report)) => {
                health.record_execution(&selection.lp_id, ExecOutcome::reject(report.latency_ms));
                warn!(order = %entry.order_id, lp = %selection.lp_id, "hedge rejected by LP");
                false
            }
        }
    }

    fn requeue(&self, mut entry: PendingExecution) {
        if entry.attempt >= self.backoff.len() {
            self.buffer.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                order = %entry.order_id,
                symbol = %entry.symbol,
                attempts = entry.attempt,
                "execution abandoned after retry schedule"
            );
            let _ = self.alerts.send(EngineAlert::HedgeAbandoned {
                order_id: entry.order_id.clone(),
                symbol: entry.symbol.clone(),
                volume: entry.volume,
            });
            return;
        }
        let delay = self.backoff[entry.attempt];
        entry.attempt += 1;
        entry.not_before = Some(Instant::now() + delay);
        debug!(order = %entry.order_id, attempt = entry.attempt, ?delay, "execution requeued");
        self.buffer.push(entry);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> PendingExecution {
        PendingExecution {
            kind: PendingKind::Hedge,
            order_id: id.into(),
            account_id: "A1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 1.0,
            price: None,
            attempt: 0,
            not_before: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_with_counter() {
        let buffer = RetryBuffer::new(2);
        buffer.push(entry("o1"));
        buffer.push(entry("o2"));
        buffer.push(entry("o3"));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop_due().unwrap().order_id, "o2");
        assert_eq!(buffer.pop_due().unwrap().order_id, "o3");
    }

    #[test]
    fn pop_respects_backoff_deadline() {
        let buffer = RetryBuffer::new(10);
        let mut delayed = entry("o1");
        delayed.not_before = Some(Instant::now() + Duration::from_secs(60));
        buffer.push(delayed);

        assert!(buffer.pop_due().is_none());
        assert_eq!(buffer.len(), 1);

        let mut due = entry("o2");
        due.not_before = Some(Instant::now() - Duration::from_millis(1));
        // o2 sits behind o1, which is not due: strict FIFO keeps both queued.
        buffer.push(due);
        assert!(buffer.pop_due().is_none());
    }

    #[test]
    fn immediate_entries_pop_fifo() {
        let buffer = RetryBuffer::new(10);
        buffer.push(entry("o1"));
        buffer.push(entry("o2"));
        assert_eq!(buffer.pop_due().unwrap().order_id, "o1");
        assert_eq!(buffer.pop_due().unwrap().order_id, "o2");
        assert!(buffer.pop_due().is_none());
    }

    // -------------------------------------------------------------------------
    // Dispatcher end-to-end (scripted FIX session)
    // -------------------------------------------------------------------------

    use crate::config::EngineConfig;
    use crate::exposure::ExposureLimit;
    use crate::internal::ChannelDesk;
    use crate::lp::fix::tests::ScriptedSession;
    use crate::lp::{LpConfig, LpKind};
    use crate::types::EngineAlert;
    use crate::volatility::VolatilityTracker;
    use tokio::sync::broadcast;

    async fn live_sor() -> (Arc<LpManager>, Arc<SmartOrderRouter>) {
        let manager = Arc::new(LpManager::new(vec!["EURUSD".to_string()]));
        manager.register_fix_session("fix-a", Arc::new(ScriptedSession::new(1.1)));

        let volatility = Arc::new(VolatilityTracker::new(Duration::from_secs(300)));
        let sor = Arc::new(SmartOrderRouter::new(
            &EngineConfig::default(),
            Arc::clone(&manager),
            volatility,
        ));
        {
            let sor = Arc::clone(&sor);
            manager.set_quote_sink(Arc::new(move |q| sor.ingest_quote(q)));
        }
        manager
            .add_lp(LpConfig {
                id: "LP1".into(),
                name: "LP1".into(),
                kind: LpKind::Fix,
                enabled: true,
                priority: 1,
                session_handle: Some("fix-a".into()),
                symbol_whitelist: None,
                settings: serde_json::Value::Null,
            })
            .unwrap();
        manager.start().unwrap();
        // Let the scripted session deliver its subscription quotes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        (manager, sor)
    }

    #[tokio::test]
    async fn dispatcher_executes_hedge_and_applies_fill() {
        let (manager, sor) = live_sor().await;

        let (alert_tx, _alert_rx) = broadcast::channel(16);
        let exposure = Arc::new(ExposureTracker::new(
            ExposureLimit::default(),
            alert_tx.clone(),
        ));
        exposure
            .apply_fill("EURUSD", Side::Buy, 1.0, 1.1, FillSource::Client)
            .unwrap();

        let buffer = Arc::new(RetryBuffer::new(100));
        let (desk, _desk_rx) = ChannelDesk::new(8);
        let desk: Arc<dyn InternalDesk> = desk;

        let dispatcher = HedgeDispatcher {
            buffer: Arc::clone(&buffer),
            sor: Arc::clone(&sor),
            lp_manager: Arc::clone(&manager),
            exposure: Arc::clone(&exposure),
            desk,
            alerts: alert_tx,
            backoff: vec![Duration::from_millis(10)],
            send_timeout: Duration::from_secs(1),
        };
        let task = tokio::spawn(dispatcher.run());

        let mut hedge = entry("client-order-1");
        hedge.volume = 0.4;
        buffer.push(hedge);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snap = exposure.snapshot("EURUSD");
        assert!((snap.net - 0.6).abs() < 1e-9, "net {}", snap.net);
        assert!(buffer.is_empty());
        assert!(sor.health().score("LP1") > 0.5);

        task.abort();
        manager.shutdown();
    }

    #[tokio::test]
    async fn dispatcher_abandons_after_schedule_with_alert() {
        let (alert_tx, mut alert_rx) = broadcast::channel(16);
        let exposure = Arc::new(ExposureTracker::new(
            ExposureLimit::default(),
            alert_tx.clone(),
        ));

        // No LPs at all: every attempt is Unavailable.
        let manager = Arc::new(LpManager::new(vec![]));
        let volatility = Arc::new(VolatilityTracker::new(Duration::from_secs(300)));
        let sor = Arc::new(SmartOrderRouter::new(
            &EngineConfig::default(),
            Arc::clone(&manager),
            volatility,
        ));

        let buffer = Arc::new(RetryBuffer::new(100));
        let (desk, _desk_rx) = ChannelDesk::new(8);
        let desk: Arc<dyn InternalDesk> = desk;

        let dispatcher = HedgeDispatcher {
            buffer: Arc::clone(&buffer),
            sor,
            lp_manager: manager,
            exposure,
            desk,
            alerts: alert_tx,
            backoff: vec![Duration::from_millis(5), Duration::from_millis(5)],
            send_timeout: Duration::from_millis(100),
        };
        let task = tokio::spawn(dispatcher.run());

        buffer.push(entry("doomed"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(buffer.is_empty());
        assert_eq!(buffer.abandoned(), 1);
        match alert_rx.try_recv() {
            Ok(EngineAlert::HedgeAbandoned { order_id, .. }) => {
                assert_eq!(order_id, "doomed");
            }
            other => panic!("expected HedgeAbandoned alert, got {other:?}"),
        }

        task.abort();
    }
}
