// =============================================================================
// LP Manager — adapter lifecycle, status aggregation, session handles
// =============================================================================
//
// Owns the set of configured liquidity providers and their live adapters.
// Admin mutations (add / update / remove / toggle) are idempotent by id,
// write through the repository when one is attached, and tear down +
// reinstantiate the affected adapter.
//
// Quotes flow: adapter task -> manager consumer task -> quote sink (owned
// by the SOR).  The manager never holds quotes itself.
// =============================================================================

pub mod adapter;
pub mod fix;
pub mod rest;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use self::adapter::{AdapterStatus, LpAdapter, OrderRequest, Quote};

use self::fix::FixSession;
use self::rest::{RestAdapter, RestSettings};
use self::ws::{WsAdapter, WsSettings};
use crate::repository::Repository;

/// Delay between quote session reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Transport kind of a liquidity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LpKind {
    Rest,
    WebSocket,
    Fix,
}

impl std::fmt::Display for LpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => write!(f, "Rest"),
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Fix => write!(f, "Fix"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

/// Configuration of a single liquidity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfig {
    pub id: String,
    pub name: String,
    pub kind: LpKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower sorts first on ties.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// FIX session (or venue sub-account) this LP executes through.
    #[serde(default)]
    pub session_handle: Option<String>,
    /// When present, the LP only quotes/executes these symbols.
    #[serde(default)]
    pub symbol_whitelist: Option<Vec<String>>,
    /// Transport-specific settings, deserialized by the adapter.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl LpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("LP id must not be empty");
        }
        if self.name.is_empty() {
            anyhow::bail!("LP name must not be empty");
        }
        Ok(())
    }

    /// Whether this LP may quote/execute `symbol`.
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        match &self.symbol_whitelist {
            Some(list) => list.iter().any(|s| s == symbol),
            None => true,
        }
    }

    /// The execution session for this LP, defaulting to "default".
    pub fn effective_session_handle(&self) -> String {
        self.session_handle
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Per-LP status row for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct LpStatusSnapshot {
    pub id: String,
    pub name: String,
    pub kind: LpKind,
    pub enabled: bool,
    pub priority: u32,
    pub session_handle: String,
    pub connected: bool,
    pub last_quote_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Where accepted quotes are delivered (the SOR's ingest).
pub type QuoteSink = Arc<dyn Fn(Quote) + Send + Sync>;

struct LpHandle {
    config: LpConfig,
    adapter: Option<Arc<dyn LpAdapter>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct LpManager {
    lps: RwLock<HashMap<String, LpHandle>>,
    /// FIX sessions registered by the surrounding infrastructure, keyed by
    /// session handle.
    fix_sessions: RwLock<HashMap<String, Arc<dyn FixSession>>>,
    quote_sink: RwLock<Option<QuoteSink>>,
    repository: RwLock<Option<Arc<dyn Repository>>>,
    /// Symbols adapters subscribe to.
    symbols: RwLock<Vec<String>>,
    /// Deadline for a single connect attempt inside the session loop.
    reconnect_timeout: RwLock<Duration>,
    started: AtomicBool,
}

impl LpManager {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            lps: RwLock::new(HashMap::new()),
            fix_sessions: RwLock::new(HashMap::new()),
            quote_sink: RwLock::new(None),
            repository: RwLock::new(None),
            symbols: RwLock::new(symbols),
            reconnect_timeout: RwLock::new(Duration::from_secs(2)),
            started: AtomicBool::new(false),
        }
    }

    pub fn set_reconnect_timeout(&self, timeout: Duration) {
        *self.reconnect_timeout.write() = timeout;
    }

    /// Attach the repository that admin mutations write through.
    pub fn set_repository(&self, repo: Arc<dyn Repository>) {
        *self.repository.write() = Some(repo);
    }

    /// Attach the quote sink. Must happen before `start`.
    pub fn set_quote_sink(&self, sink: QuoteSink) {
        *self.quote_sink.write() = Some(sink);
    }

    /// Register a FIX session under its handle so FIX LPs can resolve it.
    pub fn register_fix_session(&self, handle: impl Into<String>, session: Arc<dyn FixSession>) {
        self.fix_sessions.write().insert(handle.into(), session);
    }

    // -------------------------------------------------------------------------
    // Admin mutations
    // -------------------------------------------------------------------------

    /// Add (or replace) an LP. Activates it immediately when the manager is
    /// started and the config is enabled.
    pub fn add_lp(&self, config: LpConfig) -> Result<()> {
        config.validate()?;
        self.persist(&config)?;

        let id = config.id.clone();
        self.teardown(&id);
        self.lps.write().insert(
            id.clone(),
            LpHandle {
                config,
                adapter: None,
                tasks: Vec::new(),
            },
        );
        info!(lp = %id, "LP added");

        if self.started.load(Ordering::SeqCst) {
            self.activate(&id)?;
        }
        Ok(())
    }

    /// Update an existing LP. The adapter is torn down and reinstantiated.
    pub fn update_lp(&self, config: LpConfig) -> Result<()> {
        if !self.lps.read().contains_key(&config.id) {
            anyhow::bail!("unknown LP {}", config.id);
        }
        self.add_lp(config)
    }

    /// Remove an LP entirely.
    pub fn remove_lp(&self, id: &str) -> Result<()> {
        self.teardown(id);
        if self.lps.write().remove(id).is_none() {
            anyhow::bail!("unknown LP {id}");
        }
        if let Some(repo) = self.repository.read().clone() {
            repo.delete_lp_config(id)
                .with_context(|| format!("failed to delete LP config {id}"))?;
        }
        info!(lp = %id, "LP removed");
        Ok(())
    }

    /// Enable or disable an LP without losing its configuration.
    pub fn toggle_lp(&self, id: &str, enabled: bool) -> Result<()> {
        let config = {
            let mut lps = self.lps.write();
            let handle = lps
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown LP {id}"))?;
            handle.config.enabled = enabled;
            handle.config.clone()
        };
        self.persist(&config)?;

        if enabled && self.started.load(Ordering::SeqCst) {
            self.activate(id)?;
        } else {
            self.teardown(id);
        }
        info!(lp = %id, enabled, "LP toggled");
        Ok(())
    }

    fn persist(&self, config: &LpConfig) -> Result<()> {
        if let Some(repo) = self.repository.read().clone() {
            repo.save_lp_config(config)
                .with_context(|| format!("failed to persist LP config {}", config.id))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn config(&self, id: &str) -> Option<LpConfig> {
        self.lps.read().get(id).map(|h| h.config.clone())
    }

    /// Session handle an order for this LP should execute through.
    pub fn session_handle(&self, id: &str) -> String {
        self.config(id)
            .map(|c| c.effective_session_handle())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn adapter(&self, id: &str) -> Option<Arc<dyn LpAdapter>> {
        self.lps.read().get(id).and_then(|h| h.adapter.clone())
    }

    /// Per-LP status snapshot for dashboards.
    pub fn status(&self) -> Vec<LpStatusSnapshot> {
        let lps = self.lps.read();
        let mut out: Vec<LpStatusSnapshot> = lps
            .values()
            .map(|h| {
                let adapter_status = h.adapter.as_ref().map(|a| a.status());
                LpStatusSnapshot {
                    id: h.config.id.clone(),
                    name: h.config.name.clone(),
                    kind: h.config.kind,
                    enabled: h.config.enabled,
                    priority: h.config.priority,
                    session_handle: h.config.effective_session_handle(),
                    connected: adapter_status.as_ref().map(|s| s.connected).unwrap_or(false),
                    last_quote_age_ms: adapter_status.as_ref().and_then(|s| s.last_quote_age_ms),
                    error: adapter_status.and_then(|s| s.error),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Ids of currently configured LPs.
    pub fn lp_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lps.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Activate all enabled LPs. Requires a tokio runtime and a quote sink.
    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let ids: Vec<String> = {
            let lps = self.lps.read();
            lps.values()
                .filter(|h| h.config.enabled)
                .map(|h| h.config.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.activate(&id) {
                error!(lp = %id, error = %e, "failed to activate LP");
            }
        }
        Ok(())
    }

    /// Tear down every adapter and stop spawning new sessions.
    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.lps.read().keys().cloned().collect();
        for id in ids {
            self.teardown(&id);
        }
        info!("LP manager shut down");
    }

    /// Build the adapter for a config and spawn its quote tasks.
    fn activate(&self, id: &str) -> Result<()> {
        let config = self
            .config(id)
            .ok_or_else(|| anyhow::anyhow!("unknown LP {id}"))?;
        if !config.enabled {
            return Ok(());
        }

        let adapter = self.build_adapter(&config)?;
        let sink = self
            .quote_sink
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("quote sink not attached"))?;

        let mut tasks = Vec::new();

        // Quote consumer: adapter stream -> sink.
        if let Some(mut rx) = adapter.take_quote_stream() {
            let consumer = tokio::spawn(async move {
                while let Some(quote) = rx.recv().await {
                    sink(quote);
                }
            });
            tasks.push(consumer);
        }

        // Session driver with reconnect loop.
        {
            let adapter = Arc::clone(&adapter);
            let symbols = self.symbols.read().clone();
            let connect_timeout = *self.reconnect_timeout.read();
            let lp_id = id.to_string();
            let driver = tokio::spawn(async move {
                if let Err(e) = adapter.subscribe(&symbols).await {
                    warn!(lp = %lp_id, error = %e, "initial subscription failed");
                }
                loop {
                    match tokio::time::timeout(connect_timeout, adapter.connect()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(lp = %lp_id, error = %e, "connect failed — retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                        Err(_) => {
                            warn!(lp = %lp_id, ?connect_timeout, "connect timed out — retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    }
                    match adapter.run_quote_session().await {
                        Ok(()) => {
                            debug!(lp = %lp_id, "quote session ended");
                        }
                        Err(e) => {
                            warn!(lp = %lp_id, error = %e, "quote session error — reconnecting");
                        }
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            });
            tasks.push(driver);
        }

        let mut lps = self.lps.write();
        if let Some(handle) = lps.get_mut(id) {
            handle.adapter = Some(adapter);
            handle.tasks = tasks;
        }
        info!(lp = %id, kind = %config.kind, "LP activated");
        Ok(())
    }

    /// Abort tasks and drop the adapter for an LP, if any.
    fn teardown(&self, id: &str) {
        let (tasks, adapter) = {
            let mut lps = self.lps.write();
            match lps.get_mut(id) {
                Some(handle) => (
                    std::mem::take(&mut handle.tasks),
                    handle.adapter.take(),
                ),
                None => return,
            }
        };
        for task in tasks {
            task.abort();
        }
        if let Some(adapter) = adapter {
            // Polite transport close; fire-and-forget.
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move { adapter.disconnect().await });
            }
        }
        debug!(lp = %id, "LP torn down");
    }

    fn build_adapter(&self, config: &LpConfig) -> Result<Arc<dyn LpAdapter>> {
        match config.kind {
            LpKind::Rest => {
                let settings: RestSettings = serde_json::from_value(config.settings.clone())
                    .with_context(|| format!("invalid REST settings for LP {}", config.id))?;
                Ok(Arc::new(RestAdapter::new(config.id.clone(), settings)))
            }
            LpKind::WebSocket => {
                let settings: WsSettings = serde_json::from_value(config.settings.clone())
                    .with_context(|| format!("invalid WebSocket settings for LP {}", config.id))?;
                Ok(Arc::new(WsAdapter::new(config.id.clone(), settings)))
            }
            LpKind::Fix => {
                let handle = config.effective_session_handle();
                let session = self
                    .fix_sessions
                    .read()
                    .get(&handle)
                    .cloned()
                    .ok_or_else(|| {
                        anyhow::anyhow!("no FIX session registered for handle {handle}")
                    })?;
                Ok(Arc::new(fix::FixAdapter::new(config.id.clone(), session)))
            }
        }
    }
}

impl std::fmt::Debug for LpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpManager")
            .field("lps", &self.lps.read().len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
