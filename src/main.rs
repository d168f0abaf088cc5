// =============================================================================
// Meridian Routing Engine — Main Entry Point
// =============================================================================
//
// Boots the broker-side routing core: configuration, persisted admin state,
// LP adapters, and the long-lived tasks (health probe, fill ingest, hedge
// dispatcher, alert monitor). The gateway and fill collaborators attach
// through the channels wired here.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian_engine::app_state::{self, EngineState};
use meridian_engine::config::EngineConfig;
use meridian_engine::internal::{ChannelDesk, InternalDesk};
use meridian_engine::repository::FileRepository;
use meridian_engine::router::HedgeDispatcher;
use meridian_engine::sor::health::run_health_probe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Routing Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "engine_config.json".to_string());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["EURUSD".into(), "GBPUSD".into()];
    }
    info!(symbols = ?config.symbols, "configured symbols");

    let shutdown_deadline = Duration::from_secs(config.shutdown_deadline_secs);
    let backoff: Vec<Duration> = config
        .retry_backoff_ms
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();
    let send_timeout = Duration::from_millis(config.send_order_timeout_ms);
    let probe_interval = Duration::from_secs(config.probe_interval_secs);
    let heartbeat_timeout = Duration::from_millis(config.quote_staleness_ms.max(10_000));

    // ── 2. Persistence & collaborators ───────────────────────────────────
    let data_dir = std::env::var("MERIDIAN_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let repository = Arc::new(FileRepository::new(&data_dir)?);

    // The internal counterparty consumes B-Book tickets from this channel.
    let (desk, mut bbook_rx) = ChannelDesk::new(4_096);

    // ── 3. Build shared state ────────────────────────────────────────────
    let desk_dyn: Arc<dyn InternalDesk> = desk.clone() as Arc<dyn InternalDesk>;
    let state = EngineState::new(config, repository, desk_dyn)?;

    // ── 4. Spawn long-lived tasks ────────────────────────────────────────
    let mut tasks = Vec::new();

    // B-Book ticket drain: stands in for the internal counterparty feed.
    tasks.push(tokio::spawn(async move {
        while let Some(ticket) = bbook_rx.recv().await {
            info!(
                order = %ticket.order_id,
                symbol = %ticket.symbol,
                volume = ticket.volume,
                "B-Book ticket accepted internally"
            );
        }
    }));

    // LP adapters and quote consumers.
    state.lp_manager.start()?;

    // Periodic LP connection probe.
    tasks.push(tokio::spawn(run_health_probe(
        Arc::clone(&state.lp_manager),
        Arc::clone(state.sor.health()),
        probe_interval,
        heartbeat_timeout,
    )));

    // Hedge dispatcher with retry/backoff.
    let dispatcher_desk: Arc<dyn InternalDesk> = desk.clone() as Arc<dyn InternalDesk>;
    tasks.push(tokio::spawn(
        HedgeDispatcher {
            buffer: state.router.retry_buffer(),
            sor: Arc::clone(&state.sor),
            lp_manager: Arc::clone(&state.lp_manager),
            exposure: Arc::clone(&state.exposure),
            desk: dispatcher_desk,
            alerts: state.alerts.clone(),
            backoff,
            send_timeout,
        }
        .run(),
    ));

    // Fill collaborator channel; the embedding host pushes TradeEvents here.
    let (fill_tx, fill_rx) = tokio::sync::mpsc::channel(1_024);
    tasks.push(tokio::spawn(app_state::run_fill_ingest(
        Arc::clone(&state),
        fill_rx,
    )));
    // Keep the sender alive for the process lifetime; collaborators clone it.
    let _fill_tx = fill_tx;

    // Alert mirror into the dashboard error ring.
    tasks.push(tokio::spawn(app_state::run_alert_monitor(Arc::clone(
        &state,
    ))));

    // Periodic status line for operators.
    {
        let state = Arc::clone(&state);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let snap = state.build_snapshot();
                info!(
                    version = snap.state_version,
                    decisions = snap.stats.decisions_total,
                    pending_hedges = snap.stats.retry_pending,
                    lps = snap.lps.len(),
                    "engine status"
                );
            }
        }));
    }

    info!(
        lps = state.lp_manager.lp_ids().len(),
        rules = state.router.list_rules().len(),
        "engine ready"
    );

    // ── 5. Run until shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Cooperative shutdown: stop adapters, then give tasks a bounded window
    // to drain before aborting.
    state.lp_manager.shutdown();
    let drain = async {
        while !state.router.retry_buffer().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(shutdown_deadline, drain).await.is_err() {
        warn!(
            pending = state.router.retry_buffer().len(),
            "shutdown deadline hit with pending hedges"
        );
    }
    for task in tasks {
        task.abort();
    }

    info!("engine stopped");
    Ok(())
}
