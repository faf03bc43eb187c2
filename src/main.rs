use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use tpslbot::api::BinanceTickerClient;
use tpslbot::config::FileSettings;
use tpslbot::execution::{
    AutoLoop, ChannelExecutor, Intent, LoopHandle, PositionManager, TpslCore,
};
use tpslbot::persistence::{EventLog, LoadOutcome, PersistedState, StateManager, TpslEvent};
use tpslbot::{Settings, TrailingMode};

const DEFAULT_CONFIG: &str = "tpsl.toml";
const DEFAULT_STATE: &str = "runtime/tpsl_state.json";
const DEFAULT_EVENTS: &str = "runtime/tpsl_events.jsonl";

#[derive(Parser, Debug)]
#[command(name = "tpslbot", about = "Take-profit / stop-loss autoloop", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the autoloop against live Binance prices
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_STATE)]
        state: PathBuf,
        #[arg(long, default_value = DEFAULT_EVENTS)]
        events: PathBuf,
        /// Confirm exits immediately at the current price
        #[arg(long, default_value_t = false)]
        paper: bool,
    },
    /// Print the persisted positions
    Status {
        #[arg(long, default_value = DEFAULT_STATE)]
        state: PathBuf,
    },
    /// Register a filled entry for TP/SL management
    Open {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        entry: f64,
        #[arg(long)]
        qty: f64,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_STATE)]
        state: PathBuf,
        #[arg(long, default_value = DEFAULT_EVENTS)]
        events: PathBuf,
        /// Edit the state file even if a running loop saved it recently
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Confirm the exit fill of a closing position
    Close {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        fill: f64,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_STATE)]
        state: PathBuf,
        #[arg(long, default_value = DEFAULT_EVENTS)]
        events: PathBuf,
        /// Edit the state file even if a running loop saved it recently
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Static,
    Dynamic,
}

impl From<ModeArg> for TrailingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Static => TrailingMode::Static,
            ModeArg::Dynamic => TrailingMode::Dynamic,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Run {
            config,
            state,
            events,
            paper,
        } => run(config, state, events, paper).await,
        Cmd::Status { state } => status(state),
        Cmd::Open {
            symbol,
            entry,
            qty,
            mode,
            config,
            state,
            events,
            force,
        } => open(&symbol, entry, qty, mode, config, state, events, force),
        Cmd::Close {
            symbol,
            fill,
            config,
            state,
            events,
            force,
        } => close(&symbol, fill, config, state, events, force),
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tpslbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: PathBuf, state: PathBuf, events: PathBuf, paper: bool) -> Result<()> {
    let settings_source = FileSettings::new(&config);
    let settings = Settings::load(Some(config.as_path()))
        .with_context(|| format!("invalid settings in {}", config.display()))?;

    tracing::info!("🚀 TPSL autoloop starting");
    tracing::info!(
        config = %config.display(),
        state = %state.display(),
        mode = %settings.mode,
        interval_sec = settings.interval_sec,
        paper,
        "Configuration"
    );

    let prices = BinanceTickerClient::new()?;
    let core = TpslCore::new(
        StateManager::new(&state),
        EventLog::new(Some(events)),
        &settings,
    );
    let (executor, intents) = ChannelExecutor::new();
    let automation = Arc::new(AtomicBool::new(true));

    let (autoloop, handle) = AutoLoop::new(
        core,
        prices.clone(),
        executor,
        settings_source,
        automation,
    );
    let loop_task = tokio::spawn(autoloop.run());

    let intent_task = tokio::spawn(route_intents(intents, handle.clone(), prices, paper));

    handle.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("Ctrl+C received, shutting down");

    handle.shutdown().await?;
    let core = loop_task.await.context("autoloop task panicked")?;
    intent_task.abort();

    tracing::info!(
        open = core.positions().open_positions().len(),
        closed = core.positions().closed_positions().len(),
        total_pnl = core.positions().total_pnl(),
        "TPSL autoloop stopped"
    );
    Ok(())
}

/// Hand intents to execution; in paper mode fill exits at the current price
async fn route_intents(
    mut intents: mpsc::UnboundedReceiver<Intent>,
    handle: LoopHandle,
    prices: BinanceTickerClient,
    paper: bool,
) {
    while let Some(intent) = intents.recv().await {
        match &intent {
            Intent::StartExit { symbol, reason } | Intent::EmergencyExit { symbol, reason } => {
                if !paper {
                    tracing::warn!(symbol = %symbol, reason = %reason, "Exit intent needs an order router");
                    continue;
                }
                match prices.fetch_price(symbol).await {
                    Ok(fill) => {
                        tracing::info!(symbol = %symbol, fill, reason = %reason, "📝 Paper fill");
                        if let Err(e) = handle.position_closed(symbol, fill).await {
                            tracing::error!(error = %e, "Could not confirm paper fill");
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Paper fill deferred"),
                }
            }
            Intent::StaleData {
                symbol,
                consecutive_misses,
            } => {
                tracing::error!(symbol = %symbol, consecutive_misses, "Stale price data");
            }
        }
    }
}

fn status(state: PathBuf) -> Result<()> {
    let manager = StateManager::new(&state);
    let snapshot = match manager.load_detailed() {
        LoadOutcome::Loaded(s) | LoadOutcome::Migrated { state: s, .. } => s,
        LoadOutcome::Missing => {
            println!("No state at {}", state.display());
            return Ok(());
        }
        LoadOutcome::Invalid(reason) | LoadOutcome::Unreadable(reason) => {
            anyhow::bail!("state at {} unusable: {}", state.display(), reason)
        }
    };

    println!(
        "mode={} enabled={} last_tick={}",
        snapshot.mode, snapshot.enabled, snapshot.last_tick_ts
    );
    if snapshot.positions.is_empty() {
        println!("No open positions");
    }
    for p in &snapshot.positions {
        println!(
            "{:<12} {:<8} entry={:<12.6} qty={:<10.6} peak={:<12.6} sl={:<12.6} tp={:<12.6} trailing={} be={}",
            p.symbol,
            format!("{:?}", p.state).to_uppercase(),
            p.entry_price,
            p.quantity,
            p.max_price_seen,
            p.sl_price,
            p.tp_price,
            p.trailing_active,
            p.break_even_done
        );
    }

    let realized = snapshot
        .realized_pnl
        .unwrap_or_else(|| snapshot.closed_positions.iter().map(|c| c.pnl).sum());
    println!(
        "{} closed, realized P&L {:.4}",
        snapshot.closed_positions.len(),
        realized
    );
    Ok(())
}

/// Load the snapshot for an offline edit
///
/// Refuses a corrupt file, and a file a running loop is still writing
/// unless `force` is set.
fn offline_state(
    manager: &StateManager,
    settings: &Settings,
    force: bool,
) -> Result<(PositionManager, PersistedState)> {
    let snapshot = match manager.load_detailed() {
        LoadOutcome::Loaded(s) | LoadOutcome::Migrated { state: s, .. } => s,
        LoadOutcome::Missing => PersistedState {
            // No loop has ticked on this file yet
            last_tick_ts: DateTime::<Utc>::UNIX_EPOCH,
            ..PersistedState::new(settings.mode, settings.enabled)
        },
        LoadOutcome::Invalid(reason) | LoadOutcome::Unreadable(reason) => {
            anyhow::bail!("state at {} unusable: {}", manager.path().display(), reason)
        }
    };

    if snapshot.written_by_live_loop(settings.interval_sec, Utc::now()) {
        if !force {
            anyhow::bail!(
                "state at {} was saved by a running loop at {}; stop it first or pass --force",
                manager.path().display(),
                snapshot.last_tick_ts
            );
        }
        tracing::warn!(path = %manager.path().display(), "Editing state of a live loop (--force)");
    }

    let pm = PositionManager::with_positions(
        settings.archive_limit,
        snapshot.positions.clone(),
        snapshot.closed_positions.clone(),
        snapshot.realized_pnl,
    );
    Ok((pm, snapshot))
}

fn save_offline(
    manager: &StateManager,
    pm: &PositionManager,
    snapshot: PersistedState,
    settings: &Settings,
) -> Result<()> {
    let updated = PersistedState {
        mode: settings.mode,
        enabled: settings.enabled,
        positions: pm.snapshot(),
        closed_positions: pm.closed_positions().to_vec(),
        realized_pnl: Some(pm.total_pnl()),
        ..snapshot
    };
    manager.save(&updated)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn open(
    symbol: &str,
    entry: f64,
    qty: f64,
    mode: Option<ModeArg>,
    config: PathBuf,
    state: PathBuf,
    events: PathBuf,
    force: bool,
) -> Result<()> {
    let settings = Settings::load(Some(config.as_path()))?;
    let manager = StateManager::new(&state);
    let (mut pm, snapshot) = offline_state(&manager, &settings, force)?;

    let mode = mode.map(TrailingMode::from).unwrap_or(settings.mode);
    let position = pm.open_position(symbol, entry, qty, mode, &settings)?;
    save_offline(&manager, &pm, snapshot, &settings)?;

    EventLog::new(Some(events)).emit(TpslEvent::PositionOpened {
        symbol: position.symbol.clone(),
        entry_price: entry,
        quantity: qty,
    });

    println!(
        "Opened {} entry={} qty={} sl={:.6} tp={:.6} mode={}",
        position.symbol, position.entry_price, position.quantity, position.sl_price, position.tp_price, position.mode
    );
    Ok(())
}

fn close(
    symbol: &str,
    fill: f64,
    config: PathBuf,
    state: PathBuf,
    events: PathBuf,
    force: bool,
) -> Result<()> {
    let settings = Settings::load(Some(config.as_path()))?;
    let manager = StateManager::new(&state);
    let (mut pm, snapshot) = offline_state(&manager, &settings, force)?;

    let closed = pm.mark_closed(symbol, fill, Utc::now())?;
    save_offline(&manager, &pm, snapshot, &settings)?;

    EventLog::new(Some(events)).emit(TpslEvent::PositionClosed {
        symbol: closed.symbol.clone(),
        pnl: closed.pnl,
        duration: closed.duration_secs,
    });

    println!(
        "Closed {} fill={} pnl={:.6} ({:.2}%) after {}s",
        closed.symbol,
        closed.fill_price,
        closed.pnl,
        closed.pnl_pct * 100.0,
        closed.duration_secs
    );
    Ok(())
}
