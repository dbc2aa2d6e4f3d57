//! Grid Trader - Main Entry Point
//!
//! Runs the engine against the paper broker, or prints the persisted state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grid_trader::config::Config;
use grid_trader::exchange::{PaperBroker, SymbolQuote};
use grid_trader::persistence::{Ledger, SqliteLedger};
use grid_trader::scheduler::{Engine, Scheduler};
use grid_trader::store::Stores;
use grid_trader::utils::{Clock, SystemClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Grid Trader CLI
#[derive(Parser)]
#[command(name = "grid-trader")]
#[command(version, about = "Intraday grid trading with broker reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine until Ctrl-C (default)
    Run,

    /// Show strategies, active orders and positions from the ledger
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show every active order and position
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&db, verbose).await
        }
        Some(Commands::Run) | None => {
            init_logging(&config.persistence.log_dir)?;
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Grid Trader v{} starting", env!("CARGO_PKG_VERSION"));
    log_config(&config);

    let ledger: Arc<dyn Ledger> = Arc::new(
        SqliteLedger::open(&config.persistence.db_path).context("Failed to open ledger")?,
    );
    let stores = Stores::hydrate(ledger).await?;

    for strategy in &config.strategies {
        if stores.strategies.by_code(&strategy.code).is_err() {
            info!(strategy = %strategy.code, symbol = %strategy.symbol_code, "Seeding strategy");
            stores.strategies.save(strategy.clone());
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.market.offset()));
    let broker = Arc::new(PaperBroker::new(clock.clone()));
    for quote in &config.paper.quotes {
        broker
            .set_quote(SymbolQuote {
                symbol_code: quote.symbol_code.clone(),
                exchange: quote.exchange.clone(),
                price: quote.price,
                price_at: Some(clock.now()),
                bid: quote.price,
                ask: quote.price,
                trading_unit: quote.trading_unit,
                tick_group: quote.tick_group,
            })
            .await;
    }

    let engine = Arc::new(Engine::new(
        broker,
        &stores,
        clock,
        config.market.session(),
        config.reconcile.lookback(),
    ));
    let scheduler = Scheduler::new(
        engine,
        Duration::from_secs(config.scheduler.reconcile_interval_secs),
        Duration::from_secs(config.scheduler.order_interval_secs),
    );

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    scheduler.run(shutdown).await;

    stores.writes.flush().await;
    let failures = stores.writes.failures();
    if failures > 0 {
        warn!(failures, "Some ledger writes failed during this run");
    }

    info!("Grid Trader shutdown complete");
    Ok(())
}

fn init_logging(log_dir: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "grid-trader.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("grid_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!(
        reconcile_secs = config.scheduler.reconcile_interval_secs,
        order_secs = config.scheduler.order_interval_secs,
        "Scheduler"
    );
    info!(
        utc_offset = config.market.utc_offset_hours,
        session_start = %config.market.session_start,
        session_end = %config.market.session_end,
        "Market"
    );
    info!(lookback_secs = config.reconcile.lookback_secs, "Reconciliation");
    info!(
        db = %config.persistence.db_path,
        logs = %config.persistence.log_dir,
        "Persistence"
    );
    for strategy in &config.strategies {
        info!(
            strategy = %strategy.code,
            symbol = %strategy.symbol_code,
            side = ?strategy.entry_side,
            cash = %strategy.cash,
            grid = strategy.grid.runnable,
            rebalance = strategy.rebalance.runnable,
            "Configured strategy"
        );
    }
}

/// Print the persisted ledger state.
async fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("The engine has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let ledger = SqliteLedger::open(db_path)?;
    let strategies = ledger.load_strategies().await?;
    let orders = ledger.load_active_orders().await?;
    let positions = ledger.load_active_positions().await?;

    println!("Strategies ({})", strategies.len());
    for s in &strategies {
        let owned: rust_decimal::Decimal = positions
            .iter()
            .filter(|p| p.strategy_code == s.code)
            .map(|p| p.owned_quantity)
            .sum();
        let last = s
            .last_contract_at
            .map(|at| format!("{} @ {}", s.last_contract_price, at.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {} {:?} | cash {} | owned {} | last {} | runnable {}",
            s.code, s.symbol_code, s.entry_side, s.cash, owned, last, s.runnable
        );
    }

    println!("Active orders: {}", orders.len());
    println!("Active positions: {}", positions.len());

    if verbose {
        for o in &orders {
            println!(
                "  order {} [{}] {:?} {:?} {:?} {} x {} (filled {})",
                o.code,
                o.strategy_code,
                o.trade_type,
                o.side,
                o.execution_type,
                o.price,
                o.order_quantity,
                o.contract_quantity
            );
        }
        for p in &positions {
            println!(
                "  position {} [{}] {:?} {} x {} (held {}) at {}",
                p.code,
                p.strategy_code,
                p.side,
                p.price,
                p.owned_quantity,
                p.hold_quantity,
                p.contracted_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}
