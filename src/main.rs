use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cycler::config::{AppConfig, LoggingConfig};
use cycler::engine::{cancel_cycle, create_cycle, StrategyOverrides, UpdateEngine};
use cycler::error::{CyclerError, Result};
use cycler::exchange::{build_client_table, parse_exchange, ClientTable, Exchange};
use cycler::repository::{AccumulationRepository, CycleRepository};
use cycler::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "cycler", about = "Multi-exchange BTC/USDC cycle trading bot")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "CYCLER_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (reconciliation + cycle creation on timers)
    Run,
    /// Run one reconciliation pass now
    Update {
        /// Restrict to one exchange
        #[arg(long)]
        exchange: Option<String>,
    },
    /// Create a new cycle now
    New {
        #[arg(long)]
        exchange: String,
    },
    /// Cancel a cycle: best-effort exchange cancel, then delete the row
    Cancel {
        #[arg(long)]
        id: u64,
        /// Delete the local row even if the exchange-side cancel fails
        #[arg(long)]
        force: bool,
    },
    /// List cycles, newest first
    Cycles {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List accumulation records, newest first
    Accumulations {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Probe every enabled exchange's connectivity and credentials
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Invalid configuration is fatal: never trade on an unknown state.
    let config = match AppConfig::load_from(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.logging);

    let clients = build_client_table(&config)?;
    if clients.is_empty() {
        error!("no exchanges enabled, nothing to do");
        std::process::exit(1);
    }

    let data_dir = Path::new(&config.storage.data_dir);
    let cycles = match CycleRepository::open(data_dir).await {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!(error = %e, "cycle repository unavailable");
            std::process::exit(1);
        }
    };
    let accumulations = match AccumulationRepository::open(data_dir).await {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!(error = %e, "accumulation repository unavailable");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Run => {
            let clients = probe_clients(clients).await;
            if clients.is_empty() {
                error!("no exchange is reachable, refusing to start");
                std::process::exit(1);
            }
            let engine = Arc::new(UpdateEngine::new(
                clients,
                config.clone(),
                cycles,
                accumulations,
            ));

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping scheduler");
                    let _ = tx.send(true);
                }
            });

            let scheduler = Scheduler::new(engine, config, rx);
            scheduler.load_or_bootstrap().await?;
            scheduler.run().await;
        }
        Commands::Update { exchange } => {
            let filter = exchange.as_deref().map(parse_exchange).transpose()?;
            let engine = Arc::new(UpdateEngine::new(
                clients,
                config.clone(),
                cycles,
                accumulations,
            ));
            let summary = Arc::clone(&engine)
                .run_pass(filter, StrategyOverrides::default())
                .await;
            println!(
                "processed {} cycles: {} advanced, {} failed, {} panicked",
                summary.processed, summary.advanced, summary.failed, summary.panicked
            );
        }
        Commands::New { exchange } => {
            let exchange = parse_exchange(&exchange)?;
            let client = clients.get(&exchange).cloned().ok_or_else(|| {
                CyclerError::Validation(format!("exchange '{exchange}' is not enabled"))
            })?;
            let settings = config.exchanges.get(exchange);
            let id = create_cycle(
                client.as_ref(),
                settings,
                &StrategyOverrides::default(),
                &cycles,
            )
            .await?;
            println!("cycle {id} created on {exchange}");
        }
        Commands::Cancel { id, force } => {
            let cycle = cycles.find_by_id_int(id).await.ok_or_else(|| {
                CyclerError::Validation(format!("no cycle with id {id}"))
            })?;
            let client = clients.get(&cycle.exchange).cloned().ok_or_else(|| {
                CyclerError::Validation(format!(
                    "exchange '{}' is not enabled; enable it or use --force",
                    cycle.exchange
                ))
            })?;
            match cancel_cycle(client.as_ref(), &cycles, &cycle, force).await {
                Ok(()) => println!("cycle {id} cancelled and removed"),
                Err(e) => {
                    eprintln!("cancel failed: {e}");
                    eprintln!("re-run with --force to delete the local record anyway");
                    std::process::exit(1);
                }
            }
        }
        Commands::Cycles { offset, limit } => {
            let page = cycles.page(offset, limit).await;
            if page.is_empty() {
                println!("no cycles");
            }
            for c in page {
                println!(
                    "#{:<5} {:<8} {:<10} qty={} buy={} sell={} gain={} fees={}",
                    c.id_int,
                    c.exchange,
                    c.status,
                    c.quantity,
                    c.buy_price,
                    c.sell_price,
                    c.exact_exchange_gain,
                    c.total_fees,
                );
            }
        }
        Commands::Accumulations { offset, limit } => {
            let page = accumulations.page(offset, limit).await;
            if page.is_empty() {
                println!("no accumulations");
            }
            for a in page {
                println!(
                    "#{:<5} {:<8} cycle={} qty={} target={} cancel={} deviation={}%",
                    a.id_int,
                    a.exchange,
                    a.cycle_id_int,
                    a.quantity,
                    a.target_sell_price,
                    a.cancel_price,
                    a.deviation,
                );
            }
        }
        Commands::Check => {
            for exchange in Exchange::ALL {
                let Some(client) = clients.get(&exchange) else {
                    println!("{exchange:<8} disabled");
                    continue;
                };
                match client.check_connection().await {
                    Ok(()) => println!("{exchange:<8} ok"),
                    Err(e) => println!("{exchange:<8} FAILED: {e}"),
                }
            }
        }
    }

    Ok(())
}

/// Probe every client; keep only the reachable subset for the
/// scheduler. A venue being down must not keep the others from
/// trading.
async fn probe_clients(clients: ClientTable) -> ClientTable {
    let mut reachable = ClientTable::new();
    for (exchange, client) in clients {
        match client.check_connection().await {
            Ok(()) => {
                info!(%exchange, "connection ok");
                reachable.insert(exchange, client);
            }
            Err(e) => {
                warn!(%exchange, error = %e, "connection failed, excluding from this run");
            }
        }
    }
    reachable
}

fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if let Some(dir) = &config.dir {
        let appender = tracing_appender::rolling::daily(dir, "cycler.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if config.json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        Some(guard)
    } else {
        if config.json {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        None
    }
}
