use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use payrecon::application::checkout::{CallbackParams, CheckoutService, cancel_order};
use payrecon::application::router::SyncRouter;
use payrecon::application::scheduler::{
    CronJob, OrdersCron, PaymentsCron, RetryCron, Scheduled, Scheduler,
};
use payrecon::application::synchronizer::{Dispatch, OrderSynchronizer};
use payrecon::config::ReconConfig;
use payrecon::domain::order::OrderId;
use payrecon::domain::ports::{SharedClock, SharedOrderStore, SharedProvider};
use payrecon::error::ReconError;
use payrecon::infrastructure::clock::SystemClock;
use payrecon::infrastructure::http::HttpProvider;
use payrecon::infrastructure::in_memory::InMemoryOrderStore;
use payrecon::interfaces::csv::order_reader::OrderReader;
use payrecon::interfaces::csv::report_writer::ReportWriter;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Orders CSV file loaded into the store before the command runs
    #[arg(long, global = true)]
    orders: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pass of a polling loop
    Tick {
        #[arg(value_enum)]
        job: Job,
    },
    /// Run all polling loops until interrupted
    Run,
    /// Print the sync state of every order as CSV
    Report,
    /// Open a hosted checkout session and print its URL
    Checkout { id: String },
    /// Handle the hosted checkout's success redirect and print whether it was accepted
    Callback {
        /// Order id of the caller's checkout session
        session_id: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        hmac_alg: String,
        /// Base64 encoded, as received on the redirect
        #[arg(long)]
        hmac_input: String,
        #[arg(long)]
        hmac_key_id: String,
        #[arg(long)]
        hmac_value: String,
    },
    /// Cancel an order on behalf of the customer
    Cancel { id: String },
    /// Clear the hard error of an order so the loops pick it up again
    Unblock { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Job {
    Orders,
    Payments,
    Retry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ReconConfig::from_file(path).into_diagnostic()?,
        None => ReconConfig::default(),
    };
    config.apply_env();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let store = open_store(cli.db_path.as_deref()).into_diagnostic()?;
    if let Some(path) = &cli.orders {
        seed_orders(&store, path).await.into_diagnostic()?;
    }
    let clock: SharedClock = Arc::new(SystemClock);

    match cli.command {
        Command::Report => {
            let orders = store.all_orders().await.into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = ReportWriter::new(stdout.lock());
            writer.write_orders(&orders).into_diagnostic()?;
        }
        Command::Cancel { id } => {
            cancel_order(&store, clock.as_ref(), &OrderId::new(id))
                .await
                .into_diagnostic()?;
        }
        Command::Unblock { id } => {
            let id = OrderId::new(id);
            let mut order = store
                .get(&id)
                .await
                .into_diagnostic()?
                .ok_or(ReconError::OrderNotFound(id.clone()))
                .into_diagnostic()?;
            if order.sync.clear_hard_error() {
                store.persist(&mut order).await.into_diagnostic()?;
                info!(order_id = %id, "Hard error cleared");
            }
        }
        Command::Checkout { id } => {
            let checkout = checkout_service(&config, store, clock).into_diagnostic()?;
            let url = checkout
                .start_checkout(&OrderId::new(id))
                .await
                .into_diagnostic()?;
            println!("{}", url);
        }
        Command::Callback {
            session_id,
            id,
            hmac_alg,
            hmac_input,
            hmac_key_id,
            hmac_value,
        } => {
            let checkout = checkout_service(&config, store, clock).into_diagnostic()?;
            let params = CallbackParams {
                id: OrderId::new(id),
                hmac_alg,
                hmac_input,
                hmac_key_id,
                hmac_value,
            };
            let accepted = checkout
                .handle_success_callback(&OrderId::new(session_id), params)
                .await
                .into_diagnostic()?;
            println!("{}", if accepted { "accepted" } else { "rejected" });
        }
        Command::Tick { job } => {
            let provider = http_provider(&config).into_diagnostic()?;
            let sync = OrderSynchronizer::new(
                store.clone(),
                provider.clone(),
                clock.clone(),
                config.sync.settings(),
            );
            let router = Arc::new(SyncRouter::spawn(
                sync,
                config.schedule.shards,
                config.schedule.queue_capacity,
            ));
            let dispatcher: Arc<dyn Dispatch> = router.clone();
            let cron: Arc<dyn CronJob> = match job {
                Job::Orders => Arc::new(OrdersCron::new(store, dispatcher, clock)),
                Job::Payments => Arc::new(PaymentsCron::new(store, provider, dispatcher)),
                Job::Retry => Arc::new(RetryCron::new(store, dispatcher)),
            };
            let result = cron.run_once().await;
            drop(cron);
            stop_router(router).await;

            let report = result.into_diagnostic()?;
            info!(
                dispatched = report.dispatched,
                changed = report.changed,
                errors = report.errors,
                "Tick finished"
            );
        }
        Command::Run => {
            let provider = http_provider(&config).into_diagnostic()?;
            let sync = OrderSynchronizer::new(
                store.clone(),
                provider.clone(),
                clock.clone(),
                config.sync.settings(),
            );
            let router = Arc::new(SyncRouter::spawn(
                sync,
                config.schedule.shards,
                config.schedule.queue_capacity,
            ));
            let dispatcher: Arc<dyn Dispatch> = router.clone();
            let schedule = &config.schedule;
            let scheduler = Scheduler::new(vec![
                Scheduled {
                    job: Arc::new(OrdersCron::new(store.clone(), dispatcher.clone(), clock)),
                    every: Duration::from_secs(schedule.orders_interval_secs),
                },
                Scheduled {
                    job: Arc::new(PaymentsCron::new(store.clone(), provider, dispatcher.clone())),
                    every: Duration::from_secs(schedule.payments_interval_secs),
                },
                Scheduled {
                    job: Arc::new(RetryCron::new(store, dispatcher.clone())),
                    every: Duration::from_secs(schedule.retry_interval_secs),
                },
            ]);
            drop(dispatcher);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });

            info!("payrecon v{} running", env!("CARGO_PKG_VERSION"));
            let result = scheduler.run(shutdown_rx).await;
            drop(scheduler);
            stop_router(router).await;
            result.into_diagnostic()?;
        }
    }

    Ok(())
}

fn open_store(db_path: Option<&Path>) -> payrecon::error::Result<SharedOrderStore> {
    match db_path {
        Some(path) => open_persistent(path),
        None => Ok(Arc::new(InMemoryOrderStore::new())),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_persistent(path: &Path) -> payrecon::error::Result<SharedOrderStore> {
    let store = payrecon::infrastructure::rocksdb::RocksDBStore::open(path)?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_persistent(_path: &Path) -> payrecon::error::Result<SharedOrderStore> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(Arc::new(InMemoryOrderStore::new()))
}

/// Inserts orders the store does not know yet.
async fn seed_orders(store: &SharedOrderStore, path: &Path) -> payrecon::error::Result<()> {
    let file = File::open(path)?;
    for order in OrderReader::new(file).orders() {
        match order {
            Ok(order) => {
                if store.get(&order.id).await?.is_none() {
                    store.insert(order).await?;
                }
            }
            Err(e) => {
                eprintln!("Error reading order: {}", e);
            }
        }
    }
    Ok(())
}

fn http_provider(config: &ReconConfig) -> payrecon::error::Result<SharedProvider> {
    let provider = HttpProvider::new(
        config.provider.base_url.clone(),
        config.api_key()?,
        Duration::from_secs(config.provider.timeout_secs),
    )?;
    Ok(Arc::new(provider))
}

fn checkout_service(
    config: &ReconConfig,
    store: SharedOrderStore,
    clock: SharedClock,
) -> payrecon::error::Result<CheckoutService> {
    Ok(CheckoutService::new(
        store,
        http_provider(config)?,
        clock,
        config.checkout.success_url.clone(),
        config.checkout.cancel_url.clone(),
    ))
}

async fn stop_router(router: Arc<SyncRouter>) {
    match Arc::try_unwrap(router) {
        Ok(router) => {
            if let Err(e) = router.shutdown().await {
                error!("Router shutdown failed: {}", e);
            }
        }
        Err(_) => error!("Router still referenced at shutdown"),
    }
}
