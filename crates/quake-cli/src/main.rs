use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quake_storage::{EventStore, MemoryEventStore, PgEventStore};
use quake_sync::{StoreKind, SyncConfig, SyncScheduler, Syncer};
use quake_web::{AppState, QueryService};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quake-cli")]
#[command(about = "Earthquake feed sync and query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run setup, the periodic sync cycle and the HTTP API.
    Serve,
    /// Run setup plus one sync cycle, print the report, then exit.
    Sync,
    /// Create the database, table and geo index, then load the feed once.
    Setup,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// The concrete Postgres store is kept alongside the trait object so its
/// pool can be closed on exit.
fn build_store(config: &SyncConfig) -> (Arc<dyn EventStore>, Option<Arc<PgEventStore>>) {
    match config.store_kind {
        StoreKind::Postgres => {
            let pg = Arc::new(PgEventStore::new(&config.database));
            let store: Arc<dyn EventStore> = pg.clone();
            (store, Some(pg))
        }
        StoreKind::Memory => {
            warn!("using in-memory store; data is lost on exit");
            (Arc::new(MemoryEventStore::new()), None)
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn serve(config: &SyncConfig, store: Arc<dyn EventStore>, syncer: Arc<Syncer>) -> Result<()> {
    let port = quake_web::web_port_from_env();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding HTTP listener on port {port}"))?;

    let setup = syncer.clone();
    tokio::spawn(async move {
        // failures are logged by the syncer; the API keeps serving what is stored
        let _ = setup.initial_setup().await;
    });

    let scheduler = match SyncScheduler::start(syncer.clone(), config.refresh_interval).await {
        Ok(scheduler) => Some(scheduler),
        Err(err) => {
            error!(error = %err, "sync scheduler failed to start; serving without periodic sync");
            None
        }
    };

    let queries = QueryService::new(store, config.table.clone())
        .with_timeout(quake_web::query_timeout_from_env());
    quake_web::serve(listener, AppState::new(queries, Some(syncer)), shutdown_signal()).await?;

    if let Some(scheduler) = scheduler {
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "sync scheduler did not shut down cleanly");
        }
    }
    Ok(())
}

async fn sync_once(syncer: &Syncer) -> Result<()> {
    let setup = syncer.initial_setup().await?;
    println!(
        "setup complete: fetched={} inserted={} replaced={} skipped={}",
        setup.refresh.fetched, setup.refresh.inserted, setup.refresh.replaced, setup.refresh.skipped
    );

    let report = syncer
        .run_cycle(chrono::Utc::now())
        .await
        .context("a sync cycle is already running")?;
    let refresh = report.refresh.clone().unwrap_or_default();
    println!(
        "sync complete: run_id={} inserted={} replaced={} skipped={} expired={} errors={}",
        report.run_id,
        refresh.inserted,
        refresh.replaced,
        refresh.skipped,
        report.expired.unwrap_or(0),
        report.errors.len()
    );
    if !report.is_success() {
        anyhow::bail!("sync cycle failed: {}", report.errors.join("; "));
    }
    Ok(())
}

async fn setup(syncer: &Syncer) -> Result<()> {
    let report = syncer.initial_setup().await?;
    println!(
        "setup complete: database={:?} table={:?} geo_index={:?} inserted={}",
        report.database, report.table, report.geo_index, report.refresh.inserted
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::from_env();
    let (store, pg) = build_store(&config);
    let feed = config.build_feed().context("building feed client")?;
    info!(table = %config.table, "configured sync");
    let syncer = Arc::new(Syncer::new(store.clone(), feed, config.settings()));

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, store, syncer).await,
        Commands::Sync => sync_once(&syncer).await,
        Commands::Setup => setup(&syncer).await,
    };

    if let Some(pg) = pg {
        pg.close().await;
    }
    result
}
