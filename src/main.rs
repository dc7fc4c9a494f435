use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tsugi::config::Config;
use tsugi::fetch::HttpSourceFetcher;
use tsugi::models::Schedule;
use tsugi::notify::{Notifier, NullNotifier, WebhookNotifier};
use tsugi::orchestrator::JobOrchestrator;
use tsugi::store::{ConnectionSupervisor, ContentStore, PostgresStore};

#[derive(Parser)]
#[command(
    name = "tsugi",
    version,
    about = "Adaptive release tracker for serialized works",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker until interrupted
    Run,

    /// Execute a single check cycle and exit
    Once,

    /// Apply the database schema
    InitDb,

    /// Register an item for tracking
    Add {
        /// Source-assigned identifier of the item
        external_id: String,

        /// Human-readable name
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("invalid configuration")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tsugi starting");

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Once => once(config).await?,
        Commands::InitDb => init_db(config).await?,
        Commands::Add { external_id, name } => add(config, external_id, name).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("tsugi=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("tsugi=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn build_store(config: &Config) -> Result<(Arc<PostgresStore>, Arc<ConnectionSupervisor>)> {
    let supervisor = Arc::new(
        ConnectionSupervisor::new(config.database.clone())
            .context("failed to set up database pool")?,
    );
    let store = Arc::new(PostgresStore::new(Arc::clone(&supervisor)));
    Ok((store, supervisor))
}

fn build_orchestrator(config: &Config, store: Arc<PostgresStore>) -> Result<JobOrchestrator> {
    let fetcher =
        Arc::new(HttpSourceFetcher::new(&config.source).context("failed to create fetcher")?);

    let notifier: Arc<dyn Notifier> = match WebhookNotifier::new(&config.notifier)? {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(NullNotifier),
    };

    Ok(JobOrchestrator::new(
        config.orchestrator.clone(),
        fetcher,
        store,
        notifier,
    ))
}

async fn run(config: Config) -> Result<()> {
    let (store, supervisor) = build_store(&config)?;
    let orchestrator = build_orchestrator(&config, store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = orchestrator.run(shutdown_rx).await;

    // Release the pool whether the loop ended cleanly or gave up
    supervisor.close().await;
    result.context("orchestrator gave up after repeated infrastructure failures")?;

    tracing::info!("tsugi stopped");
    Ok(())
}

async fn once(config: Config) -> Result<()> {
    let (store, supervisor) = build_store(&config)?;
    let orchestrator = build_orchestrator(&config, store)?;

    let result = orchestrator.run_once().await;
    supervisor.close().await;
    let stats = result?;

    println!(
        "Checked {} items: {} new, {} failed, {} skipped",
        stats.items_checked, stats.new_units, stats.failed, stats.skipped
    );
    Ok(())
}

async fn init_db(config: Config) -> Result<()> {
    let (store, supervisor) = build_store(&config)?;
    let result = store.init_schema().await;
    supervisor.close().await;
    result.context("schema setup failed")?;
    println!("Schema applied");
    Ok(())
}

async fn add(config: Config, external_id: String, name: Option<String>) -> Result<()> {
    let (store, supervisor) = build_store(&config)?;
    let name = name.unwrap_or_else(|| external_id.clone());

    let result = async {
        let item_id = store
            .register_item(&external_id, &name)
            .await
            .context("failed to register item")?;

        // Due immediately; the first check fills in the real schedule
        let schedule = Schedule::bootstrap(item_id, chrono::Utc::now());
        store
            .upsert_schedule(&schedule)
            .await
            .context("failed to create schedule")?;
        Ok::<i64, anyhow::Error>(item_id)
    }
    .await;

    supervisor.close().await;
    let item_id = result?;

    println!("Tracking '{name}' ({external_id}) as item {item_id}");
    Ok(())
}
