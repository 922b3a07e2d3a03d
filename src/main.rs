#![allow(dead_code)]

mod actions;
mod client;
mod config;
mod error;
mod history;
mod refresher;
mod state;
mod stats;

use crate::actions::{Action, Actions};
use crate::client::NodeClient;
use crate::config::Config;
use crate::refresher::Refresher;
use crate::state::{NodeSnapshot, PaymentState};
use crate::stats::NodeStats;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

/// Backoff before retrying after a failed cycle.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "lnd-advisor",
    about = "Advises an LND routing node on balance targets and fee rates"
)]
struct Cli {
    /// Path to lnd-advisor.toml config file
    #[arg(short, long, default_value = "lnd-advisor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the node and emit recommendations continuously (default)
    Daemon,
    /// Evaluate a single snapshot and exit
    RunOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("lnd-advisor v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let client = Arc::new(client::LndRestClient::new(&config)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(config, client).await,
        Commands::RunOnce => run_once(config, client).await,
    }
}

async fn run_daemon(
    config: Arc<Config>,
    client: Arc<client::LndRestClient>,
) -> anyhow::Result<()> {
    info!("Verifying node connectivity...");
    match client.get_identity().await {
        Ok(identity) => {
            info!(
                "Connected to node {} ({})",
                identity.public_key,
                identity.alias.as_deref().unwrap_or("no alias"),
            );
        }
        Err(e) => {
            error!("Cannot reach lnd: {:#}. Aborting.", e);
            return Err(e);
        }
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, finishing current cycle...");
        let _ = shutdown_tx.send(true);
    });

    // A failed cycle flips this flag so the next poll comes quickly.
    let cycle_failed = Arc::new(AtomicBool::new(false));

    let refresh_config = config.clone();
    let refresh_client = client.clone();
    let refresh_failed = cycle_failed.clone();
    let (refresher, _refresh_task) = Refresher::spawn(
        Duration::from_secs(config.general.refresh_delay_secs),
        move || {
            let config = refresh_config.clone();
            let client = refresh_client.clone();
            let failed = refresh_failed.clone();
            async move {
                match run_cycle(&config, &*client).await {
                    Ok(()) => failed.store(false, Ordering::SeqCst),
                    Err(e) => {
                        error!("Cycle error: {:#}", e);
                        failed.store(true, Ordering::SeqCst);
                    }
                }
                Ok(())
            }
        },
    );

    // Any change source can feed `notify`; polling the node on an interval
    // is the lowest common denominator.
    let interval = Duration::from_secs(config.general.loop_interval_secs);
    info!(
        "Entering main loop (poll interval: {}s, refresh delay: {}s)",
        config.general.loop_interval_secs, config.general.refresh_delay_secs,
    );

    refresher.notify();
    loop {
        let wait = if cycle_failed.load(Ordering::SeqCst) {
            RETRY_BACKOFF
        } else {
            interval
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => refresher.notify(),
            _ = shutdown_rx.changed() => {
                info!("Shutting down gracefully");
                break;
            }
        }
    }

    Ok(())
}

async fn run_once(config: Arc<Config>, client: Arc<client::LndRestClient>) -> anyhow::Result<()> {
    info!("Evaluating a single snapshot...");
    run_cycle(&config, &*client).await?;
    info!("Done");
    Ok(())
}

/// One full cycle: snapshot, statistics, recommendations, housekeeping.
pub async fn run_cycle(
    config: &Config,
    client: &(impl NodeClient + Sync),
) -> anyhow::Result<()> {
    let recommendations = compute_actions(config, client).await?;

    if recommendations.is_empty() {
        info!("No recommendations; the node looks healthy");
    }
    for action in &recommendations {
        let subject = action.id.as_deref().unwrap_or("node");
        info!(
            "{} {:?}: {} -> {} (priority {}) {}",
            subject, action.variable, action.actual, action.target, action.priority, action.reason,
        );
        println!("{}", serde_json::to_string(action)?);
    }

    if let Err(e) = delete_stale_failed_payments(config, client).await {
        warn!("Housekeeping failed: {:#}", e);
    }

    Ok(())
}

/// Snapshot the node and derive the ordered action stream.
pub async fn compute_actions(
    config: &Config,
    client: &(impl NodeClient + Sync),
) -> anyhow::Result<Vec<Action>> {
    let snapshot = NodeSnapshot::collect(client, config.general.days).await?;
    info!(
        "Node holds {} of {} sat across {} channels",
        snapshot.total_local_balance(),
        snapshot.total_capacity(),
        snapshot.channels.len(),
    );
    let stats = NodeStats::build(&snapshot)?;
    let engine = Actions::new(&config.actions, &stats)?;
    Ok(engine.get(Utc::now())?)
}

/// Failed payments older than the window only cost lookup time on every
/// refresh; drop them from the node's payment database.
async fn delete_stale_failed_payments(
    config: &Config,
    client: &(impl NodeClient + Sync),
) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(config.general.days));
    let payments = client
        .get_payments(DateTime::<Utc>::UNIX_EPOCH, cutoff)
        .await?;

    let mut deleted = 0usize;
    for payment in payments.iter().filter(|p| p.state == PaymentState::Failed) {
        client.delete_payment(&payment.id).await?;
        deleted += 1;
    }
    if deleted > 0 {
        info!("Housekeeping: deleted {} stale failed payments", deleted);
    }
    Ok(())
}
