//! # Clinic Bridge Main Entry Point
//!
//! Wires configuration, the source reader, the CRM client, the retry-queue
//! store, and the scheduler together, and maps fatal errors onto exit
//! codes: 0 clean shutdown, 1 configuration error, 2 corrupt persistent
//! state.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use clinic_bridge::clock::{Clock, SystemClock};
use clinic_bridge::config::{AppConfig, ConfigLoader};
use clinic_bridge::crm::CrmClient;
use clinic_bridge::db::PoolSettings;
use clinic_bridge::error::BridgeError;
use clinic_bridge::logging;
use clinic_bridge::plans::{PlanCache, PlanProjector};
use clinic_bridge::queue::{RetryQueue, WatermarkStore};
use clinic_bridge::reconcile::Reconciler;
use clinic_bridge::scheduler::Scheduler;
use clinic_bridge::source::{SourceReader, SqlSourceReader};

#[derive(Parser)]
#[command(name = "clinic-bridge")]
#[command(about = "One-way bridge from the clinic appointment database into the CRM")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic synchronization loop (default).
    Run,
    /// Probe the source database and the CRM, then exit.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader::new().load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };
    logging::init_subscriber(&config.logging);

    let command = cli.command.unwrap_or(Commands::Run);
    let result = match command {
        Commands::Run => run(config).await,
        Commands::Check => check(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, kind = err.kind(), "fatal error");
            ExitCode::from(err.exit_code())
        }
    }
}

fn build_reader(config: &AppConfig) -> Arc<SqlSourceReader> {
    Arc::new(SqlSourceReader::new(
        config.source.url(),
        PoolSettings {
            max_connections: 3,
            acquire_timeout: std::time::Duration::from_secs(
                config.source.connection_timeout_secs,
            ),
        },
    ))
}

async fn run(config: Arc<AppConfig>) -> Result<(), BridgeError> {
    info!(filial_id = config.sync.filial_id, "starting clinic bridge");

    let reader = build_reader(&config);
    let crm = Arc::new(CrmClient::new(&config.crm)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Unreadable queue store or watermark is fatal here (exit code 2); a
    // merely unreachable source or CRM is not.
    let queue = RetryQueue::open(
        &config.queue.store_path,
        config.queue.max_retry_attempts,
        config.queue.max_queue_size,
        config.crm.retry_delays(),
    )
    .await?;
    let watermark = WatermarkStore::new(
        config
            .queue
            .store_path
            .parent()
            .map(|dir| dir.join("watermark"))
            .unwrap_or_else(|| "watermark".into()),
    );
    watermark.load()?;

    let cache = PlanCache::load(config.plans.cache_path.clone(), config.plans.max_cache_entries);
    let projector = PlanProjector::new(
        reader.clone(),
        crm.clone(),
        clock.clone(),
        cache,
        config.plans.throttle_minutes,
    );

    let reconciler = Reconciler::new(
        crm.clone(),
        config.stages.clone(),
        config.crm.lead_final_statuses.clone(),
    );

    let scheduler = Scheduler::new(
        config.clone(),
        reader,
        crm,
        reconciler,
        queue,
        watermark,
        projector,
        clock,
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    scheduler.run(shutdown).await
}

async fn check(config: Arc<AppConfig>) -> Result<(), BridgeError> {
    let reader = build_reader(&config);
    let crm = Arc::new(CrmClient::new(&config.crm)?);

    let source_ok = reader.ping().await;
    let crm_ok = crm.ping().await;
    info!(source_ok, crm_ok, "connectivity check");
    println!("source: {}", if source_ok { "ok" } else { "unreachable" });
    println!("crm:    {}", if crm_ok { "ok" } else { "unreachable" });

    if !source_ok {
        return Err(BridgeError::SourceUnavailable(
            "liveness probe failed".to_string(),
        ));
    }
    if !crm_ok {
        return Err(BridgeError::CrmTransient("liveness probe failed".to_string()));
    }
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = %err, "cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}
