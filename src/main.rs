use clap::Parser;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio::sync::watch;

use rightsizer::capability::CapabilityDetector;
use rightsizer::cli::Cli;
use rightsizer::config::{ClusterIdentity, ConfigStore};
use rightsizer::executor::{InPlaceResizeExecutor, KubeResizeOps};
use rightsizer::gate::DecisionGate;
use rightsizer::policy::PolicyResolver;
use rightsizer::provider::MetricsServerProvider;
use rightsizer::scheduler::{KubeInstanceLister, ReconcileScheduler};
use rightsizer::store::TimeSeriesStore;
use rightsizer::telemetry::{self, EventEmitter};

/// Samples retained per container.
const STORE_MAX_SAMPLES: usize = 2880;
/// Oldest history the store keeps.
const STORE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
/// How often capabilities are re-probed.
const CAPABILITY_REFRESH: Duration = Duration::from_secs(3600);
/// Grace period for in-flight work on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run() -> rightsizer::Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    // Identity labels are read once and never recomputed.
    let identity = ClusterIdentity::from_env();
    telemetry::init(&identity);
    log::info!(
        "rightsizer {} starting (cluster {} / {})",
        rightsizer::VERSION,
        identity.cluster_name,
        identity.environment
    );

    let config = Arc::new(ConfigStore::load(cli.config.as_deref())?);

    // Exit non-zero when the client cannot be constructed.
    let client = Client::try_default().await?;

    let capabilities = Arc::new(CapabilityDetector::new());
    match capabilities.probe(&client).await {
        Ok(caps) => {
            log::info!(
                "capabilities: in_place_resize={}, metrics_api={}",
                caps.in_place_resize,
                caps.metrics_api
            );
        }
        Err(e) if cli.strict => return Err(e),
        Err(e) => log::warn!("capability probe failed; running degraded: {e}"),
    }

    let snapshot = config.snapshot();
    let resolver = Arc::new(PolicyResolver::new(
        snapshot.policies.clone(),
        snapshot.default_strategy,
        snapshot.default_constraints,
        snapshot.default_mode,
        snapshot.generation,
    ));
    let store = Arc::new(TimeSeriesStore::new(STORE_MAX_SAMPLES, STORE_MAX_AGE));
    let provider = Arc::new(MetricsServerProvider::new(client.clone()));
    let gate = Arc::new(DecisionGate::new());
    let executor = Arc::new(InPlaceResizeExecutor::new(KubeResizeOps::new(
        client.clone(),
    )));
    let emitter = Arc::new(if cli.dry_run {
        EventEmitter::disconnected()
    } else {
        EventEmitter::new(client.clone())
    });

    let scheduler = ReconcileScheduler::new(
        KubeInstanceLister::new(client.clone()),
        provider,
        store,
        resolver,
        gate,
        executor,
        capabilities.clone(),
        config.clone(),
        emitter,
        cli.dry_run,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresh_handle = tokio::spawn(capabilities.clone().run_refresh(
        client.clone(),
        CAPABILITY_REFRESH,
        shutdown_rx.clone(),
    ));

    // SIGHUP re-reads the declarative config; a bad file keeps the previous
    // good snapshot.
    let reload_config = config.clone();
    let mut reload_shutdown = shutdown_rx.clone();
    let reload_handle = tokio::spawn(async move {
        let Ok(mut hangup) = signal::unix::signal(signal::unix::SignalKind::hangup()) else {
            return;
        };
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    if let Err(e) = reload_config.reload() {
                        log::error!("config reload rejected; keeping previous config: {e}");
                    }
                }
                _ = reload_shutdown.changed() => {
                    if *reload_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    wait_for_termination().await;
    log::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Bounded grace: in-flight patches either finish or are abandoned safely
    // (the executor is idempotent and two-phase).
    if tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle)
        .await
        .is_err()
    {
        log::warn!("scheduler did not stop within the grace period");
    }
    refresh_handle.abort();
    reload_handle.abort();

    log::info!("rightsizer stopped");
    Ok(())
}

async fn wait_for_termination() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            let _ = signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = signal::ctrl_c() => {}
    }
}
