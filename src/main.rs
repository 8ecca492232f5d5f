//! WSPR Aggregator - merge WSPR spots from several receivers and report them once.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wspr_aggregator::{
    aggregator::{Aggregator, BatchSink},
    config::{Config, StatsConfig},
    metrics::{StatusState, start_status_server},
    mqtt::{MqttSubscriber, TopicRouter},
    persistence::{PersistedState, Persister},
    pskreporter::{PskReporter, PskReporterSettings, receiver_info},
    stats::StatsTracker,
    wsprnet::{DRAIN_TIMEOUT, WsprNetSettings, WsprNetStats, WsprNetSubmitter},
};

/// WSPR Aggregator - deduplicate WSPR spots from multiple receivers over MQTT
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "WSPR_AGG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Do not submit to WSPRNet or PSKReporter
    #[arg(long)]
    dry_run: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    if args.check_config {
        println!(
            "Configuration OK: {} at {}, {} instances",
            config.receiver.callsign,
            config.receiver.locator,
            config.mqtt.instances.len()
        );
        return Ok(());
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("WSPR aggregator starting...");
    info!(
        "Receiver: {} at {}",
        config.receiver.callsign, config.receiver.locator
    );
    info!("Broker: {}", config.mqtt.broker);
    if config.dry_run {
        warn!("Dry run: nothing will be submitted");
    }

    // Shared statistics, restored from the last snapshot
    let stats = Arc::new(StatsTracker::new(&config.receiver.locator));
    let persister = Arc::new(Persister::new(&config.persistence_file));
    let mut wsprnet_seed = WsprNetStats::default();
    if let Some(state) = persister.load() {
        wsprnet_seed = state.wsprnet_stats;
        stats.restore(state.stats);
    }
    stats.register_instances(config.mqtt.instances.iter().map(|i| i.name.as_str()));

    // Submitters
    let mut sinks: Vec<Arc<dyn BatchSink>> = Vec::new();

    let wsprnet = if config.wsprnet.enabled {
        let submitter = Arc::new(WsprNetSubmitter::start(
            WsprNetSettings::from_config(&config.wsprnet, config.dry_run),
            config.receiver.clone(),
            wsprnet_seed,
        )?);
        sinks.push(submitter.clone());
        Some(submitter)
    } else {
        info!("WSPRNet submission disabled");
        None
    };

    let pskreporter = if config.pskreporter.enabled {
        let psk = Arc::new(
            PskReporter::start(
                PskReporterSettings::from_config(&config.pskreporter, config.dry_run),
                receiver_info(&config.receiver, &config.pskreporter.antenna),
            )
            .await?,
        );
        sinks.push(psk.clone());
        Some(psk)
    } else {
        info!("PSKReporter disabled");
        None
    };

    // Aggregator
    let aggregator = Aggregator::new(
        Duration::from_secs(config.aggregator.grace_secs),
        Arc::clone(&stats),
        sinks,
    );
    let (ingest, aggregator_handle, aggregator_task) = aggregator.spawn(config.aggregator.queue_size);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // MQTT; the first connection must succeed
    let router = TopicRouter::new(&config.mqtt, ingest, Arc::clone(&stats));
    let subscriber = MqttSubscriber::new(&config.mqtt, router)?;
    let mqtt_task = match subscriber.start(shutdown_rx.clone()).await {
        Ok(task) => task,
        Err(e) => {
            error!("Failed to connect to MQTT broker {}: {}", config.mqtt.broker, e);
            return Err(e).context("MQTT connection failed");
        }
    };
    for instance in &config.mqtt.instances {
        info!("Instance {} on {}", instance.name, instance.spot_topic());
    }

    // Stats timers
    let timers = tokio::spawn(run_stats_timers(
        Arc::clone(&stats),
        Arc::clone(&persister),
        wsprnet.clone(),
        wsprnet_seed,
        config.stats.clone(),
        shutdown_rx.clone(),
    ));

    // Status server
    if config.web_port > 0 {
        let state = StatusState {
            stats: Arc::clone(&stats),
            aggregator: aggregator_handle,
            wsprnet: wsprnet.clone(),
            pskreporter: pskreporter.clone(),
            persister: Arc::clone(&persister),
        };
        let port = config.web_port;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_status_server(port, state, shutdown).await {
                error!("Status server failed: {}", e);
            }
        });
    }

    wait_for_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Stop in dataflow order: MQTT, aggregator flush, submitters, stats
    let _ = mqtt_task.await;
    let _ = aggregator_task.await;
    if let Some(ref w) = wsprnet {
        w.shutdown(DRAIN_TIMEOUT).await;
    }
    if let Some(ref p) = pskreporter {
        p.shutdown(DRAIN_TIMEOUT).await;
    }
    let _ = timers.await;

    save_snapshot(&stats, &persister, wsprnet.as_deref(), wsprnet_seed).await;

    // Print final statistics
    println!("\n\nFINAL STATISTICS");
    println!("{}", stats.summary());

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Build the document written to the snapshot file.
fn persisted_state(
    stats: &StatsTracker,
    wsprnet: Option<&WsprNetSubmitter>,
    wsprnet_seed: WsprNetStats,
) -> PersistedState {
    PersistedState {
        saved_at: Utc::now(),
        stats: stats.snapshot(),
        wsprnet_stats: wsprnet.map(|w| w.stats()).unwrap_or(wsprnet_seed),
    }
}

async fn save_snapshot(
    stats: &StatsTracker,
    persister: &Arc<Persister>,
    wsprnet: Option<&WsprNetSubmitter>,
    wsprnet_seed: WsprNetStats,
) {
    let state = persisted_state(stats, wsprnet, wsprnet_seed);
    let persister = Arc::clone(persister);
    // Errors are counted and logged by the persister
    let _ = tokio::task::spawn_blocking(move || persister.save(&state)).await;
}

/// Periodic snapshot, retention pruning and console summary.
async fn run_stats_timers(
    stats: Arc<StatsTracker>,
    persister: Arc<Persister>,
    wsprnet: Option<Arc<WsprNetSubmitter>>,
    wsprnet_seed: WsprNetStats,
    config: StatsConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let every = |secs: u64| {
        let period = Duration::from_secs(secs.max(1));
        interval_at(Instant::now() + period, period)
    };
    let mut save = every(config.save_interval_secs);
    let mut prune = every(config.prune_interval_secs);
    let mut summary = every(config.summary_interval_secs);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = save.tick() => {
                save_snapshot(&stats, &persister, wsprnet.as_deref(), wsprnet_seed).await;
            }
            _ = prune.tick() => {
                stats.prune(Utc::now());
            }
            _ = summary.tick(), if config.summary_interval_secs > 0 => {
                info!("\n{}", stats.summary());
            }
        }
    }
}
