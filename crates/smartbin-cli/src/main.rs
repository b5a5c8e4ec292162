//! CLI entry point for the smart bin.
//!
//! `smartbin run` starts the driver fleet and the sample publisher,
//! `smartbin journal` lists samples still waiting for upload and
//! `smartbin check-config` prints the effective configuration.

mod config;
mod sim;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smartbin_kernel::{Driver, FleetBus, FleetEvent, Stamped, Supervisor};
use smartbin_publisher::{
    AsyncPublisher, Envelope, EnvelopeQueue, HttpTransport, Journal, Origin, SecretStore,
    SidecarTranscript, SmtpAlerter,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{DEFAULT_CONFIG_PATH, DeviceConfig};
use crate::sim::{SimLid, SimScale, StatusLight, keys};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Smart bin sensor fleet.
#[derive(Parser)]
#[command(
    name = "smartbin",
    version,
    about = "Smart bin sensor fleet and sample publisher"
)]
struct Cli {
    /// Device configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the driver fleet and publish samples until Ctrl-C.
    Run {
        /// Seconds the simulated lid stays open.
        #[arg(long, default_value_t = 3)]
        lid_open_secs: u64,

        /// Seconds the simulated lid stays closed.
        #[arg(long, default_value_t = 30)]
        lid_closed_secs: u64,
    },

    /// List samples journaled but not yet acknowledged.
    Journal,

    /// Print the effective configuration and build identity.
    CheckConfig,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing("info", cli.log_json);

    let config = DeviceConfig::load(&cli.config)?;
    match cli.command {
        Commands::Run {
            lid_open_secs,
            lid_closed_secs,
        } => {
            let lid = SimLid::new().with_cycle(
                Duration::from_secs(lid_open_secs),
                Duration::from_secs(lid_closed_secs),
            );
            cmd_run(config, lid).await
        }
        Commands::Journal => cmd_journal(&config),
        Commands::CheckConfig => cmd_check_config(&config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: DeviceConfig, lid: SimLid) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;

    let publisher_config = config.publisher_config();
    info!(
        device_id = %publisher_config.identity.device_id,
        commit = %publisher_config.identity.commit_id,
        "starting smartbin"
    );

    // 1. Publisher and its collaborators.
    let queue = EnvelopeQueue::new();
    let secrets = Arc::new(SecretStore::new(&config.secrets_path));
    let transport = HttpTransport::new(secrets.clone())
        .with_paths(&config.publisher.scan_path, &config.publisher.health_path)
        .with_timeout(config.request_timeout());
    let publisher = AsyncPublisher::new(publisher_config, queue.clone(), Arc::new(transport))
        .with_alerter(Arc::new(SmtpAlerter::new(secrets)))
        .with_enricher(SidecarTranscript);

    // 2. Fleet.
    let drivers: Vec<Box<dyn Driver>> = vec![
        Box::new(StatusLight::new()),
        Box::new(SimScale::new()),
        Box::new(lid),
        Box::new(publisher),
    ];
    let bus = FleetBus::default();
    tokio::spawn(log_fleet_events(bus.subscribe()));

    let supervisor = Supervisor::start_with_bus(drivers, config.supervisor_config(), bus)
        .await
        .context("failed to start driver fleet")?;

    if supervisor.failed_to_initialize().is_empty() {
        info!("all drivers initialized");
        supervisor.set_event(keys::LIGHT_DONE)?;
    } else {
        warn!(drivers = ?supervisor.failed_to_initialize(), "drivers failed to initialize");
        supervisor.set_event(keys::LIGHT_ERROR)?;
    }
    supervisor.set_event(keys::TARE)?;

    // 3. Captures: one per lid close, one per scheduled interval.
    let lid_queue = queue.clone();
    supervisor.register_named_callback(keys::LID_CLOSED, "capture-on-lid-close", move |event| {
        let envelope = Envelope::capture(
            BTreeMap::new(),
            event.registry().snapshot(),
            Origin::UserTriggered,
        );
        info!(uid = %envelope.uid, "lid closed, sample captured");
        lid_queue.push(envelope);
        event.clear();
    })?;

    let registry = supervisor.registry().clone();
    supervisor.trigger_every(config.scheduled_interval(), "scheduled-capture", move || {
        let envelope = Envelope::capture(BTreeMap::new(), registry.snapshot(), Origin::Scheduled);
        info!(uid = %envelope.uid, "scheduled sample captured");
        queue.push(envelope);
    })?;

    // 4. Event loop.
    let mut ticker = tokio::time::interval(config.event_tick());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                supervisor.tick();
            }
        }
    }

    info!("shutting down");
    let stuck = tokio::task::block_in_place(|| supervisor.shutdown());
    if !stuck.is_empty() {
        warn!(drivers = ?stuck, "drivers did not stop within the grace period");
    }
    Ok(())
}

async fn log_fleet_events(mut rx: broadcast::Receiver<Arc<Stamped>>) {
    loop {
        match rx.recv().await {
            Ok(stamped) => match &stamped.event {
                FleetEvent::WorkerInitFailed { driver, reason } => {
                    error!(driver = %driver, reason = %reason, "driver failed to initialize");
                }
                FleetEvent::MeasureFailed { driver, reason } => {
                    warn!(driver = %driver, reason = %reason, "measure failed");
                }
                FleetEvent::WorkerHung { driver, busy_for_ms } => {
                    warn!(driver = %driver, busy_for_ms, "driver appears hung");
                }
                FleetEvent::WorkerDetached { driver, released } => {
                    error!(driver = %driver, released, "driver detached while stuck");
                }
                FleetEvent::UploadFailed { uid, status, reason } => {
                    warn!(uid = %uid, ?status, reason = %reason, "upload failed");
                }
                FleetEvent::ConnectivityChanged { online } => {
                    info!(online, "connectivity changed");
                }
                other => debug!(event = ?other, at = %stamped.at, "fleet event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "fleet event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: journal
// ---------------------------------------------------------------------------

fn cmd_journal(config: &DeviceConfig) -> Result<()> {
    let journal = Journal::open(&config.journal_path)
        .with_context(|| format!("failed to open journal {}", config.journal_path.display()))?;

    if journal.is_empty() {
        println!("No pending samples in {}", journal.path().display());
        return Ok(());
    }

    println!("{} pending sample(s) in {}", journal.len(), journal.path().display());
    for envelope in journal.envelopes() {
        let missing = envelope
            .file_refs
            .values()
            .filter(|path| !path.exists())
            .count();
        println!(
            "  {}  {:<14} files={} missing={}",
            envelope.uid,
            format!("{:?}", envelope.origin_trigger),
            envelope.file_refs.len(),
            missing
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(config: &DeviceConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    println!("{rendered}");
    println!("commit_id = {:?}", crate::config::commit_id(&config.firmware_dir));

    let secrets = SecretStore::new(&config.secrets_path);
    match secrets.current().and_then(|s| s.base_url()) {
        Ok(url) => println!("secrets: ok, endpoint {url}"),
        Err(e) => println!("secrets: unusable ({e})"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
