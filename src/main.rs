//! Electronic-nose telemetry node - sampling, logging and delivery daemon
//!
//! This binary assembles the pipeline with simulated collaborators (sensor
//! bus, wireless link, credential store) so the full device behavior runs
//! on a workstation: periodic sampling sessions, durable CSV logging under
//! the data directory, and best-effort delivery to the collector while the
//! link is up.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `ENOSE_COLLECTOR_URL`: collector base URL (default: http://localhost:3000)
//! - `ENOSE_SAMPLE_PERIOD_MS`: tick period in ms (default: 2000)
//! - `ENOSE_SESSION_DURATION_SECS`: sampling window length (default: 300)
//! - `ENOSE_DATA_DIR`: directory for local log files (default: ./data)
//! - `ENOSE_DELIVERY_ENABLED`: enable collector delivery (default: true)
//! - `ENOSE_AUTO_RESTART`: continuous sampling mode (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use enose_node::config::Config;
use enose_node::connectivity::{
    link_event_channel, CredentialRecord, MemoryStore, NullProvisioner, SimulatedLink,
};
use enose_node::device::Device;
use enose_node::sensors::{SensorBus, SimulatedBus, SystemClock};

/// Address the simulated wireless link reports after association
const SIMULATED_IP: &str = "192.168.4.20";

/// How long shutdown waits for workers to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting telemetry node...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                collector_url = %config.collector_url,
                sample_period_ms = config.sample_period.as_millis() as u64,
                session_duration_secs = config.session_duration.as_secs(),
                data_dir = %config.data_dir.display(),
                delivery_enabled = config.delivery_enabled,
                auto_restart = config.auto_restart,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Simulated collaborators; a hardware build swaps these for the real
    // sensor bus, wireless driver and NVS-backed credential store.
    let bus: Arc<tokio::sync::Mutex<Box<dyn SensorBus>>> =
        Arc::new(tokio::sync::Mutex::new(Box::new(SimulatedBus::new())));
    let clock = Arc::new(SystemClock::new());
    let (event_tx, event_rx) = link_event_channel();
    let link = Arc::new(SimulatedLink::new(event_tx, SIMULATED_IP));
    let store = Arc::new(MemoryStore::with_credentials(CredentialRecord {
        ssid: "enose-lab".to_string(),
        secret: "change-me".to_string(),
    }));

    let device = match Device::start(
        &config,
        bus,
        clock,
        link,
        Arc::new(NullProvisioner),
        store,
        event_rx,
    ) {
        Ok(device) => device,
        Err(e) => {
            error!(error = %e, "Failed to start device");
            std::process::exit(1);
        }
    };

    // Kick off the first sampling session; continuous mode keeps going
    // from here on its own.
    device.controller().request_start();

    // Wait for shutdown signal
    info!("Telemetry node running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    let report = device.shutdown(SHUTDOWN_GRACE).await;
    info!(
        sessions = report.acquisition.sessions_completed,
        samples = report.acquisition.samples_produced,
        records_written = report.persistence.records_written,
        delivered = report.delivery.as_ref().map(|d| d.delivered).unwrap_or(0),
        "Telemetry node stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
