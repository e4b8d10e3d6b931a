//! Electronic-nose telemetry node
//!
//! This library provides the components of an embedded-style telemetry
//! pipeline: periodic multi-sensor sampling, durable local CSV logging and
//! best-effort delivery to a remote collector, supervised by a wireless
//! connectivity state machine.
//!
//! - **config**: Environment-based configuration for the node
//! - **sensors**: Sensor bus and clock seams plus the simulated bus
//! - **sample**: The sample record, its CSV line and wire JSON forms
//! - **acquisition**: Fixed-period sampling sessions and their controller
//! - **persistence**: Durable append-only CSV logging with rotation
//! - **delivery**: Best-effort HTTP forwarding to the collector
//! - **connectivity**: Link state machine with retry and provisioning
//! - **device**: Top-level wiring of channels and worker tasks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use enose_node::config::Config;
//! use enose_node::connectivity::{
//!     link_event_channel, CredentialRecord, MemoryStore, NullProvisioner, SimulatedLink,
//! };
//! use enose_node::device::Device;
//! use enose_node::sensors::{SensorBus, SimulatedBus, SystemClock};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let bus: Arc<tokio::sync::Mutex<Box<dyn SensorBus>>> =
//!         Arc::new(tokio::sync::Mutex::new(Box::new(SimulatedBus::new())));
//!
//!     let (event_tx, event_rx) = link_event_channel();
//!     let device = Device::start(
//!         &config,
//!         bus,
//!         Arc::new(SystemClock::new()),
//!         Arc::new(SimulatedLink::new(event_tx, "192.168.4.20")),
//!         Arc::new(NullProvisioner),
//!         Arc::new(MemoryStore::with_credentials(CredentialRecord {
//!             ssid: "lab-ap".to_string(),
//!             secret: "change-me".to_string(),
//!         })),
//!         event_rx,
//!     )
//!     .expect("Failed to start device");
//!
//!     device.controller().request_start();
//!     tokio::signal::ctrl_c().await.ok();
//!     device.shutdown(Duration::from_secs(10)).await;
//! }
//! ```

// Module declarations
pub mod acquisition;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod device;
pub mod persistence;
pub mod sample;
pub mod sensors;

// Re-export commonly used types at crate root for convenience
pub use acquisition::{AcquisitionStats, AcquisitionWorker, SessionController};
pub use config::{Config, ConfigError};
pub use connectivity::{
    ConnectivityError, ConnectivityManager, CredentialRecord, LinkEvent, LinkState,
};
pub use delivery::{CollectorClient, DeliveryError, DeliveryStats, DeliveryWorker};
pub use device::{Device, DeviceError, DeviceReport};
pub use persistence::{LogCommand, PersistenceStats, PersistenceWorker};
pub use sample::{Sample, WirePayload, CHANNEL_COUNT, LOG_HEADER};
pub use sensors::{ClockSource, SampleSource, SensorBus, SystemClock};
