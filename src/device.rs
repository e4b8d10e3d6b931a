//! Device context: owns the channels and the spawned worker tasks.
//!
//! `Device::start` wires the whole pipeline together from one place: the
//! bounded persistence and delivery channels, the acquisition worker and
//! its session controller, the persistence and delivery workers, the
//! connectivity manager, and the one-shot clock-sync watcher that marks
//! the clock authoritative on the first link-up (the stand-in for the
//! real device's SNTP sync). Nothing here is a global; collaborators come
//! in as trait-object handles so tests and the simulated binary share the
//! wiring.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::acquisition::{AcquisitionStats, AcquisitionWorker, SessionController};
use crate::config::Config;
use crate::connectivity::{
    ConnectivityError, ConnectivityManager, CredentialStore, LinkEvent, LinkState,
    ProvisioningListener, WirelessLink,
};
use crate::delivery::{CollectorClient, DeliveryError, DeliveryStats, DeliveryWorker};
use crate::persistence::{PersistenceStats, PersistenceWorker};
use crate::sensors::{SensorBus, SystemClock};

/// Errors that prevent the device from starting.
#[derive(Debug)]
pub enum DeviceError {
    /// The collector HTTP client could not be built
    Client(DeliveryError),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Client(e) => write!(f, "failed to build collector client: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Client(e) => Some(e),
        }
    }
}

impl From<DeliveryError> for DeviceError {
    fn from(err: DeliveryError) -> Self {
        DeviceError::Client(err)
    }
}

/// Final counters from every worker, collected at shutdown.
#[derive(Debug, Default)]
pub struct DeviceReport {
    pub acquisition: AcquisitionStats,
    pub persistence: PersistenceStats,
    pub delivery: Option<DeliveryStats>,
}

/// The assembled telemetry node.
pub struct Device {
    controller: SessionController,
    link_state: watch::Receiver<LinkState>,
    acquisition: JoinHandle<AcquisitionStats>,
    persistence: JoinHandle<PersistenceStats>,
    delivery: Option<JoinHandle<DeliveryStats>>,
    connectivity: JoinHandle<Result<(), ConnectivityError>>,
    clock_sync: JoinHandle<()>,
}

impl Device {
    /// Wire the channels and spawn every worker.
    ///
    /// The caller creates the link event channel, hands the sender to its
    /// wireless driver and provisioning listener, and passes the receiver
    /// here. The shared clock is concrete because the device marks it
    /// authoritative on the first link-up.
    pub fn start(
        config: &Config,
        bus: Arc<tokio::sync::Mutex<Box<dyn SensorBus>>>,
        clock: Arc<SystemClock>,
        link: Arc<dyn WirelessLink>,
        provisioner: Arc<dyn ProvisioningListener>,
        store: Arc<dyn CredentialStore>,
        link_events: mpsc::Receiver<LinkEvent>,
    ) -> Result<Self, DeviceError> {
        let (manager, link_state) = ConnectivityManager::new(
            link,
            provisioner,
            store,
            link_events,
            config.max_connect_retries,
            config.backoff_unit,
            config.provisioning_timeout,
        );
        let connectivity = tokio::spawn(manager.run());

        // First link-up completes the time sync; log file names switch
        // from boot placeholders to real timestamps from then on.
        let clock_sync = {
            let mut link_rx = link_state.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                loop {
                    if link_rx.borrow().is_connected() {
                        clock.mark_authoritative();
                        info!("Time sync completed on first link-up");
                        break;
                    }
                    if link_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        let (log_tx, log_rx) = mpsc::channel(config.channel_capacity);
        let persistence =
            tokio::spawn(PersistenceWorker::new(log_rx, config.data_dir.clone(), clock.clone()).run());

        let (delivery, delivery_tx) = if config.delivery_enabled {
            let client = CollectorClient::new(config)?;
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let worker = DeliveryWorker::new(rx, link_state.clone(), client, config.delivery_poll);
            (Some(tokio::spawn(worker.run())), Some(tx))
        } else {
            info!("Collector delivery disabled, samples are logged locally only");
            (None, None)
        };

        let (worker, controller) = AcquisitionWorker::new(config, bus, clock, log_tx, delivery_tx);
        let acquisition = tokio::spawn(worker.run());

        Ok(Self {
            controller,
            link_state,
            acquisition,
            persistence,
            delivery,
            connectivity,
            clock_sync,
        })
    }

    /// Handle for starting and stopping sampling sessions.
    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    /// Observe the wireless link state.
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    /// Stop every worker and collect the final counters.
    ///
    /// The in-flight session (if any) is given `grace` to reach its
    /// deadline; after that the acquisition task is aborted. Downstream
    /// workers drain naturally once the acquisition side of their channels
    /// drops.
    pub async fn shutdown(self, grace: Duration) -> DeviceReport {
        self.controller.request_stop();
        drop(self.controller);

        let mut acquisition_handle = self.acquisition;
        let acquisition = match timeout(grace, &mut acquisition_handle).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!(error = %e, "Acquisition task failed during shutdown");
                AcquisitionStats::default()
            }
            Err(_) => {
                warn!(grace = ?grace, "Acquisition did not stop in time, aborting");
                acquisition_handle.abort();
                AcquisitionStats::default()
            }
        };

        let persistence = match timeout(grace, self.persistence).await {
            Ok(Ok(stats)) => stats,
            _ => {
                warn!("Persistence worker did not drain in time");
                PersistenceStats::default()
            }
        };

        let delivery = match self.delivery {
            Some(handle) => match timeout(grace, handle).await {
                Ok(Ok(stats)) => Some(stats),
                _ => {
                    warn!("Delivery worker did not drain in time");
                    Some(DeliveryStats::default())
                }
            },
            None => None,
        };

        self.connectivity.abort();
        self.clock_sync.abort();

        DeviceReport {
            acquisition,
            persistence,
            delivery,
        }
    }
}
