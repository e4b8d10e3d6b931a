//! Delivery worker: forwards samples to the collector over HTTP.
//!
//! Delivery is strictly best-effort and subordinate to persistence: a
//! sample that cannot be sent is already on disk, so the worker never
//! retries a sample and never blocks the pipeline. The link state cell is
//! consulted before every send; while the link is down, samples drain from
//! the channel and are counted as skipped rather than queueing up against
//! a dead network.
//!
//! The worker announces the device to the collector whenever the link
//! comes up, and re-announces after a failed send in case the collector
//! restarted and lost its device table.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::LinkState;
use crate::sample::{Registration, Sample, WirePayload};

/// Re-registration attempts after a failed send.
const REREGISTER_ATTEMPTS: u32 = 2;

/// Fixed delay between re-registration attempts (in milliseconds).
const REREGISTER_DELAY_MS: u64 = 500;

/// Errors from collector HTTP operations.
#[derive(Debug)]
pub enum DeliveryError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Collector returned an error status code
    Status { code: StatusCode, message: String },

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Request(e) => write!(f, "HTTP request failed: {}", e),
            DeliveryError::Status { code, message } => {
                write!(f, "Collector error ({}): {}", code, message)
            }
            DeliveryError::Timeout => write!(f, "Request timed out"),
            DeliveryError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Request(err)
        }
    }
}

/// Statistics about delivery operations.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Samples posted to the collector successfully
    pub delivered: u64,

    /// Samples that failed to send (already persisted, not retried)
    pub send_failures: u64,

    /// Samples drained while the link was down
    pub skipped_offline: u64,

    /// Successful device registrations
    pub registrations: u64,

    /// Failed registration attempts
    pub registration_failures: u64,
}

/// HTTP client for the collector's ingest and registration endpoints.
///
/// The underlying reqwest client is reused so keep-alive connections are
/// pooled across sends.
pub struct CollectorClient {
    client: Client,
    ingest_url: String,
    register_url: String,
    timeout: Duration,
}

impl CollectorClient {
    /// Create a client from the device configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, DeliveryError> {
        Self::with_endpoints(
            config.ingest_url.clone(),
            config.register_url.clone(),
            config.request_timeout,
        )
    }

    /// Create a client with explicit endpoints, for tests and tooling.
    pub fn with_endpoints(
        ingest_url: impl Into<String>,
        register_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| DeliveryError::Config(e.to_string()))?;

        Ok(Self {
            client,
            ingest_url: ingest_url.into(),
            register_url: register_url.into(),
            timeout: request_timeout,
        })
    }

    /// Post one sample payload. A single attempt, no retries; the caller
    /// decides what a failure means.
    pub async fn post_sample(&self, payload: &WirePayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(DeliveryError::Status {
                code: status,
                message,
            })
        }
    }

    /// Announce this device to the collector.
    pub async fn register(&self, registration: &Registration) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.register_url)
            .timeout(self.timeout)
            .json(registration)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(DeliveryError::Status {
                code: status,
                message,
            })
        }
    }

    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    pub fn register_url(&self) -> &str {
        &self.register_url
    }
}

/// Drains the delivery channel and posts samples while the link is up.
pub struct DeliveryWorker {
    rx: mpsc::Receiver<Sample>,
    link: watch::Receiver<LinkState>,
    client: CollectorClient,
    poll_interval: Duration,

    /// Link state observed on the previous loop iteration; registration
    /// fires on the rising edge only
    was_connected: bool,

    stats: DeliveryStats,
}

impl DeliveryWorker {
    pub fn new(
        rx: mpsc::Receiver<Sample>,
        link: watch::Receiver<LinkState>,
        client: CollectorClient,
        poll_interval: Duration,
    ) -> Self {
        Self {
            rx,
            link,
            client,
            poll_interval,
            was_connected: false,
            stats: DeliveryStats::default(),
        }
    }

    /// Drain samples until the channel closes; returns the final counters.
    ///
    /// Receives are bounded by the poll interval so a quiet channel still
    /// lets the worker observe link transitions and register promptly.
    pub async fn run(mut self) -> DeliveryStats {
        info!(
            ingest_url = %self.client.ingest_url(),
            "Delivery worker started"
        );

        loop {
            // One registration attempt per transition to connected; a
            // failure here is not retried until the next link-up. The
            // bounded re-registration after a failed send is the only
            // other registration path.
            let state = self.link.borrow().clone();
            match &state {
                LinkState::Connected { ip } => {
                    if !self.was_connected {
                        let ip = ip.clone();
                        self.register(&ip).await;
                    }
                    self.was_connected = true;
                }
                _ => self.was_connected = false,
            }

            match timeout(self.poll_interval, self.rx.recv()).await {
                // Poll timeout, go back and re-check the link
                Err(_) => continue,
                // Channel closed, producer is gone
                Ok(None) => break,
                Ok(Some(sample)) => {
                    let ip = self.link.borrow().ip().map(str::to_string);
                    match ip {
                        Some(ip) => self.deliver(&sample, &ip).await,
                        None => {
                            self.stats.skipped_offline += 1;
                            debug!(
                                sequence = sample.sequence,
                                "Link down, sample not forwarded"
                            );
                        }
                    }
                }
            }
        }

        info!(
            delivered = self.stats.delivered,
            send_failures = self.stats.send_failures,
            skipped_offline = self.stats.skipped_offline,
            registrations = self.stats.registrations,
            "Delivery channel closed, worker stopping"
        );
        self.stats
    }

    async fn register(&mut self, ip: &str) {
        match self.client.register(&Registration::new(ip)).await {
            Ok(()) => {
                self.stats.registrations += 1;
                info!(ip = %ip, "Registered with collector");
            }
            Err(e) => {
                self.stats.registration_failures += 1;
                warn!(ip = %ip, error = %e, "Registration failed");
            }
        }
    }

    async fn deliver(&mut self, sample: &Sample, ip: &str) {
        let payload = WirePayload::new(sample, ip);

        match self.client.post_sample(&payload).await {
            Ok(()) => {
                self.stats.delivered += 1;
                debug!(sequence = sample.sequence, "Sample delivered");
            }
            Err(e) => {
                // The sample is already persisted; do not retry it. A
                // failed send often means the collector restarted and
                // forgot us, so re-announce before the next sample.
                self.stats.send_failures += 1;
                warn!(
                    sequence = sample.sequence,
                    error = %e,
                    "Send failed, sample not retried"
                );
                self.reregister(ip).await;
            }
        }
    }

    async fn reregister(&mut self, ip: &str) {
        for attempt in 1..=REREGISTER_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(REREGISTER_DELAY_MS)).await;

            match self.client.register(&Registration::new(ip)).await {
                Ok(()) => {
                    self.stats.registrations += 1;
                    info!(ip = %ip, attempt, "Re-registered with collector");
                    return;
                }
                Err(e) => {
                    self.stats.registration_failures += 1;
                    warn!(ip = %ip, attempt, error = %e, "Re-registration failed");
                }
            }
        }

        error!(
            ip = %ip,
            attempts = REREGISTER_ATTEMPTS,
            "Re-registration attempts exhausted"
        );
    }
}
