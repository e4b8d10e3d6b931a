//! Acquisition worker: fixed-period sensor sampling sessions.
//!
//! A session is a bounded sampling window (`deadline = start + duration`)
//! driven by an absolute-scheduled interval, so the tick grid never drifts
//! however long an individual poll takes. Each tick reads every sensor
//! under the bus lock, stamps the running sequence number and fans the
//! sample out to the persistence and delivery channels with `try_send`;
//! a full channel costs that one copy of the sample, never the tick.
//!
//! Sessions are started through the [`SessionController`]. Starting is
//! idempotent while a session is active, and stopping is advisory: the
//! in-flight session always runs to its natural deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::persistence::LogCommand;
use crate::sample::Sample;
use crate::sensors::{ClockSource, SampleSource, SensorBus};

/// Counters for the acquisition worker.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionStats {
    /// Sessions that ran to their natural deadline
    pub sessions_completed: u64,

    /// Samples produced across all sessions
    pub samples_produced: u64,

    /// Samples that could not be queued for persistence (channel full)
    pub persistence_drops: u64,

    /// Samples that could not be queued for delivery (channel full)
    pub delivery_drops: u64,

    /// Individual sensor reads that failed and were replaced by sentinels
    pub failed_reads: u64,
}

/// Handle for starting and stopping sampling sessions.
///
/// Start requests are permits through a capacity-1 channel: a request made
/// while a session is active parks at most one permit, and the worker
/// discards parked permits when the session ends, so two sessions can
/// never overlap and a burst of requests yields exactly one session.
#[derive(Clone)]
pub struct SessionController {
    permits: mpsc::Sender<()>,
    stop_requested: Arc<AtomicBool>,
}

impl SessionController {
    /// Request a session start. Idempotent while a session is active.
    /// Clears any prior stop request.
    pub fn request_start(&self) {
        self.stop_requested.store(false, Ordering::Release);
        if self.permits.try_send(()).is_err() {
            debug!("Start already pending or worker gone, request ignored");
        }
    }

    /// Request that no further session starts. Advisory: the in-flight
    /// session runs to its deadline; only the continuous-mode restart of
    /// the next session is suppressed.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }
}

/// Why a session loop ended.
enum SessionEnd {
    Deadline,
    ChannelsClosed,
}

/// Runs sampling sessions against the sensor bus.
pub struct AcquisitionWorker {
    permits: mpsc::Receiver<()>,
    stop_requested: Arc<AtomicBool>,

    bus: Arc<Mutex<Box<dyn SensorBus>>>,
    clock: Arc<dyn ClockSource>,
    persistence: mpsc::Sender<LogCommand>,
    delivery: Option<mpsc::Sender<Sample>>,

    sample_period: Duration,
    session_duration: Duration,
    auto_restart: bool,

    /// Running sample counter; increments every tick across sessions
    sequence: u32,

    stats: AcquisitionStats,
}

impl AcquisitionWorker {
    pub fn new(
        config: &Config,
        bus: Arc<Mutex<Box<dyn SensorBus>>>,
        clock: Arc<dyn ClockSource>,
        persistence: mpsc::Sender<LogCommand>,
        delivery: Option<mpsc::Sender<Sample>>,
    ) -> (Self, SessionController) {
        let (permit_tx, permit_rx) = mpsc::channel(1);
        let stop_requested = Arc::new(AtomicBool::new(false));

        let controller = SessionController {
            permits: permit_tx,
            stop_requested: stop_requested.clone(),
        };

        let worker = Self {
            permits: permit_rx,
            stop_requested,
            bus,
            clock,
            persistence,
            delivery,
            sample_period: config.sample_period,
            session_duration: config.session_duration,
            auto_restart: config.auto_restart,
            sequence: 0,
            stats: AcquisitionStats::default(),
        };

        (worker, controller)
    }

    /// Run sessions until every controller handle is gone; returns the
    /// final counters.
    pub async fn run(mut self) -> AcquisitionStats {
        info!(
            sample_period = ?self.sample_period,
            session_duration = ?self.session_duration,
            auto_restart = self.auto_restart,
            "Acquisition worker started"
        );

        let mut restart = false;
        loop {
            if !restart {
                if self.permits.recv().await.is_none() {
                    break;
                }
            }

            let end = self.run_session().await;

            // Permits issued while the session was active are discarded so
            // overlapping start requests collapse into the one session.
            while self.permits.try_recv().is_ok() {}

            match end {
                SessionEnd::Deadline => self.stats.sessions_completed += 1,
                SessionEnd::ChannelsClosed => break,
            }

            restart = self.auto_restart && !self.stop_requested.load(Ordering::Acquire);
            if self.auto_restart && !restart {
                info!("Stop requested, leaving continuous mode");
            }
        }

        info!(
            sessions_completed = self.stats.sessions_completed,
            samples_produced = self.stats.samples_produced,
            persistence_drops = self.stats.persistence_drops,
            delivery_drops = self.stats.delivery_drops,
            "Acquisition worker stopping"
        );
        self.stats
    }

    async fn run_session(&mut self) -> SessionEnd {
        // The header record for this session's file rides the same channel
        // as the samples, so it always lands before them. The persistence
        // worker derives the file name from the clock at rotation time, so
        // sessions started after a completed time sync automatically carry
        // real timestamps.
        if self.persistence.send(LogCommand::Rotate).await.is_err() {
            warn!("Persistence channel closed, cannot start session");
            return SessionEnd::ChannelsClosed;
        }

        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.session_duration;
        info!(
            session_id = %session_id,
            duration = ?self.session_duration,
            "Sampling session started"
        );

        let mut ticker = interval_at(started + self.sample_period, self.sample_period);
        let mut produced: u64 = 0;
        let mut dropped: u64 = 0;

        loop {
            ticker.tick().await;

            let frame = {
                let mut bus = self.bus.lock().await;
                SampleSource::poll(bus.as_mut())
            };
            self.stats.failed_reads += frame.failed_reads as u64;

            self.sequence = self.sequence.wrapping_add(1);
            let sample = Sample {
                sequence: self.sequence,
                timestamp: self.clock.now(),
                temperature: frame.temperature,
                humidity: frame.humidity,
                channels: frame.channels,
            };
            produced += 1;
            self.stats.samples_produced += 1;

            match self.persistence.try_send(LogCommand::Append(sample)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    self.stats.persistence_drops += 1;
                    warn!(
                        sequence = sample.sequence,
                        "Persistence channel full, sample dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Persistence channel closed mid-session");
                    return SessionEnd::ChannelsClosed;
                }
            }

            if let Some(delivery) = &self.delivery {
                match delivery.try_send(sample) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.stats.delivery_drops += 1;
                        debug!(
                            sequence = sample.sequence,
                            "Delivery channel full, sample not forwarded"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("Delivery channel closed, disabling forwarding");
                        self.delivery = None;
                    }
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        info!(
            session_id = %session_id,
            samples = produced,
            dropped,
            elapsed = ?started.elapsed(),
            "Sampling session complete"
        );
        SessionEnd::Deadline
    }
}
