//! Wireless connectivity state machine.
//!
//! The link lifecycle (connect, authenticate, retry with linear backoff,
//! fall back to out-of-band provisioning) is expressed as a pure
//! [`transition`] table over `(state, retry count, event)`, driven by
//! [`ConnectivityManager`] which owns the only writer of the shared
//! [`LinkState`] cell and performs the side effects: initiating connects,
//! persisting or erasing credentials, and starting the provisioning
//! listener.
//!
//! Every other component reads the link state through a
//! `watch::Receiver<LinkState>` and never writes it. Readers tolerate a
//! stale-by-one-event view; a send performed a moment after the link drops
//! simply fails and is handled as any delivery failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the link event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Persisted wireless credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub ssid: String,
    pub secret: String,
}

/// Current state of the wireless link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Link is up; carries the device's dotted-quad address
    Connected { ip: String },
    Provisioning,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected { .. })
    }

    /// Device address if connected.
    pub fn ip(&self) -> Option<&str> {
        match self {
            LinkState::Connected { ip } => Some(ip),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected { ip } => write!(f, "connected({})", ip),
            LinkState::Provisioning => write!(f, "provisioning"),
        }
    }
}

/// Events reported by the wireless driver and the provisioning listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Association and DHCP completed; the link carries traffic
    LinkUp { ip: String },

    /// The link dropped
    LinkDown,

    /// The access point rejected our credentials
    AuthFailure,

    /// The provisioning listener received new credentials
    CredentialsReceived(CredentialRecord),
}

/// The action the state machine takes in response to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Enter `Connecting` and initiate a connect attempt after `delay`.
    /// `retries` is the new failed-attempt count.
    Connect { delay: Duration, retries: u32 },

    /// Enter `Connected`; retry counter resets to zero
    Established { ip: String },

    /// Retry budget exhausted: erase credentials, enter `Provisioning`
    StartProvisioning,

    /// Persist the new credentials, then enter `Connecting` and connect
    AdoptCredentials(CredentialRecord),

    /// The event has no legal transition from this state
    Ignore,
}

/// The connectivity transition table as a pure function, testable without
/// hardware or timers.
///
/// `retries` is the number of failed connect attempts so far in the current
/// `Connecting` episode. A retry waits `new_retries * backoff_unit` before
/// reconnecting (linear backoff); once `retries` reaches `max_retries` the
/// machine falls back to provisioning instead of issuing another connect.
pub fn transition(
    state: &LinkState,
    retries: u32,
    max_retries: u32,
    backoff_unit: Duration,
    event: &LinkEvent,
) -> Transition {
    match (state, event) {
        (LinkState::Connecting, LinkEvent::LinkUp { ip }) => {
            Transition::Established { ip: ip.clone() }
        }
        (LinkState::Connecting, LinkEvent::LinkDown)
        | (LinkState::Connecting, LinkEvent::AuthFailure) => {
            let failed = retries + 1;
            if failed >= max_retries {
                Transition::StartProvisioning
            } else {
                Transition::Connect {
                    delay: backoff_unit * failed,
                    retries: failed,
                }
            }
        }
        // A period of successful connectivity forgives earlier failures:
        // the retry counter restarts at zero.
        (LinkState::Connected { .. }, LinkEvent::LinkDown)
        | (LinkState::Connected { .. }, LinkEvent::AuthFailure) => Transition::Connect {
            delay: Duration::ZERO,
            retries: 0,
        },
        (LinkState::Provisioning, LinkEvent::CredentialsReceived(creds)) => {
            Transition::AdoptCredentials(creds.clone())
        }
        _ => Transition::Ignore,
    }
}

/// Persistent credential storage.
pub trait CredentialStore: Send + Sync {
    fn load_credentials(&self) -> Option<CredentialRecord>;
    fn save_credentials(&self, creds: &CredentialRecord);
    fn erase_credentials(&self);
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    creds: std::sync::Mutex<Option<CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(creds: CredentialRecord) -> Self {
        Self {
            creds: std::sync::Mutex::new(Some(creds)),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load_credentials(&self) -> Option<CredentialRecord> {
        self.creds.lock().expect("credential store lock poisoned").clone()
    }

    fn save_credentials(&self, creds: &CredentialRecord) {
        *self.creds.lock().expect("credential store lock poisoned") = Some(creds.clone());
    }

    fn erase_credentials(&self) {
        *self.creds.lock().expect("credential store lock poisoned") = None;
    }
}

/// Wireless driver seam. `connect` initiates an association attempt and
/// returns immediately; the outcome arrives later as a [`LinkEvent`] on the
/// manager's event channel, mirroring how real wireless stacks report
/// results through callbacks.
pub trait WirelessLink: Send + Sync {
    fn connect(&self, creds: &CredentialRecord);
}

/// Out-of-band provisioning seam. `start` opens the credential-exchange
/// listener; received credentials arrive as
/// [`LinkEvent::CredentialsReceived`] on the event channel.
pub trait ProvisioningListener: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Simulated wireless driver for running without hardware: every connect
/// attempt succeeds and reports a fixed address.
pub struct SimulatedLink {
    events: mpsc::Sender<LinkEvent>,
    ip: String,
}

impl SimulatedLink {
    pub fn new(events: mpsc::Sender<LinkEvent>, ip: impl Into<String>) -> Self {
        Self {
            events,
            ip: ip.into(),
        }
    }
}

impl WirelessLink for SimulatedLink {
    fn connect(&self, creds: &CredentialRecord) {
        debug!(ssid = %creds.ssid, "Simulated link associating");
        let _ = self.events.try_send(LinkEvent::LinkUp {
            ip: self.ip.clone(),
        });
    }
}

/// Provisioning listener that never produces credentials; the simulated
/// deployments always carry pre-provisioned credentials.
pub struct NullProvisioner;

impl ProvisioningListener for NullProvisioner {
    fn start(&self) {}
    fn stop(&self) {}
}

/// Errors that terminate the connectivity manager.
#[derive(Debug)]
pub enum ConnectivityError {
    /// The provisioning window elapsed without receiving credentials;
    /// an external restart is required (no auto-retry, so a bad secret
    /// cannot produce an unbounded provisioning loop)
    ProvisioningTimeout,

    /// The event channel closed (all event producers dropped)
    EventChannelClosed,
}

impl std::fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityError::ProvisioningTimeout => {
                write!(f, "provisioning window elapsed without credentials")
            }
            ConnectivityError::EventChannelClosed => write!(f, "link event channel closed"),
        }
    }
}

impl std::error::Error for ConnectivityError {}

/// Drives the transition table against real link events and owns the only
/// writer of the shared [`LinkState`] cell.
pub struct ConnectivityManager {
    state_tx: watch::Sender<LinkState>,
    events: mpsc::Receiver<LinkEvent>,
    link: Arc<dyn WirelessLink>,
    provisioner: Arc<dyn ProvisioningListener>,
    store: Arc<dyn CredentialStore>,
    max_retries: u32,
    backoff_unit: Duration,
    provisioning_timeout: Duration,
    retries: u32,
}

/// Create the channel on which link drivers and the provisioning listener
/// report [`LinkEvent`]s to the manager.
pub fn link_event_channel() -> (mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

impl ConnectivityManager {
    /// Create the manager consuming the event receiver; returns the
    /// receiver other components use to observe link state. The manager
    /// holds the only [`LinkState`] writer.
    pub fn new(
        link: Arc<dyn WirelessLink>,
        provisioner: Arc<dyn ProvisioningListener>,
        store: Arc<dyn CredentialStore>,
        events: mpsc::Receiver<LinkEvent>,
        max_retries: u32,
        backoff_unit: Duration,
        provisioning_timeout: Duration,
    ) -> (Self, watch::Receiver<LinkState>) {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        let manager = Self {
            state_tx,
            events,
            link,
            provisioner,
            store,
            max_retries,
            backoff_unit,
            provisioning_timeout,
            retries: 0,
        };

        (manager, state_rx)
    }

    /// Run the state machine until provisioning times out or every event
    /// producer is gone.
    pub async fn run(mut self) -> Result<(), ConnectivityError> {
        // Provisioning deadline; Some only while in Provisioning state
        let mut provisioning_deadline: Option<Instant> = None;

        match self.store.load_credentials() {
            Some(creds) => {
                info!(ssid = %creds.ssid, "Stored credentials found, connecting");
                self.set_state(LinkState::Connecting);
                self.link.connect(&creds);
            }
            None => {
                info!("No stored credentials, entering provisioning mode");
                self.enter_provisioning(&mut provisioning_deadline);
            }
        }

        loop {
            let event = match provisioning_deadline {
                Some(deadline) => match timeout_at_deadline(deadline, self.events.recv()).await {
                    Some(maybe_event) => maybe_event,
                    None => {
                        error!(
                            timeout_secs = self.provisioning_timeout.as_secs(),
                            "Provisioning window elapsed, stopping connectivity manager"
                        );
                        self.provisioner.stop();
                        self.set_state(LinkState::Disconnected);
                        return Err(ConnectivityError::ProvisioningTimeout);
                    }
                },
                None => self.events.recv().await,
            };

            let Some(event) = event else {
                warn!("Link event channel closed, connectivity manager stopping");
                return Err(ConnectivityError::EventChannelClosed);
            };

            let state = self.state_tx.borrow().clone();
            let action = transition(
                &state,
                self.retries,
                self.max_retries,
                self.backoff_unit,
                &event,
            );
            debug!(state = %state, event = ?event, action = ?action, "Link event");

            match action {
                Transition::Established { ip } => {
                    info!(ip = %ip, "Link established");
                    self.retries = 0;
                    provisioning_deadline = None;
                    self.set_state(LinkState::Connected { ip });
                }
                Transition::Connect { delay, retries } => {
                    self.retries = retries;
                    self.set_state(LinkState::Connecting);
                    let Some(creds) = self.store.load_credentials() else {
                        // Credentials disappeared mid-retry; fall back to
                        // provisioning rather than connect with nothing.
                        warn!("No credentials available for reconnect");
                        self.enter_provisioning(&mut provisioning_deadline);
                        continue;
                    };
                    if !delay.is_zero() {
                        info!(
                            attempt = retries + 1,
                            delay_ms = delay.as_millis(),
                            "Retrying connect after backoff"
                        );
                        sleep(delay).await;
                    }
                    self.link.connect(&creds);
                }
                Transition::StartProvisioning => {
                    warn!(
                        attempts = self.retries + 1,
                        "Connect retry budget exhausted, erasing credentials"
                    );
                    self.store.erase_credentials();
                    self.enter_provisioning(&mut provisioning_deadline);
                }
                Transition::AdoptCredentials(creds) => {
                    info!(ssid = %creds.ssid, "Provisioning produced credentials");
                    // Persisted before the connect attempt so they survive
                    // a reset even if the connect itself fails.
                    self.store.save_credentials(&creds);
                    self.provisioner.stop();
                    provisioning_deadline = None;
                    self.retries = 0;
                    self.set_state(LinkState::Connecting);
                    self.link.connect(&creds);
                }
                Transition::Ignore => {
                    debug!(state = %state, event = ?event, "Event ignored in current state");
                }
            }
        }
    }

    fn enter_provisioning(&mut self, deadline: &mut Option<Instant>) {
        self.retries = 0;
        self.set_state(LinkState::Provisioning);
        self.provisioner.start();
        *deadline = Some(Instant::now() + self.provisioning_timeout);
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }
}

/// Await a future until an absolute deadline; `None` on timeout.
async fn timeout_at_deadline<F: std::future::Future>(
    deadline: Instant,
    future: F,
) -> Option<F::Output> {
    timeout(deadline.saturating_duration_since(Instant::now()), future)
        .await
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const UNIT: Duration = Duration::from_millis(1);

    fn creds() -> CredentialRecord {
        CredentialRecord {
            ssid: "lab-ap".to_string(),
            secret: "hunter2".to_string(),
        }
    }

    // --- pure transition table ---

    #[test]
    fn test_connecting_link_up_establishes() {
        let action = transition(
            &LinkState::Connecting,
            3,
            5,
            UNIT,
            &LinkEvent::LinkUp {
                ip: "10.0.0.2".to_string(),
            },
        );
        assert_eq!(
            action,
            Transition::Established {
                ip: "10.0.0.2".to_string()
            }
        );
    }

    #[test]
    fn test_connecting_failure_retries_with_linear_backoff() {
        for failed in 1..5u32 {
            let action = transition(
                &LinkState::Connecting,
                failed - 1,
                5,
                UNIT,
                &LinkEvent::AuthFailure,
            );
            assert_eq!(
                action,
                Transition::Connect {
                    delay: UNIT * failed,
                    retries: failed,
                }
            );
        }
    }

    #[test]
    fn test_fifth_failure_starts_provisioning() {
        let action = transition(&LinkState::Connecting, 4, 5, UNIT, &LinkEvent::LinkDown);
        assert_eq!(action, Transition::StartProvisioning);
    }

    #[test]
    fn test_connected_link_down_restarts_retry_counter() {
        let action = transition(
            &LinkState::Connected {
                ip: "10.0.0.2".to_string(),
            },
            4,
            5,
            UNIT,
            &LinkEvent::LinkDown,
        );
        assert_eq!(
            action,
            Transition::Connect {
                delay: Duration::ZERO,
                retries: 0,
            }
        );
    }

    #[test]
    fn test_provisioning_adopts_credentials() {
        let action = transition(
            &LinkState::Provisioning,
            0,
            5,
            UNIT,
            &LinkEvent::CredentialsReceived(creds()),
        );
        assert_eq!(action, Transition::AdoptCredentials(creds()));
    }

    #[test]
    fn test_link_down_while_provisioning_is_ignored() {
        let action = transition(&LinkState::Provisioning, 0, 5, UNIT, &LinkEvent::LinkDown);
        assert_eq!(action, Transition::Ignore);
    }

    #[test]
    fn test_link_up_while_connected_is_ignored() {
        let action = transition(
            &LinkState::Connected {
                ip: "10.0.0.2".to_string(),
            },
            0,
            5,
            UNIT,
            &LinkEvent::LinkUp {
                ip: "10.0.0.3".to_string(),
            },
        );
        assert_eq!(action, Transition::Ignore);
    }

    // --- driver loop ---

    /// Link whose connect attempts are counted and answered from a script.
    struct ScriptedLink {
        events: mpsc::Sender<LinkEvent>,
        outcomes: Mutex<Vec<LinkEvent>>,
        attempts: AtomicUsize,
    }

    impl ScriptedLink {
        fn new(events: mpsc::Sender<LinkEvent>, mut outcomes: Vec<LinkEvent>) -> Self {
            outcomes.reverse(); // pop from the back in script order
            Self {
                events,
                outcomes: Mutex::new(outcomes),
                attempts: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl WirelessLink for ScriptedLink {
        fn connect(&self, _creds: &CredentialRecord) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(outcome) = self.outcomes.lock().unwrap().pop() {
                self.events.try_send(outcome).unwrap();
            }
        }
    }

    struct CountingProvisioner {
        starts: AtomicUsize,
    }

    impl CountingProvisioner {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
            }
        }
    }

    impl ProvisioningListener for CountingProvisioner {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_erases_credentials() {
        let store = Arc::new(MemoryStore::with_credentials(creds()));
        let provisioner = Arc::new(CountingProvisioner::new());
        let (event_tx, event_rx) = link_event_channel();
        let link = Arc::new(ScriptedLink::new(event_tx, vec![LinkEvent::AuthFailure; 5]));

        let (manager, state_rx) = ConnectivityManager::new(
            link.clone(),
            provisioner.clone(),
            store.clone(),
            event_rx,
            5,
            UNIT,
            Duration::from_millis(50),
        );

        let result = tokio::time::timeout(Duration::from_secs(2), manager.run())
            .await
            .expect("manager should stop");

        // Exactly 5 failed connect attempts, then provisioning (which times
        // out because nothing answers it), with credentials erased.
        assert_eq!(link.attempts(), 5);
        assert!(store.load_credentials().is_none());
        assert_eq!(provisioner.starts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ConnectivityError::ProvisioningTimeout)));
        assert_eq!(*state_rx.borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_connects_with_stored_credentials() {
        let store = Arc::new(MemoryStore::with_credentials(creds()));
        let (event_tx, event_rx) = link_event_channel();
        let link = Arc::new(ScriptedLink::new(
            event_tx,
            vec![LinkEvent::LinkUp {
                ip: "10.0.0.9".to_string(),
            }],
        ));

        let (manager, mut state_rx) = ConnectivityManager::new(
            link.clone(),
            Arc::new(CountingProvisioner::new()),
            store,
            event_rx,
            5,
            UNIT,
            Duration::from_secs(5),
        );

        let handle = tokio::spawn(manager.run());

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                state_rx.changed().await.unwrap();
                if state_rx.borrow().is_connected() {
                    break;
                }
            }
        })
        .await
        .expect("should reach connected");

        assert_eq!(state_rx.borrow().ip(), Some("10.0.0.9"));
        assert_eq!(link.attempts(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_provisioning_timeout_without_credentials() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(CountingProvisioner::new());
        let (_event_tx, event_rx) = link_event_channel();

        let (manager, _state_rx) = ConnectivityManager::new(
            Arc::new(NeverLink),
            provisioner.clone(),
            store,
            event_rx,
            5,
            UNIT,
            Duration::from_millis(30),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), manager.run())
            .await
            .expect("manager should stop on its own");
        assert!(matches!(result, Err(ConnectivityError::ProvisioningTimeout)));
        assert_eq!(provisioner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provisioned_credentials_are_persisted_then_used() {
        let store = Arc::new(MemoryStore::new());
        let (event_tx, event_rx) = link_event_channel();
        let link = Arc::new(ScriptedLink::new(
            event_tx.clone(),
            vec![LinkEvent::LinkUp {
                ip: "10.0.0.4".to_string(),
            }],
        ));

        let (manager, mut state_rx) = ConnectivityManager::new(
            link.clone(),
            Arc::new(CountingProvisioner::new()),
            store.clone(),
            event_rx,
            5,
            UNIT,
            Duration::from_secs(5),
        );

        let handle = tokio::spawn(manager.run());

        // Simulate the provisioning listener handing over credentials
        event_tx
            .send(LinkEvent::CredentialsReceived(creds()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                state_rx.changed().await.unwrap();
                if state_rx.borrow().is_connected() {
                    break;
                }
            }
        })
        .await
        .expect("should reach connected");

        assert_eq!(store.load_credentials(), Some(creds()));
        assert_eq!(link.attempts(), 1);
        handle.abort();
    }

    /// Link that never reacts; used where the test injects events directly.
    struct NeverLink;

    impl WirelessLink for NeverLink {
        fn connect(&self, _creds: &CredentialRecord) {}
    }
}
