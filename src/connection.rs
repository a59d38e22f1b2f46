// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] owns the physical connection(s) to the broker cluster
//! and the failover walk over the configured address list.
//!
//! Every successful `init` produces a new [`Generation`]: the connections and
//! sessions opened for that connection lifetime, tagged with a monotonically
//! increasing epoch and a generation-scoped [`FailureSignal`]. Readers take a cheap
//! `Arc` snapshot of the current generation, so publishers never hold a lock while
//! sending and stale consumer loops can only ever signal their own generation.

use crate::{
    broker::{Connection, Connector, Session},
    config::Credentials,
    errors::MqError,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::RwLock, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of the client's broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or explicitly closed.
    Uninitialized,
    /// Walking the address list.
    Connecting,
    /// Sessions are open.
    Ready,
    /// A consumer or sender observed a fatal I/O error; recovery pending.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// One-shot failure notification scoped to a single generation.
///
/// Signalling is idempotent: any number of consumer loops and publishers may
/// signal the same generation concurrently and only the first has an effect.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    generation: u64,
    token: CancellationToken,
}

impl FailureSignal {
    fn new(generation: u64) -> Self {
        FailureSignal {
            generation,
            token: CancellationToken::new(),
        }
    }

    /// Epoch of the generation this signal belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Marks the generation as failed; returns false if it already was.
    pub fn signal(&self) -> bool {
        let first = !self.token.is_cancelled();
        self.token.cancel();
        first
    }

    /// Whether any holder already reported the generation dead.
    pub fn is_signalled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the generation has been signalled.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Resources owned by one successful connection lifetime.
pub struct Generation {
    epoch: u64,
    address: String,
    connections: Vec<Box<dyn Connection>>,
    send_session: Arc<dyn Session>,
    receive_session: Option<Arc<dyn Session>>,
    failure: FailureSignal,
}

impl Generation {
    /// Strictly increasing id of this connection lifetime, starting at 1.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Broker address this generation is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Session that every sender of this generation is opened on.
    pub fn send_session(&self) -> &Arc<dyn Session> {
        &self.send_session
    }

    /// The dedicated receive session, or the send session when receive is not isolated.
    pub fn receive_session(&self) -> &Arc<dyn Session> {
        self.receive_session.as_ref().unwrap_or(&self.send_session)
    }

    /// Failure signal scoped to this generation.
    ///
    /// # Returns
    /// A signal that only ever reports this generation; signalling it after a
    /// reconnect has no effect on the live connection.
    pub fn failure(&self) -> &FailureSignal {
        &self.failure
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("epoch", &self.epoch)
            .field("address", &self.address)
            .field("isolated", &self.receive_session.is_some())
            .finish()
    }
}

/// Dial settings; replaced only through explicit reconfiguration.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) addresses: Vec<String>,
    pub(crate) credentials: Credentials,
    pub(crate) isolate_receive: bool,
}

type Opened = (Vec<Box<dyn Connection>>, Arc<dyn Session>, Option<Arc<dyn Session>>);

struct Slot {
    state: ConnectionState,
    generation: Option<Arc<Generation>>,
}

/// Owns the broker connections and the address failover algorithm.
///
/// `init` and `close` mutate shared state and are serialized by the recovery
/// coordinator's lock; `current` is a brief read usable from any task.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: RwLock<Settings>,
    slot: RwLock<Slot>,
    address_index: AtomicUsize,
    epoch: AtomicU64,
    close_timeout: Duration,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        settings: Settings,
        close_timeout: Duration,
    ) -> Self {
        ConnectionManager {
            connector,
            settings: RwLock::new(settings),
            slot: RwLock::new(Slot {
                state: ConnectionState::Uninitialized,
                generation: None,
            }),
            address_index: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            close_timeout,
        }
    }

    /// Connects to the first reachable address, starting at the remembered index.
    ///
    /// No-op returning the live generation when already ready. Each call tries
    /// every address once, wrapping around to the front of the list; when all of
    /// them fail the last error is returned and the caller decides whether to retry.
    pub async fn init(&self) -> Result<Arc<Generation>, MqError> {
        {
            let slot = self.slot.read().await;
            if slot.state == ConnectionState::Ready {
                if let Some(generation) = &slot.generation {
                    return Ok(generation.clone());
                }
            }
        }

        let settings = self.settings.read().await.clone();
        if settings.addresses.is_empty() {
            return Err(MqError::NoAddresses);
        }

        let stale = {
            let mut slot = self.slot.write().await;
            slot.state = ConnectionState::Connecting;
            slot.generation.take()
        };
        if let Some(stale) = stale {
            stale.failure.signal();
            let _ = close_generation(&stale, self.close_timeout).await;
        }

        let total = settings.addresses.len();
        let start = self.address_index.load(Ordering::SeqCst) % total;
        let mut last_err = MqError::NoAddresses;

        for offset in 0..total {
            let index = (start + offset) % total;
            let address = &settings.addresses[index];

            match self.open(address, &settings).await {
                Ok((connections, send_session, receive_session)) => {
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    self.address_index.store(index, Ordering::SeqCst);

                    let generation = Arc::new(Generation {
                        epoch,
                        address: address.clone(),
                        connections,
                        send_session,
                        receive_session,
                        failure: FailureSignal::new(epoch),
                    });

                    let mut slot = self.slot.write().await;
                    slot.state = ConnectionState::Ready;
                    slot.generation = Some(generation.clone());

                    debug!(
                        adapter = self.connector.name(),
                        address = address.as_str(),
                        generation = epoch,
                        "broker connection ready"
                    );
                    return Ok(generation);
                }
                Err(err) => {
                    warn!(
                        adapter = self.connector.name(),
                        address = address.as_str(),
                        error = err.to_string(),
                        "failure to connect"
                    );
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// Dials `address` and opens the session(s); closes whatever was opened on failure.
    async fn open(&self, address: &str, settings: &Settings) -> Result<Opened, MqError> {
        let mut connections: Vec<Box<dyn Connection>> = vec![];
        let mut sessions: Vec<Arc<dyn Session>> = vec![];

        let dials = if settings.isolate_receive { 2 } else { 1 };
        let mut outcome = Ok(());

        for _ in 0..dials {
            let conn = match self.connector.dial(address, &settings.credentials).await {
                Ok(conn) => conn,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            let session = conn.new_session().await;
            connections.push(conn);
            match session {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if let Err(err) = outcome {
            for session in &sessions {
                let _ = time::timeout(self.close_timeout, session.close()).await;
            }
            for conn in &connections {
                let _ = time::timeout(self.close_timeout, conn.close()).await;
            }
            return Err(err);
        }

        let mut sessions = sessions.into_iter();
        let send_session = sessions.next().ok_or(MqError::InternalError)?;
        Ok((connections, send_session, sessions.next()))
    }

    /// Best-effort close of every session and connection of the current generation.
    ///
    /// Attempts every resource and aggregates individual failures into one error.
    pub async fn close(&self) -> Result<(), MqError> {
        let generation = {
            let mut slot = self.slot.write().await;
            slot.state = ConnectionState::Uninitialized;
            slot.generation.take()
        };

        let Some(generation) = generation else {
            return Ok(());
        };

        generation.failure.signal();
        let failures = close_generation(&generation, self.close_timeout).await;
        if failures.is_empty() {
            debug!(generation = generation.epoch, "broker connection closed");
            return Ok(());
        }

        Err(MqError::CloseError(failures.join("; ")))
    }

    /// Moves a ready generation to degraded; ignored for superseded generations.
    ///
    /// # Parameters
    /// * `epoch` - Generation the caller saw fail
    pub async fn mark_degraded(&self, epoch: u64) {
        let mut slot = self.slot.write().await;
        let current = slot.generation.as_ref().map(|g| g.epoch);
        if slot.state == ConnectionState::Ready && current == Some(epoch) {
            warn!(generation = epoch, "broker connection degraded");
            slot.state = ConnectionState::Degraded;
        }
    }

    /// Snapshot of the live generation, if any.
    pub async fn current(&self) -> Option<Arc<Generation>> {
        self.slot.read().await.generation.clone()
    }

    /// Current lifecycle state.
    ///
    /// # Returns
    /// `Degraded` from the moment a consumer or sender reports the live generation
    /// dead until the recovery closes it, `Connecting` while walking the addresses.
    pub async fn state(&self) -> ConnectionState {
        self.slot.read().await.state
    }

    /// Epoch of the most recent successful `init`; `0` before the first one.
    pub fn generation(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Index of the address the current (or last) connection was made to.
    pub fn address_index(&self) -> usize {
        self.address_index.load(Ordering::SeqCst)
    }

    pub(crate) async fn set_addresses(&self, addresses: Vec<String>) {
        self.settings.write().await.addresses = addresses;
        self.address_index.store(0, Ordering::SeqCst);
    }

    pub(crate) async fn set_credentials(&self, credentials: Credentials) {
        self.settings.write().await.credentials = credentials;
    }
}

async fn close_generation(generation: &Generation, timeout: Duration) -> Vec<String> {
    let mut failures = vec![];

    let mut sessions = vec![generation.send_session.clone()];
    if let Some(receive) = &generation.receive_session {
        sessions.push(receive.clone());
    }

    for session in sessions {
        match time::timeout(timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failures.push(err.to_string()),
            Err(_) => failures.push("session close timed out".to_owned()),
        }
    }

    for conn in &generation.connections {
        match time::timeout(timeout, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failures.push(err.to_string()),
            Err(_) => failures.push("connection close timed out".to_owned()),
        }
    }

    failures
}
