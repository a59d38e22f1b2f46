// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing the capability traits, for tests and local
//! development. It behaves like a real broker where the client core cares:
//!
//! - **FIFO queues** per destination, created on first use
//! - **Delayed delivery**: delayed messages become visible after the delay
//! - **Credit**: a receiver holds at most `prefetch` unsettled messages
//! - **Redelivery**: rejected messages, and unsettled ones whose connection died,
//!   go back to the front of their queue
//!
//! It also supports fault injection: unreachable addresses, failing dials, stalled
//! sends, denied destinations, and [`MemoryBroker::sever`], which kills every live
//! connection at once.

use crate::{
    broker::{
        Acknowledger, Connection, Connector, Delivery, Headers, OutboundMessage, Receiver, Sender,
        Session,
    },
    config::Credentials,
    errors::MqError,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: Headers,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Counters {
    dial_attempts: AtomicUsize,
    connections_opened: AtomicUsize,
    senders_created: AtomicUsize,
    receivers_created: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    last_prefetch: AtomicUsize,
}

#[derive(Debug)]
struct BrokerState {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    network: Mutex<CancellationToken>,
    unreachable: Mutex<HashSet<String>>,
    denied: Mutex<HashSet<String>>,
    fail_next_dials: AtomicUsize,
    stall_sends: AtomicBool,
    last_anonymous: Mutex<Option<bool>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to one in-memory broker; clones see the same queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                network: Mutex::new(CancellationToken::new()),
                unreachable: Mutex::new(HashSet::new()),
                denied: Mutex::new(HashSet::new()),
                fail_next_dials: AtomicUsize::new(0),
                stall_sends: AtomicBool::new(false),
                last_anonymous: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// A connector dialing this broker; every address not marked unreachable works.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Enqueues a message directly, bypassing any client.
    pub fn publish(&self, destination: &str, payload: &[u8]) {
        self.enqueue(
            destination,
            StoredMessage {
                payload: payload.to_vec(),
                headers: Headers::default(),
            },
            false,
        );
    }

    /// Closes every live connection; later dials get a fresh network.
    pub fn sever(&self) {
        let mut network = lock(&self.state.network);
        network.cancel();
        *network = CancellationToken::new();
        debug!("memory broker severed all connections");
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = lock(&self.state.unreachable);
        if unreachable {
            set.insert(address.to_owned());
        } else {
            set.remove(address);
        }
    }

    /// Makes the next `n` dials fail regardless of address.
    pub fn fail_next_dials(&self, n: usize) {
        self.state.fail_next_dials.store(n, Ordering::SeqCst);
    }

    /// While set, sends never complete until their connection dies.
    pub fn stall_sends(&self, stall: bool) {
        self.state.stall_sends.store(stall, Ordering::SeqCst);
    }

    /// Refuses sender and receiver links for `destination`.
    pub fn deny_destination(&self, destination: &str) {
        lock(&self.state.denied).insert(destination.to_owned());
    }

    pub fn queue_depth(&self, destination: &str) -> usize {
        lock(&self.state.queues)
            .get(destination)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn dial_attempts(&self) -> usize {
        self.state.counters.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.counters.connections_opened.load(Ordering::SeqCst)
    }

    pub fn senders_created(&self) -> usize {
        self.state.counters.senders_created.load(Ordering::SeqCst)
    }

    pub fn receivers_created(&self) -> usize {
        self.state.counters.receivers_created.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.state.counters.accepted.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.state.counters.rejected.load(Ordering::SeqCst)
    }

    /// Whether the most recent dial presented anonymous credentials.
    pub fn last_anonymous(&self) -> Option<bool> {
        *lock(&self.state.last_anonymous)
    }

    /// Prefetch requested by the most recently opened receiver.
    pub fn last_prefetch(&self) -> usize {
        self.state.counters.last_prefetch.load(Ordering::SeqCst)
    }

    fn enqueue(&self, destination: &str, message: StoredMessage, front: bool) {
        let mut queues = lock(&self.state.queues);
        let queue = queues.entry(destination.to_owned()).or_default();
        if front {
            queue.messages.push_front(message);
        } else {
            queue.messages.push_back(message);
        }
        queue.notify.notify_one();
    }

    /// Pops the next message, or hands back the queue's notifier when empty.
    fn dequeue(&self, destination: &str) -> Result<StoredMessage, Arc<Notify>> {
        let mut queues = lock(&self.state.queues);
        let queue = queues.entry(destination.to_owned()).or_default();
        queue.messages.pop_front().ok_or_else(|| queue.notify.clone())
    }

    fn is_denied(&self, destination: &str) -> bool {
        lock(&self.state.denied).contains(destination)
    }
}

/// [`Connector`] for a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection>, MqError> {
        let state = &self.broker.state;
        state.counters.dial_attempts.fetch_add(1, Ordering::SeqCst);
        *lock(&state.last_anonymous) = Some(credentials.is_anonymous());

        if lock(&state.unreachable).contains(address) {
            return Err(MqError::DialError(
                address.to_owned(),
                "connection refused".to_owned(),
            ));
        }

        let injected = state
            .fail_next_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MqError::DialError(
                address.to_owned(),
                "injected dial failure".to_owned(),
            ));
        }

        state.counters.connections_opened.fetch_add(1, Ordering::SeqCst);
        let alive = lock(&state.network).child_token();
        Ok(Box::new(MemoryConnection {
            broker: self.broker.clone(),
            alive,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    alive: CancellationToken,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn new_session(&self) -> Result<Arc<dyn Session>, MqError> {
        if self.alive.is_cancelled() {
            return Err(MqError::ConnectionClosed("connection is closed".to_owned()));
        }
        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            alive: self.alive.child_token(),
        }))
    }

    async fn close(&self) -> Result<(), MqError> {
        self.alive.cancel();
        Ok(())
    }
}

struct MemorySession {
    broker: MemoryBroker,
    alive: CancellationToken,
}

#[async_trait]
impl Session for MemorySession {
    async fn new_sender(&self, destination: &str) -> Result<Arc<dyn Sender>, MqError> {
        if self.alive.is_cancelled() {
            return Err(MqError::ConnectionClosed("session is closed".to_owned()));
        }
        if self.broker.is_denied(destination) {
            return Err(MqError::CreatingSenderError(
                destination.to_owned(),
                "access refused".to_owned(),
            ));
        }

        self.broker
            .state
            .counters
            .senders_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySender {
            broker: self.broker.clone(),
            destination: destination.to_owned(),
            alive: self.alive.child_token(),
        }))
    }

    async fn new_receiver(
        &self,
        destination: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Receiver>, MqError> {
        if self.alive.is_cancelled() {
            return Err(MqError::ConnectionClosed("session is closed".to_owned()));
        }
        if self.broker.is_denied(destination) {
            return Err(MqError::CreatingReceiverError(
                destination.to_owned(),
                "access refused".to_owned(),
            ));
        }

        let counters = &self.broker.state.counters;
        counters.receivers_created.fetch_add(1, Ordering::SeqCst);
        counters
            .last_prefetch
            .store(prefetch as usize, Ordering::SeqCst);

        Ok(Box::new(MemoryReceiver {
            broker: self.broker.clone(),
            destination: destination.to_owned(),
            session: self.alive.clone(),
            alive: self.alive.child_token(),
            credit: Arc::new(Semaphore::new(prefetch.max(1) as usize)),
        }))
    }

    async fn close(&self) -> Result<(), MqError> {
        self.alive.cancel();
        Ok(())
    }
}

struct MemorySender {
    broker: MemoryBroker,
    destination: String,
    alive: CancellationToken,
}

#[async_trait]
impl Sender for MemorySender {
    async fn send(&self, message: OutboundMessage) -> Result<(), MqError> {
        if self.alive.is_cancelled() {
            return Err(MqError::ConnectionClosed("link is closed".to_owned()));
        }
        if self.broker.state.stall_sends.load(Ordering::SeqCst) {
            self.alive.cancelled().await;
            return Err(MqError::ConnectionClosed("link is closed".to_owned()));
        }

        let stored = StoredMessage {
            payload: message.payload,
            headers: message.headers,
        };
        match message.delay {
            Some(delay) => {
                let broker = self.broker.clone();
                let destination = self.destination.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    broker.enqueue(&destination, stored, false);
                });
            }
            None => self.broker.enqueue(&self.destination, stored, false),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MqError> {
        self.alive.cancel();
        Ok(())
    }
}

struct MemoryReceiver {
    broker: MemoryBroker,
    destination: String,
    session: CancellationToken,
    alive: CancellationToken,
    credit: Arc<Semaphore>,
}

#[async_trait]
impl Receiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Delivery, MqError> {
        let permit = tokio::select! {
            _ = self.alive.cancelled() => None,
            permit = self.credit.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            return Err(MqError::ConnectionClosed("link is closed".to_owned()));
        };

        loop {
            if self.alive.is_cancelled() {
                return Err(MqError::ConnectionClosed("link is closed".to_owned()));
            }

            match self.broker.dequeue(&self.destination) {
                Ok(message) => {
                    let delivery = Delivery::new(
                        message.payload.clone(),
                        message.headers.clone(),
                        Box::new(MemoryAcker {
                            broker: self.broker.clone(),
                            destination: self.destination.clone(),
                            session: self.session.clone(),
                            message: Mutex::new(Some(message)),
                            _permit: permit,
                        }),
                    );
                    return Ok(delivery);
                }
                Err(notify) => {
                    tokio::select! {
                        _ = self.alive.cancelled() => {}
                        _ = notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), MqError> {
        self.alive.cancel();
        Ok(())
    }
}

/// Settles one in-memory delivery; an unsettled delivery is requeued when dropped.
struct MemoryAcker {
    broker: MemoryBroker,
    destination: String,
    session: CancellationToken,
    message: Mutex<Option<StoredMessage>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn take(&self) -> Result<StoredMessage, MqError> {
        if self.session.is_cancelled() {
            return Err(MqError::ConnectionClosed("session is closed".to_owned()));
        }
        lock(&self.message).take().ok_or(MqError::InternalError)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn accept(&self) -> Result<(), MqError> {
        self.take()
            .map_err(|err| MqError::AckMessageError(err.to_string()))?;
        self.broker
            .state
            .counters
            .accepted
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<(), MqError> {
        let message = self
            .take()
            .map_err(|err| MqError::NackMessageError(err.to_string()))?;
        self.broker
            .state
            .counters
            .rejected
            .fetch_add(1, Ordering::SeqCst);
        self.broker.enqueue(&self.destination, message, true);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = lock(&self.message).take() {
            self.broker.enqueue(&self.destination, message, true);
        }
    }
}
