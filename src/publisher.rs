// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Outbound side of the client:
//!
//! - [`SenderRegistry`] caches one outbound link per destination for the current
//!   connection generation and rebuilds known links after a reconnect
//! - [`Publisher`] builds the message envelope, applies the send timeout, and on a
//!   dead connection runs recovery inline before retrying exactly once
//!
//! Trace context is propagated in the message headers.

use crate::{
    broker::{Headers, OutboundMessage, Sender},
    connection::{ConnectionManager, Generation},
    errors::MqError,
    otel,
    recovery::RecoveryCoordinator,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, time};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct SenderCache {
    epoch: u64,
    senders: HashMap<String, Arc<dyn Sender>>,
    known: BTreeSet<String>,
}

/// Lazily created outbound links, one per destination per generation.
///
/// The lock is held only for the lookup (and creation, on a miss), never for the
/// send itself, so steady-state publishers to different destinations don't queue
/// behind each other.
#[derive(Default)]
pub struct SenderRegistry {
    cache: Mutex<SenderCache>,
}

impl SenderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached sender for `destination` or opens one on the generation's
    /// send session. Link creation failures are returned, never retried here.
    pub async fn get_or_create(
        &self,
        generation: &Generation,
        destination: &str,
    ) -> Result<Arc<dyn Sender>, MqError> {
        let mut cache = self.cache.lock().await;

        if generation.epoch() < cache.epoch {
            return Err(MqError::ConnectionClosed(format!(
                "generation {} superseded by {}",
                generation.epoch(),
                cache.epoch
            )));
        }
        if generation.epoch() > cache.epoch {
            cache.senders.clear();
            cache.epoch = generation.epoch();
        }

        if let Some(sender) = cache.senders.get(destination) {
            return Ok(sender.clone());
        }

        let sender = generation.send_session().new_sender(destination).await?;
        cache.senders.insert(destination.to_owned(), sender.clone());
        cache.known.insert(destination.to_owned());

        debug!(destination, generation = generation.epoch(), "sender created");
        Ok(sender)
    }

    /// Drops every cached sender without closing it; destination names are kept.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.senders.clear();
    }

    /// Eagerly reopens a sender for every destination used before invalidation.
    ///
    /// Best-effort: a destination that fails is logged and left to lazy creation.
    pub async fn rebuild_known_senders(&self, generation: &Generation) {
        let mut cache = self.cache.lock().await;
        cache.epoch = generation.epoch();
        cache.senders.clear();

        let known: Vec<String> = cache.known.iter().cloned().collect();
        for destination in known {
            match generation.send_session().new_sender(&destination).await {
                Ok(sender) => {
                    cache.senders.insert(destination, sender);
                }
                Err(err) => warn!(
                    destination = destination.as_str(),
                    generation = generation.epoch(),
                    error = err.to_string(),
                    "failure to rebuild sender"
                ),
            }
        }
    }

    /// Closes and drops every cached sender, returning the failures.
    pub async fn close_all(&self, timeout: Duration) -> Vec<String> {
        let senders: Vec<(String, Arc<dyn Sender>)> = {
            let mut cache = self.cache.lock().await;
            cache.senders.drain().collect()
        };

        let mut failures = vec![];
        for (destination, sender) in senders {
            match time::timeout(timeout, sender.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(format!("{destination}: {err}")),
                Err(_) => failures.push(format!("{destination}: sender close timed out")),
            }
        }
        failures
    }

    /// Number of senders open for the current generation.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.senders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every destination a sender was ever opened for.
    pub async fn known_destinations(&self) -> Vec<String> {
        self.cache.lock().await.known.iter().cloned().collect()
    }
}

/// Client-facing send path.
///
/// Shares the connection manager, sender registry and recovery coordinator with
/// the consumer side, so a failure seen by either side costs one reconnect.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    senders: Arc<SenderRegistry>,
    recovery: Arc<RecoveryCoordinator>,
    send_timeout: Duration,
}

impl Publisher {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        senders: Arc<SenderRegistry>,
        recovery: Arc<RecoveryCoordinator>,
        send_timeout: Duration,
    ) -> Self {
        Publisher {
            manager,
            senders,
            recovery,
            send_timeout,
        }
    }

    /// Publishes `payload` to `destination`, optionally delayed by `delay_millis`.
    ///
    /// A connection-class failure marks the generation degraded and failed,
    /// reconnects in the calling task, then retries the send once.
    ///
    /// # Parameters
    /// * `destination` - Queue name
    /// * `payload` - Message body, sent as is
    /// * `delay_millis` - Delivery delay; `0` or negative sends immediately
    ///
    /// # Returns
    /// The error of the retry, or the first error when it is not a connection
    /// failure.
    pub async fn send(
        &self,
        destination: &str,
        payload: &[u8],
        delay_millis: i64,
    ) -> Result<(), MqError> {
        let (epoch, result) = self.try_send(destination, payload, delay_millis).await;

        match result {
            Err(err) if err.is_transient() => {
                warn!(
                    destination,
                    generation = epoch,
                    error = err.to_string(),
                    "send failed on a dead connection, recovering"
                );

                if let Some(generation) = self.manager.current().await {
                    if generation.epoch() == epoch {
                        self.manager.mark_degraded(epoch).await;
                        generation.failure().signal();
                    }
                }

                self.recovery.recover(epoch).await?;
                self.try_send(destination, payload, delay_millis).await.1
            }
            other => other,
        }
    }

    async fn try_send(
        &self,
        destination: &str,
        payload: &[u8],
        delay_millis: i64,
    ) -> (u64, Result<(), MqError>) {
        let Some(generation) = self.manager.current().await else {
            let epoch = self.manager.generation();
            if epoch == 0 {
                return (epoch, Err(MqError::NotInitialized));
            }
            // Another task is between close and init of a recovery.
            return (
                epoch,
                Err(MqError::ConnectionClosed("recovery in progress".to_owned())),
            );
        };
        let epoch = generation.epoch();

        let sender = match self.senders.get_or_create(&generation, destination).await {
            Ok(sender) => sender,
            Err(err) => return (epoch, Err(err)),
        };

        let message = envelope(payload, delay_millis);
        let result = match time::timeout(self.send_timeout, sender.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(MqError::SendTimeout(self.send_timeout.as_millis() as u64)),
        };

        (epoch, result)
    }
}

/// Durable envelope carrying a fresh message id and the current trace context.
fn envelope(payload: &[u8], delay_millis: i64) -> OutboundMessage {
    let mut headers = Headers::default();
    otel::inject_context(&Context::current(), &mut headers);

    OutboundMessage::new(payload.to_vec())
        .with_message_id(Uuid::new_v4().to_string())
        .with_headers(headers)
        .with_delay_millis(delay_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ClientConfig, Credentials},
        connection::{ConnectionState, Settings},
        memory::MemoryBroker,
    };
    use tokio_util::sync::CancellationToken;

    async fn setup(broker: &MemoryBroker) -> (Arc<ConnectionManager>, Arc<SenderRegistry>, Publisher) {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.connector()),
            Settings {
                addresses: vec!["mem:1".into()],
                credentials: Credentials::anonymous(),
                isolate_receive: false,
            },
            Duration::from_millis(100),
        ));
        let senders = Arc::new(SenderRegistry::new());
        let mut cfg = ClientConfig::default();
        cfg.reconnect.first_ms = 1;
        cfg.reconnect.max_ms = 5;
        let recovery = Arc::new(RecoveryCoordinator::new(
            manager.clone(),
            senders.clone(),
            &cfg.reconnect,
            CancellationToken::new(),
        ));
        let publisher = Publisher::new(
            manager.clone(),
            senders.clone(),
            recovery,
            Duration::from_millis(200),
        );
        (manager, senders, publisher)
    }

    #[test]
    fn test_envelope_is_durable_with_id() {
        let msg = envelope(b"abc", 250);
        assert!(msg.durable);
        assert_eq!(msg.payload, b"abc");
        assert_eq!(msg.delay, Some(Duration::from_millis(250)));
        assert!(Uuid::parse_str(&msg.message_id).is_ok());
        assert_ne!(msg.message_id, envelope(b"abc", 0).message_id);
    }

    #[tokio::test]
    async fn test_send_before_init_is_rejected() {
        let broker = MemoryBroker::new();
        let (_, _, publisher) = setup(&broker).await;

        assert_eq!(
            publisher.send("orders", b"a", 0).await,
            Err(MqError::NotInitialized)
        );
        assert_eq!(broker.dial_attempts(), 0);
    }

    #[tokio::test]
    async fn test_sender_reused_within_generation() {
        let broker = MemoryBroker::new();
        let (manager, senders, publisher) = setup(&broker).await;
        manager.init().await.unwrap();

        publisher.send("orders", b"a", 0).await.unwrap();
        publisher.send("orders", b"b", 0).await.unwrap();

        assert_eq!(broker.senders_created(), 1);
        assert_eq!(senders.len().await, 1);
        assert_eq!(broker.queue_depth("orders"), 2);
    }

    #[tokio::test]
    async fn test_generation_bump_creates_exactly_one_new_sender() {
        let broker = MemoryBroker::new();
        let (manager, senders, publisher) = setup(&broker).await;
        manager.init().await.unwrap();
        publisher.send("orders", b"a", 0).await.unwrap();

        manager.close().await.unwrap();
        senders.invalidate().await;
        manager.init().await.unwrap();

        publisher.send("orders", b"b", 0).await.unwrap();
        publisher.send("orders", b"c", 0).await.unwrap();

        assert_eq!(broker.senders_created(), 2);
        assert_eq!(senders.known_destinations().await, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_link_error_is_surfaced_without_reconnect() {
        let broker = MemoryBroker::new();
        let (manager, _, publisher) = setup(&broker).await;
        manager.init().await.unwrap();
        broker.deny_destination("forbidden");

        let err = publisher.send("forbidden", b"a", 0).await.unwrap_err();

        assert!(matches!(err, MqError::CreatingSenderError(ref d, _) if d == "forbidden"));
        assert_eq!(manager.generation(), 1);
        assert_eq!(broker.dial_attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_recovers_inline_and_retries_once() {
        let broker = MemoryBroker::new();
        let (manager, senders, publisher) = setup(&broker).await;
        manager.init().await.unwrap();
        publisher.send("orders", b"a", 0).await.unwrap();

        broker.sever();
        broker.fail_next_dials(1);
        publisher.send("orders", b"b", 0).await.unwrap();

        assert_eq!(manager.generation(), 2);
        assert_eq!(broker.queue_depth("orders"), 2);
        // rebuilt eagerly during recovery, then reused by the retry
        assert_eq!(broker.senders_created(), 2);
        assert_eq!(senders.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_send_degrades_before_recovery_starts() {
        let broker = MemoryBroker::new();
        let (manager, _, publisher) = setup(&broker).await;
        let publisher = Arc::new(publisher);
        manager.init().await.unwrap();
        publisher.send("orders", b"a", 0).await.unwrap();

        // another recovery holds the lock, so the send waits right after signalling
        let guard = publisher.recovery.exclusive().await;
        broker.sever();
        let task = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.send("orders", b"b", 0).await }
        });

        for _ in 0..200 {
            if manager.state().await == ConnectionState::Degraded {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.state().await, ConnectionState::Degraded);
        assert_eq!(manager.generation(), 1);

        drop(guard);
        task.await.unwrap().unwrap();
        assert_eq!(manager.state().await, ConnectionState::Ready);
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn test_stalled_broker_times_out_and_is_retried() {
        let broker = MemoryBroker::new();
        let (manager, _, publisher) = setup(&broker).await;
        manager.init().await.unwrap();
        broker.stall_sends(true);

        let err = publisher.send("orders", b"a", 0).await.unwrap_err();

        assert_eq!(err, MqError::SendTimeout(200));
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_skips_failing_destination() {
        let broker = MemoryBroker::new();
        let (manager, senders, publisher) = setup(&broker).await;
        let first = manager.init().await.unwrap();
        publisher.send("orders", b"a", 0).await.unwrap();
        publisher.send("audit", b"a", 0).await.unwrap();
        senders.invalidate().await;
        assert!(senders.is_empty().await);

        manager.close().await.unwrap();
        drop(first);
        let second = manager.init().await.unwrap();
        broker.deny_destination("audit");
        senders.rebuild_known_senders(&second).await;

        assert_eq!(senders.len().await, 1);
        assert_eq!(senders.known_destinations().await, vec!["audit", "orders"]);
    }
}
