// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery Coordinator
//!
//! Serializes reconnects. Consumer loops and publishers that observe a dead
//! connection all funnel into [`RecoveryCoordinator::recover`] with the generation
//! they saw fail; the first caller reconnects while the rest wait on the lock and
//! then return the generation it produced, so one failure costs one reconnect.
//!
//! Reconnect never gives up on I/O errors. Attempts are spaced by
//! [`BackoffPolicy`] and every failure is logged, with an error-level alarm every
//! `alarm_after_attempts` consecutive failures.

use crate::{
    backoff::BackoffPolicy,
    config::ReconnectConfig,
    connection::{ConnectionManager, ConnectionState, Generation},
    errors::MqError,
    publisher::SenderRegistry,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{Mutex, MutexGuard},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Single point through which every reconnect happens.
pub struct RecoveryCoordinator {
    manager: Arc<ConnectionManager>,
    senders: Arc<SenderRegistry>,
    backoff: BackoffPolicy,
    alarm_after: u32,
    stop: CancellationToken,
    lock: Mutex<()>,
    recoveries: AtomicU64,
}

impl RecoveryCoordinator {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        senders: Arc<SenderRegistry>,
        reconnect: &ReconnectConfig,
        stop: CancellationToken,
    ) -> Self {
        RecoveryCoordinator {
            manager,
            senders,
            backoff: BackoffPolicy::from(reconnect),
            alarm_after: reconnect.alarm_after_attempts,
            stop,
            lock: Mutex::new(()),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Exclusive access to connection state outside of a recovery
    /// (first `init`, reconfiguration, shutdown).
    pub(crate) async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Replaces the connection of generation `observed` with a fresh one.
    ///
    /// Returns immediately with the live generation when another caller already
    /// recovered past `observed`. Fails only when the client is stopped or the
    /// configuration itself is unusable.
    pub async fn recover(&self, observed: u64) -> Result<Arc<Generation>, MqError> {
        let _guard = self.lock.lock().await;

        if self.stop.is_cancelled() {
            return Err(MqError::Stopped);
        }

        if self.manager.generation() != observed
            && self.manager.state().await == ConnectionState::Ready
        {
            if let Some(generation) = self.manager.current().await {
                debug!(
                    observed,
                    generation = generation.epoch(),
                    "connection already recovered"
                );
                return Ok(generation);
            }
        }

        self.recoveries.fetch_add(1, Ordering::SeqCst);
        warn!(generation = observed, "recovering broker connection");

        self.manager.mark_degraded(observed).await;
        if let Err(err) = self.manager.close().await {
            debug!(error = err.to_string(), "stale resources closed with errors");
        }
        self.senders.invalidate().await;

        let mut attempt: u32 = 0;
        let generation = loop {
            match self.manager.init().await {
                Ok(generation) => break generation,
                Err(err) if err.is_configuration() => {
                    error!(error = err.to_string(), "reconnect impossible with current configuration");
                    return Err(err);
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(attempt, error = err.to_string(), "reconnect attempt failed");
                    if self.alarm_after > 0 && attempt % self.alarm_after == 0 {
                        error!(attempt, "broker unreachable, still retrying");
                    }

                    let delay = self.backoff.next(attempt - 1);
                    tokio::select! {
                        _ = self.stop.cancelled() => return Err(MqError::Stopped),
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        };

        self.senders.rebuild_known_senders(&generation).await;

        debug!(
            generation = generation.epoch(),
            address = generation.address(),
            attempts = attempt + 1,
            "broker connection recovered"
        );
        Ok(generation)
    }

    /// Number of recoveries that actually reconnected.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Credentials, connection::Settings, memory::MemoryBroker};
    use std::time::Duration;

    type Fixture = (
        Arc<ConnectionManager>,
        Arc<RecoveryCoordinator>,
        CancellationToken,
    );

    fn coordinator(broker: &MemoryBroker, addresses: &[&str]) -> Fixture {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.connector()),
            Settings {
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                credentials: Credentials::anonymous(),
                isolate_receive: true,
            },
            Duration::from_millis(100),
        ));
        let reconnect = ReconnectConfig {
            first_ms: 1,
            max_ms: 10,
            alarm_after_attempts: 2,
            ..Default::default()
        };
        let stop = CancellationToken::new();
        let recovery = Arc::new(RecoveryCoordinator::new(
            manager.clone(),
            Arc::new(SenderRegistry::new()),
            &reconnect,
            stop.clone(),
        ));
        (manager, recovery, stop)
    }

    #[tokio::test]
    async fn test_concurrent_signals_collapse_into_one_recovery() {
        let broker = MemoryBroker::new();
        let (manager, recovery, _) = coordinator(&broker, &["mem:1"]);
        let first = manager.init().await.unwrap();
        broker.sever();
        let dials_before = broker.dial_attempts();

        let mut tasks = vec![];
        for _ in 0..8 {
            let recovery = recovery.clone();
            let epoch = first.epoch();
            tasks.push(tokio::spawn(async move { recovery.recover(epoch).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().epoch(), 2);
        }

        assert_eq!(recovery.recoveries(), 1);
        assert_eq!(manager.generation(), 2);
        // one isolated send/receive pair
        assert_eq!(broker.dial_attempts() - dials_before, 2);
    }

    #[tokio::test]
    async fn test_retries_until_broker_returns() {
        let broker = MemoryBroker::new();
        let (manager, recovery, _) = coordinator(&broker, &["mem:1", "mem:2"]);
        manager.init().await.unwrap();
        broker.sever();
        broker.fail_next_dials(5);

        let generation = recovery.recover(1).await.unwrap();

        assert_eq!(generation.epoch(), 2);
        assert_eq!(manager.state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_loop() {
        let broker = MemoryBroker::new();
        let (manager, recovery, stop) = coordinator(&broker, &["mem:1"]);
        manager.init().await.unwrap();
        broker.set_unreachable("mem:1", true);

        let task = tokio::spawn({
            let recovery = recovery.clone();
            async move { recovery.recover(1).await }
        });
        time::sleep(Duration::from_millis(30)).await;
        stop.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), MqError::Stopped);
        assert_eq!(recovery.recover(1).await.unwrap_err(), MqError::Stopped);
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried() {
        let broker = MemoryBroker::new();
        let (manager, recovery, _) = coordinator(&broker, &["mem:1"]);
        manager.init().await.unwrap();
        manager.set_addresses(vec![]).await;

        assert_eq!(recovery.recover(1).await.unwrap_err(), MqError::NoAddresses);
    }
}
