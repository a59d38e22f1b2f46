// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Supervisor
//!
//! Keeps one receive loop running per registered destination across reconnects.
//!
//! The supervisor spawns the loops for the live generation and then waits on that
//! generation's failure signal. When any loop (or the send path) reports the
//! connection dead, it waits for every loop to wind down, asks the recovery
//! coordinator for a fresh generation, and spawns the loops again. Closing the
//! client cancels the stop token, which ends both the loops and the supervisor.

use crate::{
    connection::{ConnectionManager, Generation},
    consumer::{ConsumerHandler, ConsumerLoop, LoopExit},
    errors::MqError,
    recovery::RecoveryCoordinator,
};
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Restarts the receive loops of every registered destination after a reconnect.
pub struct ConsumerSupervisor {
    manager: Arc<ConnectionManager>,
    recovery: Arc<RecoveryCoordinator>,
    handlers: RwLock<HashMap<String, Arc<dyn ConsumerHandler>>>,
    prefetch: AtomicU16,
    receiver_close_timeout: Duration,
    stop: CancellationToken,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerSupervisor {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        recovery: Arc<RecoveryCoordinator>,
        prefetch: u16,
        receiver_close_timeout: Duration,
        stop: CancellationToken,
    ) -> Self {
        ConsumerSupervisor {
            manager,
            recovery,
            handlers: RwLock::new(HashMap::new()),
            prefetch: AtomicU16::new(prefetch.max(1)),
            receiver_close_timeout,
            stop,
            running: Mutex::new(None),
        }
    }

    /// Binds `handler` to `destination`; the last registration for a name wins.
    ///
    /// Takes effect the next time the loops are (re)started.
    pub async fn register(
        &self,
        destination: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
    ) {
        self.handlers
            .write()
            .await
            .insert(destination.into(), handler);
    }

    /// Credit window for receivers opened from now on; `0` is coerced to `1`.
    pub fn set_prefetch(&self, prefetch: u16) {
        self.prefetch.store(prefetch.max(1), Ordering::SeqCst);
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch.load(Ordering::SeqCst)
    }

    /// Spawns the supervisor and returns without waiting for any message.
    pub async fn start(self: &Arc<Self>) -> Result<(), MqError> {
        if self.stop.is_cancelled() {
            return Err(MqError::Stopped);
        }

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(MqError::AlreadyConsuming);
        }

        let Some(generation) = self.manager.current().await else {
            return Err(MqError::NotInitialized);
        };

        *running = Some(tokio::spawn(self.clone().supervise(generation)));
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut generation: Arc<Generation>) {
        loop {
            let epoch = generation.epoch();
            let loops = self.spawn_loops(&generation).await;

            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = generation.failure().wait() => {}
            }

            for exit in join_all(loops).await {
                match exit {
                    Ok(LoopExit::LinkError(err)) => debug!(
                        generation = epoch,
                        error = err.to_string(),
                        "consumer ended on a link error"
                    ),
                    Ok(_) => {}
                    Err(err) => error!(error = err.to_string(), "consumer task panicked"),
                }
            }

            if self.stop.is_cancelled() {
                debug!(generation = epoch, "consumer supervisor stopped");
                return;
            }

            generation = match self.recovery.recover(epoch).await {
                Ok(next) => next,
                Err(MqError::Stopped) => {
                    debug!(generation = epoch, "consumer supervisor stopped during recovery");
                    return;
                }
                Err(err) => {
                    error!(
                        generation = epoch,
                        error = err.to_string(),
                        "consumers cannot be restarted"
                    );
                    return;
                }
            };

            debug!(generation = generation.epoch(), "restarting consumers");
        }
    }

    async fn spawn_loops(&self, generation: &Arc<Generation>) -> Vec<JoinHandle<LoopExit>> {
        let handlers = self.handlers.read().await;
        if handlers.is_empty() {
            warn!(generation = generation.epoch(), "no handler registered");
        }

        let prefetch = self.prefetch();
        handlers
            .iter()
            .map(|(destination, handler)| {
                tokio::spawn(
                    ConsumerLoop {
                        manager: self.manager.clone(),
                        destination: destination.clone(),
                        handler: handler.clone(),
                        generation: generation.clone(),
                        prefetch,
                        stop: self.stop.clone(),
                        receiver_close_timeout: self.receiver_close_timeout,
                    }
                    .run(),
                )
            })
            .collect()
    }

    /// Waits until the supervisor task has finished.
    pub async fn wait(&self) {
        let task = self.running.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "consumer supervisor panicked");
            }
        }
    }

    pub async fn is_consuming(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Credentials, ReconnectConfig},
        connection::Settings,
        consumer::Outcome,
        memory::MemoryBroker,
        publisher::SenderRegistry,
    };
    use tokio::time;

    struct Fixture {
        manager: Arc<ConnectionManager>,
        recovery: Arc<RecoveryCoordinator>,
        supervisor: Arc<ConsumerSupervisor>,
        stop: CancellationToken,
    }

    fn fixture(broker: &MemoryBroker) -> Fixture {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.connector()),
            Settings {
                addresses: vec!["mem:1".into()],
                credentials: Credentials::anonymous(),
                isolate_receive: true,
            },
            Duration::from_millis(100),
        ));
        let stop = CancellationToken::new();
        let reconnect = ReconnectConfig {
            first_ms: 1,
            max_ms: 5,
            ..Default::default()
        };
        let recovery = Arc::new(RecoveryCoordinator::new(
            manager.clone(),
            Arc::new(SenderRegistry::new()),
            &reconnect,
            stop.clone(),
        ));
        let supervisor = Arc::new(ConsumerSupervisor::new(
            manager.clone(),
            recovery.clone(),
            3,
            Duration::from_millis(100),
            stop.clone(),
        ));
        Fixture {
            manager,
            recovery,
            supervisor,
            stop,
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker);

        assert_eq!(f.supervisor.start().await, Err(MqError::NotInitialized));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker);
        f.manager.init().await.unwrap();

        f.supervisor.start().await.unwrap();
        assert_eq!(f.supervisor.start().await, Err(MqError::AlreadyConsuming));
        assert!(f.supervisor.is_consuming().await);

        f.stop.cancel();
        f.supervisor.wait().await;
        assert!(!f.supervisor.is_consuming().await);
    }

    #[tokio::test]
    async fn test_loops_restart_after_connection_loss() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker);
        for destination in ["a", "b", "c"] {
            let handler: Arc<dyn ConsumerHandler> = Arc::new(|_: &[u8]| Outcome::Accept);
            f.supervisor.register(destination, handler).await;
        }
        f.manager.init().await.unwrap();
        f.supervisor.start().await.unwrap();
        eventually(|| broker.receivers_created() == 3).await;

        broker.sever();
        eventually(|| broker.receivers_created() == 6).await;

        assert_eq!(f.recovery.recoveries(), 1);
        assert_eq!(f.manager.generation(), 2);

        broker.publish("b", b"after");
        eventually(|| broker.accepted() == 1).await;

        f.stop.cancel();
        f.supervisor.wait().await;
    }

    #[tokio::test]
    async fn test_prefetch_is_applied_to_receivers() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker);
        let handler: Arc<dyn ConsumerHandler> = Arc::new(|_: &[u8]| Outcome::Accept);
        f.supervisor.register("orders", handler).await;
        f.supervisor.set_prefetch(0);
        assert_eq!(f.supervisor.prefetch(), 1);
        f.supervisor.set_prefetch(7);

        f.manager.init().await.unwrap();
        f.supervisor.start().await.unwrap();
        eventually(|| broker.receivers_created() == 1).await;

        assert_eq!(broker.last_prefetch(), 7);
        f.stop.cancel();
        f.supervisor.wait().await;
    }

    #[tokio::test]
    async fn test_denied_destination_does_not_reconnect() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker);
        broker.deny_destination("forbidden");
        let handler: Arc<dyn ConsumerHandler> = Arc::new(|_: &[u8]| Outcome::Accept);
        f.supervisor.register("forbidden", handler.clone()).await;
        f.supervisor.register("orders", handler).await;

        f.manager.init().await.unwrap();
        f.supervisor.start().await.unwrap();
        eventually(|| broker.receivers_created() == 1).await;
        time::sleep(Duration::from_millis(30)).await;

        assert_eq!(f.manager.generation(), 1);
        assert_eq!(f.recovery.recoveries(), 0);
        f.stop.cancel();
        f.supervisor.wait().await;
    }
}
