// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message-Queue Client
//!
//! [`MqClient`] ties the pieces together: one connection manager, one sender
//! registry, one recovery coordinator and one consumer supervisor sharing the same
//! stop signal. Clones share the same connections, so build one client at startup
//! and hand clones to the code that publishes or consumes.
//!
//! ```ignore
//! let client = MqClient::builder(AmqpConnector::new("billing"))
//!     .addresses(["rabbit-1:5672", "rabbit-2:5672"])
//!     .credentials("billing", "secret")
//!     .prefetch(10)
//!     .register_handler("orders", Arc::new(|payload: &[u8]| Outcome::from(handle(payload))))
//!     .build()
//!     .await;
//!
//! client.init().await?;
//! client.start_consuming().await?;
//! client.send("audit", b"order accepted", 0).await?;
//! ```

use crate::{
    broker::Connector,
    config::{ClientConfig, Credentials},
    connection::{ConnectionManager, ConnectionState, Settings},
    consumer::ConsumerHandler,
    dispatcher::ConsumerSupervisor,
    errors::MqError,
    publisher::{Publisher, SenderRegistry},
    recovery::RecoveryCoordinator,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builder for [`MqClient`].
pub struct ClientBuilder {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    handlers: Vec<(String, Arc<dyn ConsumerHandler>)>,
}

impl ClientBuilder {
    /// Replaces the whole configuration; later builder calls still apply on top.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker addresses, tried in order with wrap-around on every connect.
    ///
    /// # Parameters
    /// * `addresses` - `host:port[/vhost]` entries or full broker URIs
    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Username and password; if either is empty the client connects anonymously.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self.config.anonymous = false;
        self
    }

    /// Connects without credentials.
    pub fn anonymous(mut self) -> Self {
        self.config.username.clear();
        self.config.password.clear();
        self.config.anonymous = true;
        self
    }

    /// Unsettled deliveries allowed per receiver; `0` is treated as `1`.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// Upper bound on one send attempt; expiry counts as a dead connection.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Dials a second connection dedicated to receiving.
    pub fn isolate_receive(mut self, isolate: bool) -> Self {
        self.config.isolate_receive = isolate;
        self
    }

    /// Binds `handler` to `destination`; the last registration for a name wins.
    pub fn register_handler(
        mut self,
        destination: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.handlers.push((destination.into(), handler));
        self
    }

    /// Assembles the client without touching the network; call [`MqClient::init`] next.
    pub async fn build(self) -> MqClient {
        let cfg = self.config;
        let stop = CancellationToken::new();

        let manager = Arc::new(ConnectionManager::new(
            self.connector,
            Settings {
                addresses: cfg.addresses.clone(),
                credentials: cfg.credentials(),
                isolate_receive: cfg.isolate_receive,
            },
            cfg.close_timeout(),
        ));
        let senders = Arc::new(SenderRegistry::new());
        let recovery = Arc::new(RecoveryCoordinator::new(
            manager.clone(),
            senders.clone(),
            &cfg.reconnect,
            stop.clone(),
        ));
        let publisher = Publisher::new(
            manager.clone(),
            senders.clone(),
            recovery.clone(),
            cfg.send_timeout(),
        );
        let supervisor = Arc::new(ConsumerSupervisor::new(
            manager.clone(),
            recovery.clone(),
            cfg.effective_prefetch(),
            cfg.receiver_close_timeout(),
            stop.clone(),
        ));

        for (destination, handler) in self.handlers {
            supervisor.register(destination, handler).await;
        }

        MqClient {
            inner: Arc::new(ClientInner {
                manager,
                senders,
                recovery,
                publisher,
                supervisor,
                stop,
                close_timeout: cfg.close_timeout(),
            }),
        }
    }
}

struct ClientInner {
    manager: Arc<ConnectionManager>,
    senders: Arc<SenderRegistry>,
    recovery: Arc<RecoveryCoordinator>,
    publisher: Publisher,
    supervisor: Arc<ConsumerSupervisor>,
    stop: CancellationToken,
    close_timeout: Duration,
}

/// Resilient message-queue client.
#[derive(Clone)]
pub struct MqClient {
    inner: Arc<ClientInner>,
}

impl MqClient {
    /// Starts building a client on top of `connector`.
    ///
    /// # Parameters
    /// * `connector` - Broker adapter, e.g. [`crate::amqp::AmqpConnector`]
    ///
    /// # Returns
    /// A builder holding the default [`ClientConfig`].
    pub fn builder(connector: impl Connector + 'static) -> ClientBuilder {
        ClientBuilder {
            connector: Arc::new(connector),
            config: ClientConfig::default(),
            handlers: vec![],
        }
    }

    /// Connects to the first reachable broker address.
    ///
    /// No-op when already connected. Fails with the last dial error when every
    /// address is unreachable, and with [`MqError::NoAddresses`] without dialing
    /// when the address list is empty.
    pub async fn init(&self) -> Result<(), MqError> {
        let _guard = self.inner.recovery.exclusive().await;
        if self.inner.stop.is_cancelled() {
            return Err(MqError::Stopped);
        }
        self.inner.manager.init().await.map(|_| ())
    }

    /// Starts one receive loop per registered destination and returns immediately.
    pub async fn start_consuming(&self) -> Result<(), MqError> {
        self.inner.supervisor.start().await
    }

    /// Publishes `payload` to `destination`; `delay_millis > 0` asks the broker to
    /// hold the message back for that long.
    ///
    /// Returns an error only if the attempt and the retry after reconnecting both
    /// fail, or if the failure is not a connection failure.
    pub async fn send(
        &self,
        destination: &str,
        payload: &[u8],
        delay_millis: i64,
    ) -> Result<(), MqError> {
        self.inner.publisher.send(destination, payload, delay_millis).await
    }

    /// Stops consuming and closes every link and connection. The client cannot be
    /// initialized again afterwards.
    pub async fn close(&self) -> Result<(), MqError> {
        self.inner.stop.cancel();
        self.inner.supervisor.wait().await;

        let _guard = self.inner.recovery.exclusive().await;
        let mut failures = self.inner.senders.close_all(self.inner.close_timeout).await;
        if let Err(err) = self.inner.manager.close().await {
            failures.push(err.to_string());
        }

        if failures.is_empty() {
            debug!("client closed");
            return Ok(());
        }
        Err(MqError::CloseError(failures.join("; ")))
    }

    /// Binds `handler` to `destination`; applies from the next consumer (re)start.
    pub async fn register_handler(
        &self,
        destination: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
    ) {
        self.inner.supervisor.register(destination, handler).await;
    }

    /// Replaces the address list and resets the remembered index.
    ///
    /// Used by the next connection attempt, including attempts of a recovery
    /// already in progress.
    pub async fn set_addresses<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses = addresses.into_iter().map(Into::into).collect();
        self.inner.manager.set_addresses(addresses).await;
    }

    /// Replaces the credentials used by the next connection attempt.
    pub async fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.inner
            .manager
            .set_credentials(Credentials::new(username, password))
            .await;
    }

    /// Uses anonymous access from the next connection attempt on.
    pub async fn set_anonymous(&self) {
        self.inner
            .manager
            .set_credentials(Credentials::anonymous())
            .await;
    }

    /// Changes the prefetch of receivers opened from now on.
    ///
    /// # Parameters
    /// * `prefetch` - Unsettled deliveries allowed per receiver; `0` is treated as `1`
    pub fn set_prefetch(&self, prefetch: u16) {
        self.inner.supervisor.set_prefetch(prefetch);
    }

    /// Lifecycle state of the broker connection.
    pub async fn state(&self) -> ConnectionState {
        self.inner.manager.state().await
    }

    /// Epoch of the live connection; `0` before the first successful `init`.
    pub fn generation(&self) -> u64 {
        self.inner.manager.generation()
    }

    /// Index into the address list of the current (or last) connection.
    pub fn current_address_index(&self) -> usize {
        self.inner.manager.address_index()
    }

    /// Whether the consumer supervisor is running.
    pub async fn is_consuming(&self) -> bool {
        self.inner.supervisor.is_consuming().await
    }

    /// Number of reconnects performed so far.
    pub fn recoveries(&self) -> u64 {
        self.inner.recovery.recoveries()
    }
}
