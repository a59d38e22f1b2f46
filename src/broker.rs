// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Interface
//!
//! The client core never talks to a wire protocol directly. Every supported broker
//! is wrapped by an adapter implementing the traits in this module:
//!
//! - [`Connector`] dials one broker address with the configured credentials
//! - [`Connection`] opens sessions on a live connection
//! - [`Session`] opens outbound ([`Sender`]) and inbound ([`Receiver`]) links
//! - [`Acknowledger`] settles one received message
//!
//! Payloads are opaque bytes; headers are string pairs so trace context and
//! broker-specific hints can travel through any protocol.

use crate::{config::Credentials, errors::MqError};
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Default content type for opaque payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// String headers carried alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub message_id: String,
    pub content_type: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Do not make the message visible to consumers before now + delay.
    pub delay: Option<Duration>,
}

impl OutboundMessage {
    /// Creates a durable message with no delay.
    pub fn new(payload: Vec<u8>) -> Self {
        OutboundMessage {
            payload,
            headers: Headers::default(),
            message_id: String::new(),
            content_type: OCTET_STREAM_CONTENT_TYPE.to_owned(),
            durable: true,
            delay: None,
        }
    }

    /// Delays visibility by `delay_millis`; non-positive values mean no delay.
    pub fn with_delay_millis(mut self, delay_millis: i64) -> Self {
        self.delay = u64::try_from(delay_millis)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Settles a single delivery with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Removes the message from the broker permanently.
    async fn accept(&self) -> Result<(), MqError>;

    /// Returns the message to the broker for redelivery.
    async fn reject(&self) -> Result<(), MqError>;
}

/// A received message awaiting settlement.
///
/// Settling consumes the delivery, so a message is accepted or rejected at most once.
pub struct Delivery {
    payload: Vec<u8>,
    headers: Headers,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, headers: Headers, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            payload,
            headers,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub async fn accept(self) -> Result<(), MqError> {
        self.acker.accept().await
    }

    pub async fn reject(self) -> Result<(), MqError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Dials broker addresses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a protocol-level connection to `address`.
    async fn dial(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection>, MqError>;

    /// Adapter name for logs.
    fn name(&self) -> &'static str;
}

/// A live connection to one broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn new_session(&self) -> Result<Arc<dyn Session>, MqError>;

    async fn close(&self) -> Result<(), MqError>;
}

/// A session multiplexing links over one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens an outbound link bound to `destination`.
    async fn new_sender(&self, destination: &str) -> Result<Arc<dyn Sender>, MqError>;

    /// Opens an inbound link on `destination` allowing `prefetch` unsettled messages.
    async fn new_receiver(
        &self,
        destination: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Receiver>, MqError>;

    async fn close(&self) -> Result<(), MqError>;
}

/// Outbound link for one destination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), MqError>;

    async fn close(&self) -> Result<(), MqError>;
}

/// Inbound link for one destination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Receiver: Send {
    /// Waits for the next message.
    ///
    /// An error means the link is unusable and the caller should stop receiving.
    async fn receive(&mut self) -> Result<Delivery, MqError>;

    async fn close(&mut self) -> Result<(), MqError>;
}

impl fmt::Debug for dyn Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}
