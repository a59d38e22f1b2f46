// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient message-queue client.
//!
//! Keeps publishers and consumers working across broker outages: ordered address
//! failover, one reconnect per connection failure however many tasks observe it,
//! per-destination consumer loops restarted after every reconnect, and a send path
//! that reconnects inline and retries once.
//!
//! Brokers are reached through the adapter traits in [`broker`]; [`amqp`] speaks
//! AMQP 0-9-1 through `lapin` and [`memory`] is an in-process broker for tests.

mod otel;

pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod memory;
pub mod publisher;
pub mod recovery;

pub use client::{ClientBuilder, MqClient};
pub use config::{ClientConfig, Credentials};
pub use connection::ConnectionState;
pub use consumer::{ConsumerHandler, Outcome};
pub use errors::MqError;
