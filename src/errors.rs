// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message-Queue Client
//!
//! This module provides the error type shared by the client core and every broker
//! adapter. The `MqError` enum separates configuration problems, transient I/O
//! failures that the client recovers from on its own, and link-level failures that
//! are surfaced to the caller without tearing the connection down.

use thiserror::Error;

/// Represents errors that can occur while talking to a message broker.
///
/// Payloads are plain strings so errors can be cloned across tasks, logged, and
/// compared in tests regardless of which adapter produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The client has no broker address to dial
    #[error("no broker address configured")]
    NoAddresses,

    /// A configuration value could not be parsed
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// An operation needing a live connection ran before `init`
    #[error("client not initialized")]
    NotInitialized,

    /// `start_consuming` was called while the supervisor was already running
    #[error("consumer supervisor already running")]
    AlreadyConsuming,

    /// The client was closed while the operation was waiting
    #[error("client stopped")]
    Stopped,

    /// Error establishing a connection to one broker address
    #[error("failure to connect to `{0}`: {1}")]
    DialError(String, String),

    /// Error opening a session on an established connection
    #[error("failure to open a session: {0}")]
    SessionError(String),

    /// The connection or session backing an operation is gone
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker did not accept a message within the send timeout
    #[error("send timed out after {0}ms")]
    SendTimeout(u64),

    /// Error opening an outbound link for a destination
    #[error("failure to create sender for `{0}`: {1}")]
    CreatingSenderError(String, String),

    /// Error opening an inbound link for a destination
    #[error("failure to create receiver for `{0}`: {1}")]
    CreatingReceiverError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error receiving a message
    #[error("failure to receive: {0}")]
    ReceiveError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// One or more resources failed to close
    #[error("failure to close: {0}")]
    CloseError(String),
}

impl MqError {
    /// Returns true for errors that mean the connection itself is unusable.
    ///
    /// These trigger the reconnect path; the failing call is retried at most once
    /// after recovery succeeds.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MqError::ConnectionClosed(_) | MqError::SendTimeout(_) | MqError::ReceiveError(_)
        )
    }

    /// Returns true for errors caused by the client's own configuration.
    ///
    /// These are returned synchronously from `init` and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MqError::NoAddresses | MqError::ConfigError(_)
        )
    }
}
