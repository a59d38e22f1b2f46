// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Settings consumed by [`MqClient`](crate::client::MqClient): the ordered broker
//! address list, credentials, flow control, timeouts and the reconnect policy.
//! A `ClientConfig` can be built in code, deserialized from JSON, or read from
//! `MQ_*` environment variables.

use crate::{backoff::JitterPolicy, errors::MqError};
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};
use tracing::warn;

/// Default per-send ceiling, in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
/// Default ceiling for closing a connection's resources, in milliseconds.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
/// Default ceiling for closing one receiver, in milliseconds.
pub const DEFAULT_RECEIVER_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Username/password pair or anonymous access.
///
/// Anonymous is implied unless both username and password are set.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
    anonymous: bool,
}

impl Credentials {
    /// Builds credentials from a username and password.
    ///
    /// # Parameters
    /// * `username` - Login name; empty for anonymous access
    /// * `password` - Password; empty for anonymous access
    ///
    /// # Returns
    /// Plain credentials when both are set, anonymous ones otherwise. An
    /// incomplete pair is logged and falls back to anonymous access.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        let anonymous = username.is_empty() || password.is_empty();
        if anonymous && username.is_empty() != password.is_empty() {
            warn!(
                username = username.as_str(),
                "incomplete credentials, username and password must both be set; connecting anonymously"
            );
        }
        Credentials {
            username,
            password,
            anonymous,
        }
    }

    /// Anonymous credentials.
    pub fn anonymous() -> Self {
        Credentials {
            username: String::new(),
            password: String::new(),
            anonymous: true,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous || self.username.is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            return f.write_str("Credentials(anonymous)");
        }
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Reconnect policy used by the recovery coordinator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub first_ms: u64,
    /// Cap for a single delay.
    pub max_ms: u64,
    /// Growth factor between attempts.
    pub factor: f64,
    pub jitter: JitterPolicy,
    /// Consecutive failures after which an alarm is logged at error level.
    pub alarm_after_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            first_ms: 100,
            max_ms: 30_000,
            factor: 2.0,
            jitter: JitterPolicy::Equal,
            alarm_after_attempts: 10,
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate broker endpoints, tried in order.
    pub addresses: Vec<String>,
    pub username: String,
    pub password: String,
    /// Forces anonymous access even when a username is set.
    pub anonymous: bool,
    /// Unacknowledged messages a receiver may hold at once.
    pub prefetch: u16,
    pub send_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub receiver_close_timeout_ms: u64,
    /// Dial a dedicated connection for consumers.
    pub isolate_receive: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addresses: vec![],
            username: String::new(),
            password: String::new(),
            anonymous: false,
            prefetch: 1,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            receiver_close_timeout_ms: DEFAULT_RECEIVER_CLOSE_TIMEOUT_MS,
            isolate_receive: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, MqError> {
        serde_json::from_str(raw).map_err(|err| MqError::ConfigError(err.to_string()))
    }

    /// Reads the configuration from `MQ_*` environment variables.
    ///
    /// - `MQ_ADDRESSES` (comma separated)
    /// - `MQ_USERNAME`, `MQ_PASSWORD`, `MQ_ANONYMOUS`
    /// - `MQ_PREFETCH`, `MQ_SEND_TIMEOUT_MS`, `MQ_ISOLATE_RECEIVE`
    pub fn from_env() -> Result<Self, MqError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, MqError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = ClientConfig::default();

        if let Some(raw) = lookup("MQ_ADDRESSES") {
            cfg.addresses = raw
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(username) = lookup("MQ_USERNAME") {
            cfg.username = username;
        }
        if let Some(password) = lookup("MQ_PASSWORD") {
            cfg.password = password;
        }
        if let Some(v) = parse_var(&lookup, "MQ_ANONYMOUS")? {
            cfg.anonymous = v;
        }
        if let Some(v) = parse_var(&lookup, "MQ_PREFETCH")? {
            cfg.prefetch = v;
        }
        if let Some(v) = parse_var(&lookup, "MQ_SEND_TIMEOUT_MS")? {
            cfg.send_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MQ_ISOLATE_RECEIVE")? {
            cfg.isolate_receive = v;
        }

        Ok(cfg)
    }

    /// Credentials described by this configuration.
    pub fn credentials(&self) -> Credentials {
        if self.anonymous {
            return Credentials::anonymous();
        }
        Credentials::new(self.username.clone(), self.password.clone())
    }

    /// Prefetch with `0` coerced to `1`.
    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch.max(1)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn receiver_close_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_close_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, MqError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| MqError::ConfigError(format!("{key}={raw}"))),
    }
}
