// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Delay policy applied between failed reconnect attempts. The delay for attempt
//! `n` (0-indexed) is `first × factor^n` clamped to `max`, with jitter applied on
//! top of the clamped value. The jittered value is never fed back into the next
//! computation, so delays cannot shrink over time.

use crate::config::ReconnectConfig;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Randomization applied to a backoff delay.
///
/// Spreads reconnects from many clients that lost the same broker at the same time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Exact delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    #[default]
    Equal,
}

impl JitterPolicy {
    /// Applies this jitter to `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }

        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let extra = if half == 0 { 0 } else { rng.random_range(0..=half) };
                Duration::from_millis(half + extra)
            }
        }
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    /// Randomization applied after clamping.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        BackoffPolicy {
            first: Duration::from_millis(cfg.first_ms),
            max: Duration::from_millis(cfg.max_ms),
            factor: cfg.factor,
            jitter: cfg.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay to wait after failed attempt number `attempt`.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        self.jitter.apply(base)
    }
}
