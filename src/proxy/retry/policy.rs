//! Retry policy and backoff computation

use std::time::Duration;

use http::Method;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyWhirlError, Result};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
}

impl BackoffStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exponential" | "exp" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
        }
    }
}

/// Retry behavior for one logical request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be >= 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Upper bound for any computed delay, jitter included
    pub max_backoff_delay: Duration,
    /// Scale each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
    pub backoff: BackoffStrategy,
    /// Response statuses that count as a retryable proxy failure
    pub retry_status_codes: Vec<u16>,
    /// Retry requests whose method is not idempotent
    pub retry_non_idempotent: bool,
    /// Whether skipping a proxy with an open circuit uses up an attempt
    pub circuit_open_consumes_attempt: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff_delay: Duration::from_secs(30),
            jitter: false,
            backoff: BackoffStrategy::Exponential,
            retry_status_codes: vec![502, 503, 504],
            retry_non_idempotent: false,
            circuit_open_consumes_attempt: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProxyWhirlError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ProxyWhirlError::InvalidConfig(format!(
                "multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.base_delay > self.max_backoff_delay {
            return Err(ProxyWhirlError::InvalidConfig(
                "base_delay must not exceed max_backoff_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_nanos() as f64;
        let raw = match self.backoff {
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.multiplier.powi(exponent)
            }
            BackoffStrategy::Linear => base * f64::from(attempt),
        };
        self.cap(raw)
    }

    /// Delay after failed attempt `attempt`, with jitter applied when enabled
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        self.cap(delay.as_nanos() as f64 * factor)
    }

    fn cap(&self, nanos: f64) -> Duration {
        let max = self.max_backoff_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            self.max_backoff_delay
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }

    pub fn is_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Whether a failure of a request with `method` may be retried at all
    pub fn permits_retry_for(&self, method: &Method) -> bool {
        self.retry_non_idempotent || method.is_idempotent()
    }
}
