use thiserror::Error;

use crate::proxy::retry::RetryAttempt;

/// Unified error type for the ProxyWhirl engine
#[derive(Error, Debug)]
pub enum ProxyWhirlError {
    // Construction errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid request url: {0}")]
    InvalidRequestUrl(String),

    // Pool errors
    #[error("No eligible proxy available")]
    PoolEmpty,

    #[error("Proxy pool is full ({max_size} proxies)")]
    PoolFull { max_size: usize },

    #[error("Proxy already exists: {id}")]
    DuplicateProxy { id: String },

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: String },

    // Circuit breaker
    #[error("Circuit open for proxy {proxy_id}")]
    CircuitOpen { proxy_id: String },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Terminal retry outcomes
    #[error("Retries exhausted after {attempts} attempts (last proxy: {}): {last_error}", last_proxy_id.as_deref().unwrap_or("none"))]
    RetryExhausted {
        attempts: u32,
        last_proxy_id: Option<String>,
        last_error: String,
        history: Vec<RetryAttempt>,
    },

    #[error("Request failed without retry on proxy {proxy_id} after {attempts} attempts: {error}")]
    NonRetryable {
        attempts: u32,
        proxy_id: String,
        error: String,
    },

    #[error("Request cancelled after {attempts} attempts (last proxy: {}): {last_error}", last_proxy_id.as_deref().unwrap_or("none"))]
    Cancelled {
        attempts: u32,
        last_proxy_id: Option<String>,
        last_error: String,
    },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ProxyWhirl operations
pub type Result<T> = std::result::Result<T, ProxyWhirlError>;

impl ProxyWhirlError {
    /// Whether a retry loop may try another proxy after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyWhirlError::Transport(_) | ProxyWhirlError::CircuitOpen { .. }
        )
    }

    /// Whether this error ends a logical request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProxyWhirlError::PoolEmpty
                | ProxyWhirlError::RetryExhausted { .. }
                | ProxyWhirlError::NonRetryable { .. }
                | ProxyWhirlError::Cancelled { .. }
        )
    }

    /// Number of attempts made, for terminal retry errors
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ProxyWhirlError::RetryExhausted { attempts, .. }
            | ProxyWhirlError::NonRetryable { attempts, .. }
            | ProxyWhirlError::Cancelled { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
