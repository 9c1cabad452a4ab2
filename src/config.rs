use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProxyWhirlError, Result};
use crate::proxy::circuit_breaker::CircuitBreakerConfig;
use crate::proxy::health::HealthCheckerConfig;
use crate::proxy::retry::{BackoffStrategy, MetricsConfig, RetryPolicy};
use crate::proxy::rotation::RotationStrategy;
use crate::proxy::session::SessionConfig;
use crate::services::MaintenanceConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolConfig,
    pub rotation: RotationConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub session: SessionSettings,
    pub metrics: MetricsSettings,
    pub healthcheck: HealthCheckConfig,
    pub storage: StorageConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of proxies (0 = unbounded)
    pub max_size: usize,
    /// Accept loopback and private proxy addresses
    pub allow_local: bool,
    /// Proxy URLs added at startup, comma separated in the environment
    pub seed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub strategy: RotationStrategy,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub timeout_secs: u64,
    pub half_open_max_calls: u32,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub backoff: BackoffStrategy,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Maximum live sessions (0 = unbounded)
    pub max_sessions: usize,
    pub timeout_secs: u64,
    pub cleanup_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub retention_hours: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub url: String,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub save_interval_secs: u64,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let strategy = get_env_or("ROTATION_STRATEGY", "round_robin");
        let backoff = get_env_or("RETRY_BACKOFF", "exponential");

        let config = Config {
            pool: PoolConfig {
                max_size: parse_env_or("POOL_MAX_SIZE", 0)?,
                allow_local: parse_env_or("POOL_ALLOW_LOCAL", false)?,
                seed: get_env_or("SEED_PROXIES", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            rotation: RotationConfig {
                strategy: RotationStrategy::parse(&strategy).ok_or_else(|| {
                    ProxyWhirlError::InvalidConfig(format!(
                        "ROTATION_STRATEGY has unknown value: {}",
                        strategy
                    ))
                })?,
            },
            breaker: BreakerConfig {
                failure_threshold: parse_env_or("BREAKER_FAILURE_THRESHOLD", 5)?,
                window_secs: parse_env_or("BREAKER_WINDOW_SECS", 60)?,
                timeout_secs: parse_env_or("BREAKER_TIMEOUT_SECS", 30)?,
                half_open_max_calls: parse_env_or("BREAKER_HALF_OPEN_MAX_CALLS", 1)?,
            },
            retry: RetryConfig {
                max_attempts: parse_env_or("RETRY_MAX_ATTEMPTS", 3)?,
                base_delay_ms: parse_env_or("RETRY_BASE_DELAY_MS", 1000)?,
                multiplier: parse_env_or("RETRY_MULTIPLIER", 2.0)?,
                max_delay_ms: parse_env_or("RETRY_MAX_DELAY_MS", 30_000)?,
                jitter: parse_env_or("RETRY_JITTER", false)?,
                backoff: BackoffStrategy::from_str(&backoff).ok_or_else(|| {
                    ProxyWhirlError::InvalidConfig(format!(
                        "RETRY_BACKOFF has unknown value: {}",
                        backoff
                    ))
                })?,
            },
            session: SessionSettings {
                max_sessions: parse_env_or("SESSION_MAX", 10_000)?,
                timeout_secs: parse_env_or("SESSION_TIMEOUT_SECS", 300)?,
                cleanup_threshold: parse_env_or("SESSION_CLEANUP_THRESHOLD", 100)?,
            },
            metrics: MetricsSettings {
                retention_hours: parse_env_or("METRICS_RETENTION_HOURS", 24)?,
                max_entries: parse_env_or("METRICS_MAX_ENTRIES", 10_000)?,
            },
            healthcheck: HealthCheckConfig {
                interval_secs: parse_env_or("HEALTHCHECK_INTERVAL_SECS", 30)?,
                timeout_secs: parse_env_or("HEALTHCHECK_TIMEOUT_SECS", 10)?,
                url: get_env_or("HEALTHCHECK_URL", "http://www.google.com"),
                workers: parse_env_or("HEALTHCHECK_WORKERS", 20)?,
            },
            storage: StorageConfig {
                path: PathBuf::from(get_env_or("STORAGE_PATH", "proxies.json")),
                save_interval_secs: parse_env_or("SAVE_INTERVAL_SECS", 300)?,
                maintenance_interval_secs: parse_env_or("MAINTENANCE_INTERVAL_SECS", 60)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("BREAKER_FAILURE_THRESHOLD", self.breaker.failure_threshold as u64),
            ("BREAKER_HALF_OPEN_MAX_CALLS", self.breaker.half_open_max_calls as u64),
            ("HEALTHCHECK_INTERVAL_SECS", self.healthcheck.interval_secs),
            ("HEALTHCHECK_TIMEOUT_SECS", self.healthcheck.timeout_secs),
            ("SAVE_INTERVAL_SECS", self.storage.save_interval_secs),
            ("MAINTENANCE_INTERVAL_SECS", self.storage.maintenance_interval_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ProxyWhirlError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    key
                )));
            }
        }
        self.retry_policy().validate()
    }

    /// Pool capacity, `None` when unbounded
    pub fn max_pool_size(&self) -> Option<usize> {
        (self.pool.max_size > 0).then_some(self.pool.max_size)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            window_duration: Duration::from_secs(self.breaker.window_secs),
            timeout_duration: Duration::from_secs(self.breaker.timeout_secs),
            half_open_max_calls: self.breaker.half_open_max_calls,
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_backoff_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
            backoff: self.retry.backoff,
            ..RetryPolicy::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sessions: self.session.max_sessions,
            default_timeout: Duration::from_secs(self.session.timeout_secs),
            auto_cleanup_threshold: self.session.cleanup_threshold,
        }
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            retention: Duration::from_secs(self.metrics.retention_hours * 3600),
            max_entries: self.metrics.max_entries,
        }
    }

    pub fn health_checker_config(&self) -> HealthCheckerConfig {
        HealthCheckerConfig {
            check_interval: Duration::from_secs(self.healthcheck.interval_secs),
            check_timeout: Duration::from_secs(self.healthcheck.timeout_secs),
            check_url: self.healthcheck.url.clone(),
            workers: self.healthcheck.workers,
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            sweep_interval: Duration::from_secs(self.storage.maintenance_interval_secs),
            save_interval: Duration::from_secs(self.storage.save_interval_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool: PoolConfig {
                max_size: 0,
                allow_local: false,
                seed: Vec::new(),
            },
            rotation: RotationConfig {
                strategy: RotationStrategy::RoundRobin,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                window_secs: 60,
                timeout_secs: 30,
                half_open_max_calls: 1,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1000,
                multiplier: 2.0,
                max_delay_ms: 30_000,
                jitter: false,
                backoff: BackoffStrategy::Exponential,
            },
            session: SessionSettings {
                max_sessions: 10_000,
                timeout_secs: 300,
                cleanup_threshold: 100,
            },
            metrics: MetricsSettings {
                retention_hours: 24,
                max_entries: 10_000,
            },
            healthcheck: HealthCheckConfig {
                interval_secs: 30,
                timeout_secs: 10,
                url: "http://www.google.com".to_string(),
                workers: 20,
            },
            storage: StorageConfig {
                path: PathBuf::from("proxies.json"),
                save_interval_secs: 300,
                maintenance_interval_secs: 60,
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, using `default` when it is unset or blank
fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            ProxyWhirlError::InvalidConfig(format!("{} has invalid value: {}", key, raw))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "POOL_MAX_SIZE",
        "POOL_ALLOW_LOCAL",
        "SEED_PROXIES",
        "ROTATION_STRATEGY",
        "BREAKER_FAILURE_THRESHOLD",
        "BREAKER_WINDOW_SECS",
        "BREAKER_TIMEOUT_SECS",
        "BREAKER_HALF_OPEN_MAX_CALLS",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "RETRY_MULTIPLIER",
        "RETRY_MAX_DELAY_MS",
        "RETRY_JITTER",
        "RETRY_BACKOFF",
        "SESSION_MAX",
        "SESSION_TIMEOUT_SECS",
        "SESSION_CLEANUP_THRESHOLD",
        "METRICS_RETENTION_HOURS",
        "METRICS_MAX_ENTRIES",
        "HEALTHCHECK_INTERVAL_SECS",
        "HEALTHCHECK_TIMEOUT_SECS",
        "HEALTHCHECK_URL",
        "HEALTHCHECK_WORKERS",
        "STORAGE_PATH",
        "SAVE_INTERVAL_SECS",
        "MAINTENANCE_INTERVAL_SECS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.max_pool_size(), None);
        assert!(!config.pool.allow_local);
        assert!(config.pool.seed.is_empty());
        assert_eq!(config.rotation.strategy, RotationStrategy::RoundRobin);

        let breaker = config.circuit_breaker_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.window_duration, Duration::from_secs(60));
        assert_eq!(breaker.timeout_duration, Duration::from_secs(30));
        assert_eq!(breaker.half_open_max_calls, 1);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_backoff_delay, Duration::from_secs(30));
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert!(!policy.circuit_open_consumes_attempt);

        assert_eq!(config.session_config().max_sessions, 10_000);
        assert_eq!(
            config.metrics_config().retention,
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(config.health_checker_config().workers, 20);
        assert_eq!(config.storage.path, PathBuf::from("proxies.json"));
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_MAX_SIZE", "50");
        env::set_var("POOL_ALLOW_LOCAL", "true");
        env::set_var("SEED_PROXIES", "http://203.0.113.1:8080, socks5://203.0.113.2:1080");
        env::set_var("ROTATION_STRATEGY", "sticky");
        env::set_var("BREAKER_FAILURE_THRESHOLD", "3");
        env::set_var("RETRY_BACKOFF", "linear");
        env::set_var("RETRY_MULTIPLIER", "1.5");
        env::set_var("SESSION_TIMEOUT_SECS", "60");
        env::set_var("STORAGE_PATH", "/var/lib/proxywhirl/pool.json");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.max_pool_size(), Some(50));
        assert!(config.pool.allow_local);
        assert_eq!(
            config.pool.seed,
            vec![
                "http://203.0.113.1:8080".to_string(),
                "socks5://203.0.113.2:1080".to_string()
            ]
        );
        assert_eq!(
            config.rotation.strategy,
            RotationStrategy::SessionPersistence
        );
        assert_eq!(config.circuit_breaker_config().failure_threshold, 3);
        assert_eq!(config.retry_policy().backoff, BackoffStrategy::Linear);
        assert_eq!(config.retry_policy().multiplier, 1.5);
        assert_eq!(
            config.session_config().default_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/proxywhirl/pool.json")
        );
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_config_from_env_invalid_number() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RETRY_MAX_ATTEMPTS", "many");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyWhirlError::InvalidConfig(ref m) if m.contains("RETRY_MAX_ATTEMPTS")));
    }

    #[test]
    fn test_config_from_env_unknown_strategy() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTATION_STRATEGY", "least_connections");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyWhirlError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_zero_attempts() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RETRY_MAX_ATTEMPTS", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyWhirlError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_zero_interval() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("HEALTHCHECK_INTERVAL_SECS", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyWhirlError::InvalidConfig(ref m) if m.contains("HEALTHCHECK_INTERVAL_SECS")));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
