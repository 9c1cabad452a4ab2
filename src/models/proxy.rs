use std::collections::{BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::{ProxyWhirlError, Result};

/// Smoothing factor for the response-time moving average
pub const EMA_ALPHA: f64 = 0.2;

/// Number of failures kept in a proxy's error history
pub const ERROR_HISTORY_LIMIT: usize = 10;

const UNHEALTHY_AFTER: u64 = 3;
const DEAD_AFTER: u64 = 5;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks5" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyProtocol::Http | ProxyProtocol::Https)
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health of a proxy, driven by consecutive request outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Dead,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Dead => "dead",
        }
    }

    /// Status implied by a run of consecutive failures
    pub fn from_consecutive_failures(failures: u64) -> Self {
        match failures {
            0 => HealthStatus::Healthy,
            f if f >= DEAD_AFTER => HealthStatus::Dead,
            f if f >= UNHEALTHY_AFTER => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    /// Whether a rotation strategy may still hand this proxy out
    pub fn is_selectable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy | HealthStatus::Dead)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a proxy entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxySource {
    #[default]
    User,
    Fetched,
    File,
    Api,
}

impl ProxySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxySource::User => "user",
            ProxySource::Fetched => "fetched",
            ProxySource::File => "file",
            ProxySource::Api => "api",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(ProxySource::User),
            "fetched" => Some(ProxySource::Fetched),
            "file" => Some(ProxySource::File),
            "api" => Some(ProxySource::Api),
            _ => None,
        }
    }
}

/// Username/password pair for an authenticated proxy
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One entry of a proxy's bounded failure history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// Request to construct a new proxy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProxy {
    /// `scheme://[user:pass@]host:port`, or bare `host:port` with `protocol`
    pub url: String,
    pub protocol: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Explicit id; a random UUID is assigned when absent
    pub id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: ProxySource,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub weight: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Accept loopback, link-local and private addresses
    #[serde(default)]
    pub allow_local: bool,
}

impl NewProxy {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Proxy entity
///
/// Identity fields are fixed at construction. Counters and health only change
/// through [`Proxy::record_success`] and [`Proxy::record_failure`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    id: String,
    host: String,
    port: u16,
    protocol: ProxyProtocol,
    credentials: Option<ProxyCredentials>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    source: ProxySource,
    country_code: Option<String>,
    region: Option<String>,
    weight: Option<f64>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    /// Local addresses were explicitly allowed at construction
    #[serde(default)]
    allow_local: bool,

    #[serde(default)]
    health_status: HealthStatus,
    #[serde(default)]
    total_requests: u64,
    #[serde(default)]
    total_successes: u64,
    #[serde(default)]
    total_failures: u64,
    #[serde(default)]
    consecutive_successes: u64,
    #[serde(default)]
    consecutive_failures: u64,
    average_response_time_ms: Option<f64>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error_history: VecDeque<ErrorRecord>,
}

impl Proxy {
    /// Build and validate a proxy
    pub fn new(request: NewProxy) -> Result<Self> {
        let raw = request.url.trim();
        if raw.is_empty() {
            return Err(ProxyWhirlError::Validation("proxy url is empty".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            let scheme = request.protocol.as_deref().unwrap_or("http");
            format!("{}://{}", scheme, raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| ProxyWhirlError::Validation(format!("invalid proxy url {}: {}", raw, e)))?;

        let protocol = ProxyProtocol::from_str(url.scheme()).ok_or_else(|| {
            ProxyWhirlError::Validation(format!("unsupported proxy scheme: {}", url.scheme()))
        })?;
        if let Some(declared) = request.protocol.as_deref() {
            if ProxyProtocol::from_str(declared) != Some(protocol) {
                return Err(ProxyWhirlError::Validation(format!(
                    "protocol {} does not match url scheme {}",
                    declared, protocol
                )));
            }
        }

        let host = url
            .host()
            .ok_or_else(|| ProxyWhirlError::Validation(format!("proxy url has no host: {}", raw)))?;
        if !request.allow_local && is_local_host(&host) {
            return Err(ProxyWhirlError::Validation(format!(
                "local or private address not allowed: {}",
                host
            )));
        }
        let host = match host {
            Host::Ipv6(addr) => addr.to_string(),
            other => other.to_string(),
        };

        let port = url.port_or_known_default().ok_or_else(|| {
            ProxyWhirlError::Validation(format!("{} proxy requires an explicit port", protocol))
        })?;
        if port == 0 {
            return Err(ProxyWhirlError::Validation(
                "port must be within 1..=65535".into(),
            ));
        }

        let url_username = (!url.username().is_empty()).then(|| url.username().to_string());
        let url_password = url.password().map(str::to_string);
        let username = request.username.or(url_username);
        let password = request.password.or(url_password);
        let credentials = match (username, password) {
            (None, None) => None,
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(ProxyCredentials {
                username: u,
                password: p,
            }),
            _ => {
                return Err(ProxyWhirlError::Validation(
                    "credentials require both username and password".into(),
                ))
            }
        };

        if let Some(weight) = request.weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ProxyWhirlError::Validation(format!(
                    "weight must be a non-negative number, got {}",
                    weight
                )));
            }
        }

        let id = match request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ProxyWhirlError::Validation("proxy id is empty".into()))
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        Ok(Self {
            id,
            host,
            port,
            protocol,
            credentials,
            tags: request
                .tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            source: request.source,
            country_code: request.country_code.map(|c| c.to_uppercase()),
            region: request.region,
            weight: request.weight,
            expires_at: request.expires_at,
            created_at: Utc::now(),
            allow_local: request.allow_local,
            health_status: HealthStatus::Unknown,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            average_response_time_ms: None,
            last_success_at: None,
            last_failure_at: None,
            error_history: VecDeque::new(),
        })
    }

    /// Shorthand for a proxy built from a URL alone
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(NewProxy::from_url(url))
    }

    /// Re-check invariants of a proxy restored from storage
    ///
    /// Applies the same address rules as [`Proxy::new`].
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ProxyWhirlError::Validation("proxy id is empty".into()));
        }
        if self.port == 0 {
            return Err(ProxyWhirlError::Validation(format!(
                "proxy {} has port 0",
                self.id
            )));
        }

        let url = Url::parse(&self.url()).map_err(|e| {
            ProxyWhirlError::Validation(format!("proxy {} has invalid address: {}", self.id, e))
        })?;
        if ProxyProtocol::from_str(url.scheme()) != Some(self.protocol) {
            return Err(ProxyWhirlError::Validation(format!(
                "proxy {} has unsupported scheme {}",
                self.id,
                url.scheme()
            )));
        }
        let host = url.host().ok_or_else(|| {
            ProxyWhirlError::Validation(format!("proxy {} has no host", self.id))
        })?;
        if !self.allow_local && is_local_host(&host) {
            return Err(ProxyWhirlError::Validation(format!(
                "proxy {} uses local or private address {}",
                self.id, host
            )));
        }
        if let Some(avg) = self.average_response_time_ms {
            if !avg.is_finite() || avg < 0.0 {
                return Err(ProxyWhirlError::Validation(format!(
                    "proxy {} has invalid average response time {}",
                    self.id, avg
                )));
            }
        }
        if let Some(weight) = self.weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ProxyWhirlError::Validation(format!(
                    "proxy {} has invalid weight {}",
                    self.id, weight
                )));
            }
        }
        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() || creds.password.is_empty() {
                return Err(ProxyWhirlError::Validation(format!(
                    "proxy {} has partial credentials",
                    self.id
                )));
            }
        }
        if self.total_successes + self.total_failures != self.total_requests {
            return Err(ProxyWhirlError::Validation(format!(
                "proxy {} counters are inconsistent",
                self.id
            )));
        }
        Ok(())
    }

    /// Record a successful request through this proxy
    pub fn record_success(&mut self, latency_ms: f64) {
        let latency_ms = if latency_ms.is_finite() {
            latency_ms.max(0.0)
        } else {
            0.0
        };

        self.health_status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.total_successes += 1;
        self.total_requests += 1;
        self.last_success_at = Some(Utc::now());
        self.average_response_time_ms = Some(match self.average_response_time_ms {
            None => latency_ms,
            Some(avg) => EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * avg,
        });
    }

    /// Record a failed request through this proxy
    pub fn record_failure(&mut self, error: Option<&str>) {
        let now = Utc::now();

        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.total_failures += 1;
        self.total_requests += 1;
        self.last_failure_at = Some(now);

        if self.error_history.len() >= ERROR_HISTORY_LIMIT {
            self.error_history.pop_front();
        }
        self.error_history.push_back(ErrorRecord {
            timestamp: now,
            error: error.map(str::to_string),
        });

        self.health_status = HealthStatus::from_consecutive_failures(self.consecutive_failures);
    }

    /// Fraction of requests that succeeded, in `[0, 1]`
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_successes as f64 / self.total_requests as f64).clamp(0.0, 1.0)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status == HealthStatus::Healthy
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether rotation may hand this proxy out at `now`
    pub fn is_selectable_at(&self, now: DateTime<Utc>) -> bool {
        self.health_status.is_selectable() && !self.is_expired_at(now)
    }

    pub fn has_tags(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_subset(&self.tags)
    }

    /// Whether the proxy is located in `region`, matched against country code or region name
    pub fn matches_region(&self, region: &str) -> bool {
        let region = region.trim();
        self.country_code
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(region))
            .unwrap_or(false)
            || self
                .region
                .as_deref()
                .map(|r| r.eq_ignore_ascii_case(region))
                .unwrap_or(false)
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Canonical URL without credentials
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol.as_str(), self.address())
    }

    /// URL including credentials, for handing to an HTTP client
    pub fn url_with_credentials(&self) -> String {
        match &self.credentials {
            Some(creds) => format!(
                "{}://{}:{}@{}",
                self.protocol.as_str(),
                creds.username,
                creds.password,
                self.address()
            ),
            None => self.url(),
        }
    }

    /// Set an absolute expiry, `ttl` from now
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn source(&self) -> ProxySource {
        self.source
    }

    pub fn country_code(&self) -> Option<&str> {
        self.country_code.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn weight(&self) -> Option<f64> {
        self.weight
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn allows_local(&self) -> bool {
        self.allow_local
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health_status
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn consecutive_successes(&self) -> u64 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    pub fn average_response_time_ms(&self) -> Option<f64> {
        self.average_response_time_ms
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn error_history(&self) -> &VecDeque<ErrorRecord> {
        &self.error_history
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error_history.back().and_then(|r| r.error.as_deref())
    }
}

fn is_local_host(host: &Host<&str>) -> bool {
    match host {
        // socks schemes are not "special" to the URL parser, so IP literals arrive as domains
        Host::Domain(domain) => match domain.parse::<IpAddr>() {
            Ok(addr) => is_local_addr(&addr),
            Err(_) => {
                let domain = domain.to_lowercase();
                domain == "localhost" || domain.ends_with(".localhost")
            }
        },
        Host::Ipv4(addr) => is_local_ipv4(addr),
        Host::Ipv6(addr) => is_local_ipv6(addr),
    }
}

fn is_local_ipv4(addr: &Ipv4Addr) -> bool {
    addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
}

fn is_local_ipv6(addr: &Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_local_ipv4(&v4);
    }
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Whether an address falls in loopback, link-local or private ranges
pub fn is_local_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_local_ipv4(v4),
        IpAddr::V6(v6) => is_local_ipv6(v6),
    }
}
