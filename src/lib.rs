//! ProxyWhirl - Proxy Rotation Engine
//!
//! Maintains a pool of forward HTTP and SOCKS proxies and hands one out per
//! outbound request, retrying across proxies when one misbehaves.
//!
//! ## Features
//!
//! - Rotation strategies: round-robin, random, weighted, least-used,
//!   performance-based, geo-targeted and session persistence
//! - Per-proxy health tracking and circuit breaking
//! - Retry with exponential or linear backoff and cancellation
//! - HTTP, HTTPS, SOCKS4 and SOCKS5 proxy support
//! - Background health checks and periodic persistence

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;
pub mod services;

pub use config::Config;
pub use engine::ProxyWhirl;
pub use error::{ProxyWhirlError, Result};
