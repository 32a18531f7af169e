//! Server configuration
//!
//! Every setting comes from an environment variable with a default, so the
//! server starts with no configuration at all (in-memory storage, no auth).

use convoy_core::dto::rpc::{MAX_POLL_WINDOW, MAX_UPLOAD_BYTES};
use std::time::Duration;

use crate::lease::DEFAULT_REAP_INTERVAL;
use crate::queue::{DEFAULT_LEASE_TTL, DEFAULT_MAX_DELIVERIES, DEFAULT_RETENTION, QueueConfig};

/// Default bound on a single `next` long poll
pub const DEFAULT_PULL_WAIT: Duration = Duration::from_secs(30);

/// Default bound on a single `wait` long poll
pub const DEFAULT_WAIT_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (e.g., "0.0.0.0:8080")
    pub bind_addr: String,

    /// Postgres URL; in-memory storage when unset
    pub database_url: Option<String>,

    /// Shared bearer token; authentication disabled when unset
    pub token: Option<String>,

    pub lease_ttl: Duration,
    pub reap_interval: Duration,
    pub max_deliveries: u32,
    pub pull_wait: Duration,
    pub wait_poll: Duration,

    /// How long finished jobs stay in memory
    pub retention: Duration,

    /// Largest accepted request body on the agent routes
    pub max_body_bytes: usize,

    /// Completion webhook; completions are only logged when unset
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            token: None,
            lease_ttl: DEFAULT_LEASE_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            pull_wait: DEFAULT_PULL_WAIT,
            wait_poll: DEFAULT_WAIT_POLL,
            retention: DEFAULT_RETENTION,
            max_body_bytes: MAX_UPLOAD_BYTES,
            webhook_url: None,
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Recognised variables:
    /// - CONVOY_BIND_ADDR (default: 0.0.0.0:8080)
    /// - DATABASE_URL (optional)
    /// - CONVOY_TOKEN (optional)
    /// - CONVOY_LEASE_TTL (seconds, default: 60)
    /// - CONVOY_REAP_INTERVAL (seconds, default: 5)
    /// - CONVOY_MAX_DELIVERIES (default: 3)
    /// - CONVOY_PULL_WAIT (seconds, default: 30)
    /// - CONVOY_WAIT_POLL (seconds, default: 30)
    /// - CONVOY_RETENTION (seconds, default: 3600)
    /// - CONVOY_MAX_BODY_BYTES (default: 64 MiB)
    /// - CONVOY_WEBHOOK_URL (optional)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("CONVOY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: non_empty_var("DATABASE_URL"),
            token: non_empty_var("CONVOY_TOKEN"),
            lease_ttl: secs_var("CONVOY_LEASE_TTL").unwrap_or(defaults.lease_ttl),
            reap_interval: secs_var("CONVOY_REAP_INTERVAL").unwrap_or(defaults.reap_interval),
            max_deliveries: std::env::var("CONVOY_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.max_deliveries),
            pull_wait: secs_var("CONVOY_PULL_WAIT").unwrap_or(defaults.pull_wait),
            wait_poll: secs_var("CONVOY_WAIT_POLL").unwrap_or(defaults.wait_poll),
            retention: secs_var("CONVOY_RETENTION").unwrap_or(defaults.retention),
            max_body_bytes: std::env::var("CONVOY_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.max_body_bytes),
            webhook_url: non_empty_var("CONVOY_WEBHOOK_URL"),
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.lease_ttl.is_zero() {
            anyhow::bail!("lease_ttl must be greater than 0");
        }

        if self.reap_interval.is_zero() {
            anyhow::bail!("reap_interval must be greater than 0");
        }

        if self.reap_interval > self.lease_ttl {
            anyhow::bail!("reap_interval must not exceed lease_ttl");
        }

        if self.max_deliveries == 0 {
            anyhow::bail!("max_deliveries must be greater than 0");
        }

        for (name, window) in [("pull_wait", self.pull_wait), ("wait_poll", self.wait_poll)] {
            if window.is_zero() || window > MAX_POLL_WINDOW {
                anyhow::bail!(
                    "{} must be between 1 and {} seconds",
                    name,
                    MAX_POLL_WINDOW.as_secs()
                );
            }
        }

        if self.max_body_bytes < MAX_UPLOAD_BYTES {
            anyhow::bail!(
                "max_body_bytes must be at least {} to accept agent uploads",
                MAX_UPLOAD_BYTES
            );
        }

        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("webhook_url must start with http:// or https://");
            }
        }

        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease_ttl: self.lease_ttl,
            max_deliveries: self.max_deliveries,
            retention: self.retention,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
