//! Agent configuration

use convoy_core::dto::rpc::MAX_UPLOAD_BYTES;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::reporter::{DEFAULT_MAX_ARTIFACT_BYTES, DEFAULT_MAX_LOG_BYTES, ReportLimits};
use crate::retry::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_RETRY_LIMIT, RetryPolicy};

/// Default lease renewal period; a third of the server's default lease TTL
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this agent instance
    pub agent_id: String,

    /// Server base URL (e.g., "http://localhost:8080")
    pub server_url: String,

    /// Bearer token expected by the server, if any
    pub token: Option<String>,

    /// Jobs executed concurrently
    pub slots: usize,

    pub heartbeat_interval: Duration,

    pub retry: RetryPolicy,

    /// Labels for job matching (e.g., os=linux,arch=amd64)
    pub labels: HashMap<String, String>,

    /// Container CLI: `podman` or `docker`
    pub engine: String,

    /// Host directory holding job workspaces
    pub workspace: PathBuf,

    pub limits: ReportLimits,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(agent_id: String, server_url: String) -> Self {
        Self {
            agent_id,
            server_url,
            token: None,
            slots: 1,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            retry: RetryPolicy::default(),
            labels: HashMap::new(),
            engine: "podman".to_string(),
            workspace: std::env::temp_dir().join("convoy"),
            limits: ReportLimits::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - CONVOY_SERVER_URL (required)
    /// - CONVOY_AGENT_ID (optional, default: hostname-derived)
    /// - CONVOY_TOKEN (optional)
    /// - CONVOY_SLOTS (optional, default: 1)
    /// - CONVOY_HEARTBEAT_INTERVAL (optional, seconds, default: 20)
    /// - CONVOY_RETRY_LIMIT (optional, default: 10)
    /// - CONVOY_BACKOFF_BASE_MS (optional, default: 500)
    /// - CONVOY_BACKOFF_MAX_MS (optional, default: 30000)
    /// - CONVOY_LABELS (optional, `key=value,key=value`)
    /// - CONVOY_ENGINE (optional, default: podman)
    /// - CONVOY_WORKSPACE (optional, default: $TMPDIR/convoy)
    /// - CONVOY_MAX_LOG_BYTES (optional, default: 4 MiB)
    /// - CONVOY_MAX_ARTIFACT_BYTES (optional, default: 1 MiB)
    pub fn from_env() -> anyhow::Result<Self> {
        let server_url = std::env::var("CONVOY_SERVER_URL")
            .map_err(|_| anyhow::anyhow!("CONVOY_SERVER_URL environment variable not set"))?;

        let agent_id = std::env::var("CONVOY_AGENT_ID").unwrap_or_else(|_| default_agent_id());
        let mut config = Self::new(agent_id, server_url);

        config.token = std::env::var("CONVOY_TOKEN").ok().filter(|s| !s.is_empty());
        config.slots = parsed_var("CONVOY_SLOTS").unwrap_or(config.slots);
        config.heartbeat_interval = parsed_var("CONVOY_HEARTBEAT_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(config.heartbeat_interval);
        config.retry = RetryPolicy {
            limit: parsed_var("CONVOY_RETRY_LIMIT").unwrap_or(DEFAULT_RETRY_LIMIT),
            base: parsed_var("CONVOY_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_BASE),
            max: parsed_var("CONVOY_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_MAX),
        };
        if let Ok(labels) = std::env::var("CONVOY_LABELS") {
            config.labels = parse_labels(&labels)?;
        }
        if let Ok(engine) = std::env::var("CONVOY_ENGINE") {
            config.engine = engine;
        }
        if let Ok(workspace) = std::env::var("CONVOY_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }
        config.limits = ReportLimits {
            max_log_bytes: parsed_var("CONVOY_MAX_LOG_BYTES").unwrap_or(DEFAULT_MAX_LOG_BYTES),
            max_artifact_bytes: parsed_var("CONVOY_MAX_ARTIFACT_BYTES")
                .unwrap_or(DEFAULT_MAX_ARTIFACT_BYTES),
        };

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent_id.is_empty() {
            anyhow::bail!("agent_id cannot be empty");
        }

        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            anyhow::bail!("server_url must start with http:// or https://");
        }

        if self.slots == 0 {
            anyhow::bail!("slots must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.retry.limit == 0 {
            anyhow::bail!("retry limit must be greater than 0");
        }

        if self.retry.base > self.retry.max {
            anyhow::bail!("backoff base must not exceed backoff max");
        }

        if self.engine != "podman" && self.engine != "docker" {
            anyhow::bail!("engine must be 'podman' or 'docker', got '{}'", self.engine);
        }

        if self.limits.max_log_bytes == 0 || self.limits.max_artifact_bytes == 0 {
            anyhow::bail!("output limits must be greater than 0");
        }

        if self.limits.max_artifact_bytes > MAX_UPLOAD_BYTES {
            anyhow::bail!(
                "max_artifact_bytes must not exceed {} bytes",
                MAX_UPLOAD_BYTES
            );
        }

        Ok(())
    }
}

/// Parses `key=value` pairs separated by commas
pub fn parse_labels(s: &str) -> anyhow::Result<HashMap<String, String>> {
    s.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> anyhow::Result<(String, String)> {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("label '{}' is not key=value", pair))?;
            if key.trim().is_empty() {
                anyhow::bail!("label '{}' has an empty key", pair);
            }
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn default_agent_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "agent".to_string());
    format!("{}-{}", host, std::process::id())
}
