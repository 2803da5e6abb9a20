//! Configuration types for the fail2ban agent.

use crate::policy::JailPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration for the fail2ban agent.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Ban thresholds.
    #[serde(default)]
    pub jail: JailConfig,

    /// External address set.
    #[serde(default)]
    pub ip_set: IpSetConfig,

    /// Infraction store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Background reconciliation.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Reporting endpoint.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Ban thresholds, in fail2ban jail terms.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JailConfig {
    /// Infractions within `find_time_seconds` that trigger a ban.
    #[serde(default = "default_max_retry")]
    pub max_retry: usize,

    /// Sliding window length.
    #[serde(default = "default_find_time")]
    pub find_time_seconds: u64,

    /// Ban length after the most recent qualifying infraction.
    #[serde(default = "default_ban_time")]
    pub ban_time_seconds: u64,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            find_time_seconds: default_find_time(),
            ban_time_seconds: default_ban_time(),
        }
    }
}

impl JailConfig {
    pub fn policy(&self) -> JailPolicy {
        JailPolicy::new(self.max_retry, self.find_time_seconds, self.ban_time_seconds)
    }

    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.ban_time_seconds)
    }
}

/// Upper bound of `find_time_seconds` and `ban_time_seconds`.
pub const MAX_TIME_SECONDS: u64 = 365 * 24 * 60 * 60;

fn default_max_retry() -> usize {
    3
}

fn default_find_time() -> u64 {
    600
}

fn default_ban_time() -> u64 {
    1800
}

/// Regional WAF IP set configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpSetConfig {
    /// Name of the IP set.
    #[serde(default = "default_ip_set_name")]
    pub name: String,

    /// AWS region (defaults to the CLI's configured region).
    #[serde(default)]
    pub region: Option<String>,

    /// Path to the AWS CLI.
    #[serde(default = "default_aws_cli")]
    pub aws_cli: String,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_ip_set_timeout")]
    pub timeout_ms: u64,
}

impl Default for IpSetConfig {
    fn default() -> Self {
        Self {
            name: default_ip_set_name(),
            region: None,
            aws_cli: default_aws_cli(),
            timeout_ms: default_ip_set_timeout(),
        }
    }
}

fn default_ip_set_name() -> String {
    "fail2ban".to_string()
}

fn default_aws_cli() -> String {
    "aws".to_string()
}

fn default_ip_set_timeout() -> u64 {
    30000
}

/// Infraction store backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, for a single instance.
    #[default]
    Memory,
    /// Redis, shared by every instance.
    Redis,
}

/// Infraction store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Record key prefix, keys are `<prefix>-<address>`.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "aws-fail2ban".to_string()
}

fn default_store_timeout() -> u64 {
    5000
}

/// Reconciler schedule.
///
/// Jitter only smooths load across replicas; correctness never depends on
/// replicas sweeping at different times.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    /// Base sweep period.
    #[serde(default = "default_period")]
    pub period_seconds: u64,

    /// Random extra delay added to each period.
    #[serde(default)]
    pub jitter_seconds: u64,

    /// Random delay before the startup back-fill.
    #[serde(default)]
    pub startup_jitter_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_period(),
            jitter_seconds: 0,
            startup_jitter_seconds: 0,
        }
    }
}

fn default_period() -> u64 {
    60
}

/// Reporting endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Serve the `/state/infractions` dump.
    #[serde(default)]
    pub expose_state: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            expose_state: false,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jail.max_retry == 0 {
            anyhow::bail!("jail.max_retry must be at least 1");
        }
        if self.jail.find_time_seconds == 0 || self.jail.ban_time_seconds == 0 {
            anyhow::bail!("jail.find_time_seconds and jail.ban_time_seconds must be positive");
        }
        if self.jail.find_time_seconds > MAX_TIME_SECONDS
            || self.jail.ban_time_seconds > MAX_TIME_SECONDS
        {
            anyhow::bail!(
                "jail.find_time_seconds and jail.ban_time_seconds must not exceed {} (one year)",
                MAX_TIME_SECONDS
            );
        }

        if self.ip_set.name.trim().is_empty() {
            anyhow::bail!("ip_set.name is empty");
        }
        if self.ip_set.timeout_ms == 0 || self.store.timeout_ms == 0 {
            anyhow::bail!("timeouts must be positive");
        }

        if self.store.key_prefix.is_empty() {
            anyhow::bail!("store.key_prefix is empty");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            anyhow::bail!("store.backend is redis but store.redis_url is empty");
        }

        if self.reconciler.period_seconds == 0 {
            anyhow::bail!("reconciler.period_seconds must be positive");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Fail2ban Agent Configuration

# Ban thresholds (fail2ban jail options)
jail:
  max_retry: 3                 # Infractions that trigger a ban...
  find_time_seconds: 600       # ...within this window
  ban_time_seconds: 1800       # Ban length after the last qualifying infraction

# Regional WAFv2 IP set holding banned addresses
ip_set:
  name: "fail2ban"
  # region: "eu-west-1"        # Defaults to the AWS CLI's region
  aws_cli: "aws"
  timeout_ms: 30000

# Infraction store
store:
  backend: memory              # memory (single instance) or redis (shared)
  redis_url: "${REDIS_URL}"
  key_prefix: "aws-fail2ban"
  timeout_ms: 5000

# Background sweep that lifts expired bans
reconciler:
  period_seconds: 60
  jitter_seconds: 0            # Spread sweeps of several replicas
  startup_jitter_seconds: 0    # Spread simultaneous replica starts

# Reporting endpoint
server:
  listen: "0.0.0.0:8000"
  expose_state: false          # Serve /state/infractions
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern");

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
