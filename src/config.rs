//! YAML configuration file
//!
//! Every field is optional. Command-line flags (and their `SPACELINK_*`
//! environment variables) take precedence over values read here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spacelink_retry::RetryPolicy;
use spacelink_status::SpaceInfo;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub relay: RelaySection,
    pub agent: AgentSection,
    pub retry: RetrySection,
    pub status: StatusSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySection {
    pub client_addr: Option<String>,
    pub tunnel_addr: Option<String>,
    pub max_idle_tunnels: Option<usize>,
    pub client_wait_secs: Option<u64>,
    pub buffer_size: Option<usize>,
    /// Also serve the status API from the relay process
    pub status_addr: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Relay tunnel port (host:port)
    pub relay: Option<String>,
    /// Local service (host:port)
    pub local: Option<String>,
    pub buffer_size: Option<usize>,
    pub status_url: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub on_exhausted: Option<OnExhausted>,
    pub restart_cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    /// Cool down and start a fresh circuit
    Restart,
    /// Exit with an error
    Fail,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_attempts: Option<u32>,
}

impl RetrySection {
    /// Fill unset fields from the default policy
    pub fn to_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            initial_backoff: self
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: self
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSection {
    pub bind_addr: Option<String>,
    pub freshness_secs: Option<u64>,
    /// Static part of the presence document
    pub space: Option<SpaceInfo>,
}

impl ConfigFile {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Invalid configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = ConfigFile::from_yaml("{}").unwrap();
        assert!(config.relay.client_addr.is_none());
        assert!(config.agent.relay.is_none());

        let policy = config.retry.to_policy();
        assert_eq!(policy.max_attempts, 10000);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_full_file() {
        let yaml = r#"
relay:
  client_addr: "0.0.0.0:4000"
  tunnel_addr: "0.0.0.0:3000"
  max_idle_tunnels: 4
  status_addr: "0.0.0.0:2000"
agent:
  relay: "relay.example.com:3000"
  local: "localhost:5000"
  status_url: "http://relay.example.com:2000/"
  on_exhausted: fail
retry:
  initial_backoff_ms: 500
  max_attempts: 20
status:
  freshness_secs: 90
  space:
    space: "CADR"
    url: "https://cadr.example.org"
"#;
        let config = ConfigFile::from_yaml(yaml).unwrap();
        assert_eq!(config.relay.max_idle_tunnels, Some(4));
        assert_eq!(config.agent.on_exhausted, Some(OnExhausted::Fail));
        assert_eq!(config.status.freshness_secs, Some(90));

        let space = config.status.space.unwrap();
        assert_eq!(space.space, "CADR");
        assert_eq!(space.api, "0.13");

        let policy = config.retry.to_policy();
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 20);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ConfigFile::from_yaml("relay:\n  clinet_addr: \"x:1\"\n").is_err());
    }
}
