//! Deployment configuration.
//!
//! Values are consumed by the stores, the peer loader and the communication layer.
//! Durations are stored in milliseconds when (de)serialized so a config file reads
//! as plain JSON numbers.

use crate::deployment::types::DeploymentMode;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_UNDEPLOY_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_MISSING_RESOURCE_CACHE_SIZE: usize = 100;
pub const DEFAULT_DEAD_LOADER_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Mode advertised for code deployed from this node.
    pub mode: DeploymentMode,

    /// How long a peer fetch waits for an answer.
    #[serde(with = "millis")]
    pub peer_fetch_timeout: Duration,

    /// Grace window before a superseded deployment is undeployed.
    #[serde(with = "millis")]
    pub undeploy_grace: Duration,

    /// Capacity of each context's negative (missing-resource) cache. `0` disables it.
    pub missing_resource_cache_size: usize,

    /// Capacity of the per-version store's dead-loader list.
    pub dead_loader_cache_size: usize,

    /// Module name prefixes that must always resolve from the local code path.
    pub excluded_paths: Vec<String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Shared,
            peer_fetch_timeout: DEFAULT_PEER_FETCH_TIMEOUT,
            undeploy_grace: DEFAULT_UNDEPLOY_GRACE,
            missing_resource_cache_size: DEFAULT_MISSING_RESOURCE_CACHE_SIZE,
            dead_loader_cache_size: DEFAULT_DEAD_LOADER_CACHE_SIZE,
            excluded_paths: Vec::new(),
        }
    }
}

impl DeploymentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DeploymentConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_peer_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.peer_fetch_timeout = timeout;
        self
    }

    pub fn with_undeploy_grace(mut self, grace: Duration) -> Self {
        self.undeploy_grace = grace;
        self
    }

    pub fn with_excluded_paths(mut self, paths: Vec<String>) -> Self {
        self.excluded_paths = paths;
        self
    }

    /// True when `name` must never be fetched from a peer.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeploymentConfig::default();

        assert_eq!(config.mode, DeploymentMode::Shared);
        assert_eq!(config.peer_fetch_timeout, DEFAULT_PEER_FETCH_TIMEOUT);
        assert_eq!(config.missing_resource_cache_size, 100);
        assert!(config.excluded_paths.is_empty());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{ "mode": "Continuous", "peer_fetch_timeout": 250, "excluded_paths": ["sys."] }"#;

        let config: DeploymentConfig = serde_json::from_str(json).expect("valid config");

        assert_eq!(config.mode, DeploymentMode::Continuous);
        assert_eq!(config.peer_fetch_timeout, Duration::from_millis(250));
        assert_eq!(config.undeploy_grace, DEFAULT_UNDEPLOY_GRACE);
        assert!(config.is_excluded("sys.io.File"));
        assert!(!config.is_excluded("app.Task"));
    }

    #[test]
    fn test_empty_prefix_excludes_nothing() {
        let config = DeploymentConfig::default().with_excluded_paths(vec![String::new()]);

        assert!(!config.is_excluded("anything"));
    }
}
