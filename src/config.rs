//! Configuration parsing for safespace.toml files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure matching the safespace.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub controllers: ControllersConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub recycler: RecyclerConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
}

/// Cluster connectivity and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Namespace where sandbox resources live
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Path to a kubeconfig file (defaults to in-cluster, then ~/.kube/config)
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Kubeconfig context to use
    #[serde(default)]
    pub context: Option<String>,
    /// Optional runtime class for sandbox pods (e.g. "gvisor", "kata")
    #[serde(default)]
    pub runtime_class: Option<String>,
}

fn default_namespace() -> String {
    "safespace".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig: None,
            context: None,
            runtime_class: None,
        }
    }
}

/// Reconciler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllersConfig {
    /// Concurrent reconciles per controller kind
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Full resync interval guarding against missed watch events
    #[serde(default = "default_resync_seconds")]
    pub resync_interval_seconds: u64,
    /// Per-reconcile deadline; exceeding it returns an error and requeues
    #[serde(default = "default_reconcile_deadline")]
    pub reconcile_deadline_seconds: u64,
}

fn default_worker_count() -> usize {
    4
}
fn default_resync_seconds() -> u64 {
    30
}
fn default_reconcile_deadline() -> u64 {
    120
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            resync_interval_seconds: default_resync_seconds(),
            reconcile_deadline_seconds: default_reconcile_deadline(),
        }
    }
}

impl ControllersConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }

    pub fn reconcile_deadline(&self) -> Duration {
        Duration::from_secs(self.reconcile_deadline_seconds)
    }
}

/// Background sweeper deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_interval")]
    pub interval_seconds: u64,
    /// Slack added to a sandbox's own timeout before enforcement
    #[serde(default = "default_timeout_grace")]
    pub timeout_grace_seconds: u64,
    /// How long a sandbox may sit in Pending/Creating before it is failed
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_seconds: u64,
}

fn default_sweeper_interval() -> u64 {
    30
}
fn default_timeout_grace() -> u64 {
    300
}
fn default_stuck_threshold() -> u64 {
    600
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweeper_interval(),
            timeout_grace_seconds: default_timeout_grace(),
            stuck_threshold_seconds: default_stuck_threshold(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_secs(self.timeout_grace_seconds)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_seconds)
    }
}

/// Pod recycling bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecyclerConfig {
    /// Wall-clock budget for the in-pod scrub
    #[serde(default = "default_scrub_timeout")]
    pub scrub_timeout_seconds: u64,
    /// Oldest a pod may be and still return to its pool
    #[serde(default = "default_warm_pod_max_age")]
    pub warm_pod_max_age_seconds: u64,
}

fn default_scrub_timeout() -> u64 {
    10
}
fn default_warm_pod_max_age() -> u64 {
    24 * 60 * 60
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self {
            scrub_timeout_seconds: default_scrub_timeout(),
            warm_pod_max_age_seconds: default_warm_pod_max_age(),
        }
    }
}

impl RecyclerConfig {
    pub fn scrub_timeout(&self) -> Duration {
        Duration::from_secs(self.scrub_timeout_seconds)
    }

    pub fn warm_pod_max_age(&self) -> Duration {
        Duration::from_secs(self.warm_pod_max_age_seconds)
    }
}

/// Warm-pod allocation scoping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Restrict candidate pools to one namespace (unset = all namespaces)
    #[serde(default)]
    pub pool_namespace: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse safespace.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.cluster.namespace, "safespace");
        assert_eq!(config.controllers.worker_count, 4);
        assert_eq!(config.controllers.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.sweeper.interval(), Duration::from_secs(30));
        assert_eq!(config.sweeper.timeout_grace(), Duration::from_secs(300));
        assert_eq!(config.sweeper.stuck_threshold(), Duration::from_secs(600));
        assert_eq!(config.recycler.scrub_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.recycler.warm_pod_max_age(),
            Duration::from_secs(86400)
        );
        assert!(config.allocator.pool_namespace.is_none());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config = Config::from_toml(
            r#"
[cluster]
namespace = "sandboxes"
runtime_class = "gvisor"

[controllers]
worker_count = 8

[sweeper]
stuck_threshold_seconds = 120

[allocator]
pool_namespace = "warm-pools"
"#,
        )
        .unwrap();
        assert_eq!(config.cluster.namespace, "sandboxes");
        assert_eq!(config.cluster.runtime_class.as_deref(), Some("gvisor"));
        assert_eq!(config.controllers.worker_count, 8);
        // untouched sections keep their defaults
        assert_eq!(config.controllers.resync_interval_seconds, 30);
        assert_eq!(config.sweeper.stuck_threshold(), Duration::from_secs(120));
        assert_eq!(
            config.allocator.pool_namespace.as_deref(),
            Some("warm-pools")
        );
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(Config::from_toml("[cluster\nnamespace=").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safespace.toml");
        std::fs::write(&path, "[controllers]\nworker_count = 2\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.controllers.worker_count, 2);
    }
}
