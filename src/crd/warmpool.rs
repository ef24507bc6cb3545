//! WarmPool custom resource: a declared reservoir of pre-initialized pods
//! for one (runtime, security level) class.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use super::sandbox::{ResourceRequests, SecurityLevel};

/// Spec for the WarmPool custom resource
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "safespace.dev",
    version = "v1",
    kind = "WarmPool",
    plural = "warmpools",
    shortname = "wpl",
    status = "WarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolSpec {
    /// Runtime environment every pool member is initialized for
    pub runtime: String,
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Lower bound on ready pods; the reconciler tops the pool up to this
    #[serde(default)]
    pub min_size: u32,
    /// Upper bound on total pods (0 = unbounded)
    #[serde(default)]
    pub max_size: u32,
    /// Seconds a pod may idle in the pool before expiry (0 = no expiry)
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub resources: ResourceRequests,
    /// Packages installed during pre-initialization; also the recycling
    /// allowlist
    #[serde(default)]
    pub preload_packages: Vec<String>,
    /// Scripts run in order during pre-initialization
    #[serde(default)]
    pub preload_scripts: Vec<PreloadScript>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<AutoScaling>,
}

/// One named pre-initialization script
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreloadScript {
    pub name: String,
    pub content: String,
}

/// Utilization-driven sizing policy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoScaling {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_utilization")]
    pub target_utilization_percent: u32,
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_seconds: u64,
}

fn default_target_utilization() -> u32 {
    80
}
fn default_scale_down_delay() -> u64 {
    300
}

impl Default for AutoScaling {
    fn default() -> Self {
        Self {
            enabled: false,
            target_utilization_percent: default_target_utilization(),
            scale_down_delay_seconds: default_scale_down_delay(),
        }
    }
}

/// Status reported by the reconciler on the WarmPool
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolStatus {
    /// Ready, assignable pods
    #[serde(default)]
    pub available_pods: u32,
    /// Pods currently bound to sandboxes
    #[serde(default)]
    pub assigned_pods: u32,
    /// Pods still initializing
    #[serde(default)]
    pub pending_pods: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WarmPool {
    /// Owned copy of the status, defaulted when absent.
    pub fn status_cloned(&self) -> WarmPoolStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Ready pods as last observed by the pool reconciler.
    pub fn available(&self) -> u32 {
        self.status.as_ref().map(|s| s.available_pods).unwrap_or(0)
    }
}
