//! Sandbox custom resource: a declared ephemeral execution environment.
//!
//! The spec is the user's intent (runtime, isolation, resources, network);
//! the status is what the reconciler observed. Phase transitions only move
//! forward along the lifecycle; regressions happen only on failure.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::conditions::Condition;

/// Spec for the Sandbox custom resource
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "safespace.dev",
    version = "v1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Runtime environment, e.g. `python:3.10`. Must name a known runtime.
    pub runtime: String,
    /// Isolation profile applied to the backing pod
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Seconds after start before the sandbox is reclaimed (0 = no timeout)
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Resource limits in Kubernetes quantity notation
    #[serde(default)]
    pub resources: ResourceRequests,
    /// Egress allowlist and ingress toggle
    #[serde(default)]
    pub network_access: NetworkAccess,
    /// Root filesystem mutability and writable mounts
    #[serde(default)]
    pub filesystem: FilesystemSpec,
    /// Prefer adopting a pre-warmed pod over a cold start
    #[serde(default)]
    pub use_warm_pool: bool,
    /// Optional profile providing spec defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<ProfileRef>,
    /// Owning user, used by the API layer for access checks
    #[serde(default)]
    pub owner_user_id: String,
}

/// Isolation profile names
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Standard,
    High,
    Custom,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Standard => write!(f, "standard"),
            SecurityLevel::High => write!(f, "high"),
            SecurityLevel::Custom => write!(f, "custom"),
        }
    }
}

/// CPU/memory/storage limits in Kubernetes quantity notation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<String>,
}

fn default_cpu() -> String {
    "500m".to_string()
}
fn default_memory() -> String {
    "512Mi".to_string()
}

impl Default for ResourceRequests {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            ephemeral_storage: None,
        }
    }
}

/// Network posture: default-deny with declared egress holes
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAccess {
    #[serde(default)]
    pub egress: Vec<EgressRule>,
    #[serde(default)]
    pub ingress: bool,
}

/// One egress allowlist entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    /// Destination domain (FQDN); enforcement requires a DNS-aware CNI
    pub domain: String,
    #[serde(default)]
    pub ports: Vec<PortRule>,
}

/// Port and protocol for an egress rule
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    pub port: u16,
    /// TCP or UDP; empty defaults to TCP
    #[serde(default)]
    pub protocol: String,
}

/// Root filesystem mutability and writable mounts
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    #[serde(default = "default_true")]
    pub read_only_root: bool,
    #[serde(default = "default_writable_paths")]
    pub writable_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_writable_paths() -> Vec<String> {
    vec!["/workspace".to_string(), "/tmp".to_string()]
}

impl Default for FilesystemSpec {
    fn default() -> Self {
        Self {
            read_only_root: true,
            writable_paths: default_writable_paths(),
        }
    }
}

/// Reference to a SandboxProfile providing spec defaults
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Status reported by the reconciler on the Sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Name of the backing pod
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    /// When the sandbox reached Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// In-cluster address where the execution service is reachable
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Set when the backing pod was adopted from a warm pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pod_ref: Option<WarmPodRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    /// Findings reported by external policy engines; the recycler refuses
    /// pods whose sandbox recorded any. Nothing in the control plane writes
    /// this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_events: Vec<SecurityEvent>,
    /// Packages the in-pod agent reports as installed during the session
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installed_packages: Vec<String>,
}

/// Top-level lifecycle phase of a Sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SandboxPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Creating,
    Running,
    Terminating,
    Failed,
    Terminated,
}

impl SandboxPhase {
    /// Terminated is the only phase with nothing left to reconcile.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxPhase::Terminated)
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxPhase::Unset => "",
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Creating => "Creating",
            SandboxPhase::Running => "Running",
            SandboxPhase::Terminating => "Terminating",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// Name+namespace reference to the WarmPod a sandbox adopted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Observed resource consumption
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

/// One security finding attached to a sandbox by an external producer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Time>,
}

impl Sandbox {
    /// Current phase, defaulting to Unset when status is absent.
    pub fn phase(&self) -> SandboxPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Owned copy of the status, defaulted when absent.
    pub fn status_cloned(&self) -> SandboxStatus {
        self.status.clone().unwrap_or_default()
    }
}
