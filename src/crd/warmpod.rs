//! WarmPod custom resource: a single pre-initialized pod owned by a pool.
//!
//! The allocator moves a WarmPod from `Ready` to `Assigned` with a single
//! compare-and-swap status write; that write is the serialization point for
//! all concurrent sandbox reconciles.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Spec for the WarmPod custom resource
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "safespace.dev",
    version = "v1",
    kind = "WarmPod",
    plural = "warmpods",
    shortname = "wpd",
    status = "WarmPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodSpec {
    /// The pool this pod belongs to
    pub pool_ref: PoolRef,
}

/// Name+namespace reference to the owning WarmPool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Status for the WarmPod
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodStatus {
    #[serde(default)]
    pub phase: WarmPodPhase,
    /// Name of the backing pod
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    /// Sandbox id this pod is bound to; empty unless phase is Assigned
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Time>,
}

/// Lifecycle phase of a WarmPod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum WarmPodPhase {
    #[default]
    Pending,
    Ready,
    Assigned,
    Terminating,
}

impl fmt::Display for WarmPodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarmPodPhase::Pending => "Pending",
            WarmPodPhase::Ready => "Ready",
            WarmPodPhase::Assigned => "Assigned",
            WarmPodPhase::Terminating => "Terminating",
        };
        write!(f, "{}", s)
    }
}

impl WarmPod {
    /// Current phase, defaulting to Pending when status is absent.
    pub fn phase(&self) -> WarmPodPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Owned copy of the status, defaulted when absent.
    pub fn status_cloned(&self) -> WarmPodStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Name of the backing pod, if one was recorded.
    pub fn pod_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.pod_name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// True when the pod is assignable: Ready and unbound.
    pub fn is_assignable(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        status.phase == WarmPodPhase::Ready && status.assigned_to.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_phase_is_pending() {
        let status = WarmPodStatus::default();
        assert_eq!(status.phase, WarmPodPhase::Pending);
    }

    #[test]
    fn test_assignable_requires_ready_and_unbound() {
        let mut wp: WarmPod = serde_json::from_value(serde_json::json!({
            "apiVersion": "safespace.dev/v1",
            "kind": "WarmPod",
            "metadata": { "name": "wp-a", "namespace": "pools" },
            "spec": { "poolRef": { "name": "python-pool" } },
        }))
        .unwrap();
        assert!(!wp.is_assignable());

        wp.status = Some(WarmPodStatus {
            phase: WarmPodPhase::Ready,
            ..Default::default()
        });
        assert!(wp.is_assignable());

        wp.status.as_mut().unwrap().assigned_to = "sb-1".to_string();
        assert!(!wp.is_assignable());
    }
}
