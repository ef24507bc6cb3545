//! Custom resource definitions for the safespace control plane.
//!
//! Three CRDs in the `safespace.dev/v1` API group: `Sandbox` (a user's
//! declared execution environment), `WarmPool` (a reservoir of pre-warmed
//! pods for one runtime/security-level class), and `WarmPod` (a single pool
//! member). Backing Pods are plain core/v1 resources tied in through owner
//! references and labels.

pub mod conditions;
pub mod sandbox;
pub mod warmpod;
pub mod warmpool;

pub use conditions::{Condition, ConditionStatus, set_condition};
pub use sandbox::{
    EgressRule, FilesystemSpec, NetworkAccess, PortRule, ProfileRef, ResourceRequests, Sandbox,
    SandboxPhase, SandboxSpec, SandboxStatus, SecurityEvent, SecurityLevel, WarmPodRef,
};
pub use warmpod::{PoolRef, WarmPod, WarmPodPhase, WarmPodSpec, WarmPodStatus};
pub use warmpool::{AutoScaling, PreloadScript, WarmPool, WarmPoolSpec, WarmPoolStatus};

/// API group for all safespace resources.
pub const API_GROUP: &str = "safespace.dev";

/// Finalizer that blocks deletion until the reconciler finishes cleanup.
pub const FINALIZER: &str = "safespace.dev/cleanup";

/// Label identifying the controller that manages a resource.
pub const LABEL_MANAGED_BY: &str = "safespace.dev/managed-by";

/// Label binding a backing pod to the sandbox using it.
pub const LABEL_SANDBOX_ID: &str = "safespace.dev/sandbox-id";

/// Label binding a WarmPod (and its backing pod) to its pool.
pub const LABEL_POOL: &str = "safespace.dev/pool";

/// Value for [`LABEL_MANAGED_BY`] on everything this controller creates.
pub const MANAGER_NAME: &str = "safespace-controller";
