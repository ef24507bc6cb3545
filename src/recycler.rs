//! Post-termination pod recycling.
//!
//! When a sandbox that adopted a warm pod terminates, the recycler decides
//! whether the pod may return to its pool. Safe pods are scrubbed in place
//! and flipped back to Ready; anything questionable is handed to the warm
//! pod reconciler for teardown instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{AttachParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::cache::ClusterCache;
use crate::config::RecyclerConfig;
use crate::crd::{LABEL_POOL, LABEL_SANDBOX_ID, Sandbox, WarmPod, WarmPodPhase, WarmPool};
use crate::errors::Error;
use crate::metrics;
use crate::patch::update_status;
use crate::podspec::{CONTAINER_NAME, PROVISION_MARKER};

/// What the recycler did with a terminated sandbox's warm pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleOutcome {
    /// Pod scrubbed and returned to its pool
    Recycled,
    /// Pod handed to the warm pod reconciler for teardown
    Rejected(&'static str),
}

/// Command run inside the pod to reset session state. Dotfiles survive,
/// including the provision marker.
const SCRUB_COMMAND: &str =
    "rm -rf /workspace/* /tmp/* && mkdir -p /workspace /tmp && chmod 0777 /workspace /tmp";

/// Budget for the best-effort write-scope inspection.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Recycler {
    client: Client,
    cache: Arc<ClusterCache>,
    scrub_timeout: Duration,
    max_age: Duration,
}

struct ExecOutput {
    success: bool,
    stdout: String,
}

impl Recycler {
    pub fn new(client: Client, cache: Arc<ClusterCache>, config: &RecyclerConfig) -> Self {
        Self {
            client,
            cache,
            scrub_timeout: config.scrub_timeout(),
            max_age: config.warm_pod_max_age(),
        }
    }

    /// Decide and execute: recycle the warm pod backing a terminated sandbox
    /// or reject it for teardown.
    pub async fn process(
        &self,
        sandbox: &Sandbox,
        warm_pod: &WarmPod,
    ) -> Result<RecycleOutcome, Error> {
        let pool_ref = &warm_pod.spec.pool_ref;
        let pool_namespace = if pool_ref.namespace.is_empty() {
            warm_pod.namespace().unwrap_or_default()
        } else {
            pool_ref.namespace.clone()
        };
        let pool = self.cache.warm_pool(&pool_namespace, &pool_ref.name);

        if let Err(reason) =
            should_recycle(sandbox, warm_pod, pool.as_ref(), Utc::now(), self.max_age)
        {
            return self.reject(warm_pod, reason).await;
        }

        let status = warm_pod.status_cloned();
        if status.pod_name.is_empty() {
            return self.reject(warm_pod, "pod-unknown").await;
        }
        let pod_namespace = if status.pod_namespace.is_empty() {
            warm_pod.namespace().unwrap_or_default()
        } else {
            status.pod_namespace.clone()
        };

        if self
            .wrote_outside_writable_paths(sandbox, &pod_namespace, &status.pod_name)
            .await
        {
            return self.reject(warm_pod, "wrote-outside-writable-paths").await;
        }

        self.return_pod_to_pool(warm_pod, &pod_namespace, &status.pod_name)
            .await?;

        match self.scrub(&pod_namespace, &status.pod_name).await {
            Ok(true) => {}
            Ok(false) => return self.reject(warm_pod, "scrub-failed").await,
            Err(Error::ScrubTimeout(_)) => return self.reject(warm_pod, "scrub-timeout").await,
            Err(err) => {
                warn!(pod = %status.pod_name, error = %err, "scrub exec error");
                return self.reject(warm_pod, "scrub-error").await;
            }
        }

        let namespace = warm_pod
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let api: Api<WarmPod> = Api::namespaced(self.client.clone(), &namespace);
        update_status(&api, &warm_pod.name_any(), |status| {
            status.phase = WarmPodPhase::Ready;
            status.assigned_to.clear();
            status.assigned_at = None;
            status.last_heartbeat = Some(Time(Utc::now()));
        })
        .await?;

        metrics::recycle_success();
        info!(
            warm_pod = %warm_pod.name_any(),
            sandbox = %sandbox.name_any(),
            "recycled warm pod back to its pool"
        );
        Ok(RecycleOutcome::Recycled)
    }

    /// Park the warm pod in Terminating; its reconciler deletes the backing
    /// pod and then the WarmPod itself.
    async fn reject(
        &self,
        warm_pod: &WarmPod,
        reason: &'static str,
    ) -> Result<RecycleOutcome, Error> {
        let namespace = warm_pod
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let api: Api<WarmPod> = Api::namespaced(self.client.clone(), &namespace);
        update_status(&api, &warm_pod.name_any(), |status| {
            status.phase = WarmPodPhase::Terminating;
        })
        .await?;

        metrics::recycle_rejected(reason);
        info!(
            warm_pod = %warm_pod.name_any(),
            reason,
            "recycle rejected"
        );
        Ok(RecycleOutcome::Rejected(reason))
    }

    /// Hand the backing pod back to its WarmPod: drop the sandbox owner
    /// reference and label first, then reinstate the WarmPod reference. Two
    /// steps; the warm pod reconciler tolerates the transient ownerless
    /// state.
    async fn return_pod_to_pool(
        &self,
        warm_pod: &WarmPod,
        pod_namespace: &str,
        pod_name: &str,
    ) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), pod_namespace);
        let pp = PatchParams::default();

        pods.patch(
            pod_name,
            &pp,
            &Patch::Merge(&json!({
                "metadata": {
                    "ownerReferences": [],
                    "labels": { LABEL_SANDBOX_ID: null },
                }
            })),
        )
        .await?;

        let owner = warm_pod
            .controller_owner_ref(&())
            .ok_or(Error::MissingField("metadata.name"))?;
        pods.patch(
            pod_name,
            &pp,
            &Patch::Merge(&json!({
                "metadata": {
                    "ownerReferences": [owner],
                    "labels": { LABEL_POOL: warm_pod.spec.pool_ref.name },
                }
            })),
        )
        .await?;

        Ok(())
    }

    /// Reset session state inside the pod. Ok(false) means the command ran
    /// but failed; a timeout aborts recycling entirely.
    async fn scrub(&self, namespace: &str, pod_name: &str) -> Result<bool, Error> {
        let output = tokio::time::timeout(
            self.scrub_timeout,
            self.exec(namespace, pod_name, &["sh", "-c", SCRUB_COMMAND]),
        )
        .await
        .map_err(|_| Error::ScrubTimeout(self.scrub_timeout))??;
        Ok(output.success)
    }

    /// Best-effort check for writes outside the declared writable paths:
    /// list root-filesystem files newer than the provision marker. An
    /// inspection failure passes (the check is advisory); a positive finding
    /// rejects.
    async fn wrote_outside_writable_paths(
        &self,
        sandbox: &Sandbox,
        namespace: &str,
        pod_name: &str,
    ) -> bool {
        let mut find = vec![
            "find".to_string(),
            "/".to_string(),
            "-xdev".to_string(),
            "-newer".to_string(),
            PROVISION_MARKER.to_string(),
        ];
        for path in &sandbox.spec.filesystem.writable_paths {
            find.push("-not".to_string());
            find.push("-path".to_string());
            find.push(format!("{}/*", path.trim_end_matches('/')));
        }
        let args: Vec<&str> = find.iter().map(|s| s.as_str()).collect();

        match tokio::time::timeout(INSPECT_TIMEOUT, self.exec(namespace, pod_name, &args)).await {
            Ok(Ok(output)) if output.success => !output.stdout.trim().is_empty(),
            _ => false,
        }
    }

    /// Run a command in the pod over the exec channel and collect stdout.
    async fn exec(&self, namespace: &str, pod_name: &str, cmd: &[&str]) -> Result<ExecOutput, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut attached = pods
            .exec(
                pod_name,
                cmd.iter().copied(),
                &AttachParams::default()
                    .container(CONTAINER_NAME)
                    .stdout(true)
                    .stderr(false),
            )
            .await?;

        let status_future = attached.take_status();

        let mut stdout_buf = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_end(&mut stdout_buf).await.ok();
        }

        let status = match status_future {
            Some(fut) => fut.await,
            None => None,
        };
        let success = status
            .and_then(|s| s.status)
            .map(|s| s == "Success")
            .unwrap_or(false);

        Ok(ExecOutput {
            success,
            stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
        })
    }
}

/// The recycling predicate: every clause must hold or the pod is rejected.
pub(crate) fn should_recycle(
    sandbox: &Sandbox,
    warm_pod: &WarmPod,
    pool: Option<&WarmPool>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<(), &'static str> {
    let Some(pool) = pool else {
        return Err("pool-gone");
    };
    if pool.metadata.deletion_timestamp.is_some() {
        return Err("pool-gone");
    }
    // recycling is only worth it when the pool is short
    if pool.available() >= pool.spec.min_size {
        return Err("pool-not-short");
    }

    let Some(created) = warm_pod.metadata.creation_timestamp.as_ref() else {
        return Err("age-unknown");
    };
    let age = now.signed_duration_since(created.0);
    let max = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    if age > max {
        return Err("too-old");
    }

    let status = sandbox.status_cloned();
    if !status.security_events.is_empty() {
        return Err("security-events");
    }
    if status
        .installed_packages
        .iter()
        .any(|p| !pool.spec.preload_packages.contains(p))
    {
        return Err("untracked-packages");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        SandboxSpec, SandboxStatus, SecurityEvent, WarmPodSpec, WarmPoolSpec, WarmPoolStatus,
    };

    fn make_sandbox(status: SandboxStatus) -> Sandbox {
        let spec: SandboxSpec =
            serde_json::from_value(serde_json::json!({ "runtime": "python:3.10" })).unwrap();
        let mut sandbox = Sandbox::new("sb-1", spec);
        sandbox.status = Some(status);
        sandbox
    }

    fn make_pool(min_size: u32, available: u32, preload: &[&str]) -> WarmPool {
        let spec: WarmPoolSpec = serde_json::from_value(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": min_size,
            "preloadPackages": preload,
        }))
        .unwrap();
        let mut pool = WarmPool::new("pool", spec);
        pool.status = Some(WarmPoolStatus {
            available_pods: available,
            ..Default::default()
        });
        pool
    }

    fn make_warm_pod(age: Duration, now: DateTime<Utc>) -> WarmPod {
        let spec: WarmPodSpec = serde_json::from_value(serde_json::json!({
            "poolRef": { "name": "pool" },
        }))
        .unwrap();
        let mut wp = WarmPod::new("wp-1", spec);
        wp.metadata.creation_timestamp =
            Some(Time(now - chrono::Duration::from_std(age).unwrap()));
        wp
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_recycle_allowed_when_all_clauses_hold() {
        let now = Utc::now();
        let sandbox = make_sandbox(SandboxStatus {
            installed_packages: vec!["numpy".to_string()],
            ..Default::default()
        });
        let pool = make_pool(2, 1, &["numpy", "pandas"]);
        let wp = make_warm_pod(Duration::from_secs(3600), now);
        assert_eq!(should_recycle(&sandbox, &wp, Some(&pool), now, DAY), Ok(()));
    }

    #[test]
    fn test_reject_when_pool_gone_or_full() {
        let now = Utc::now();
        let sandbox = make_sandbox(SandboxStatus::default());
        let wp = make_warm_pod(Duration::from_secs(60), now);
        assert_eq!(
            should_recycle(&sandbox, &wp, None, now, DAY),
            Err("pool-gone")
        );
        let full = make_pool(1, 1, &[]);
        assert_eq!(
            should_recycle(&sandbox, &wp, Some(&full), now, DAY),
            Err("pool-not-short")
        );
    }

    #[test]
    fn test_reject_old_pods() {
        let now = Utc::now();
        let sandbox = make_sandbox(SandboxStatus::default());
        let pool = make_pool(2, 0, &[]);
        let wp = make_warm_pod(DAY + Duration::from_secs(1), now);
        assert_eq!(
            should_recycle(&sandbox, &wp, Some(&pool), now, DAY),
            Err("too-old")
        );
    }

    #[test]
    fn test_reject_on_security_events() {
        let now = Utc::now();
        let sandbox = make_sandbox(SandboxStatus {
            security_events: vec![SecurityEvent {
                type_: "SyscallDenied".to_string(),
                message: String::new(),
                timestamp: None,
            }],
            ..Default::default()
        });
        let pool = make_pool(2, 0, &[]);
        let wp = make_warm_pod(Duration::from_secs(60), now);
        assert_eq!(
            should_recycle(&sandbox, &wp, Some(&pool), now, DAY),
            Err("security-events")
        );
    }

    #[test]
    fn test_reject_untracked_packages() {
        let now = Utc::now();
        let sandbox = make_sandbox(SandboxStatus {
            installed_packages: vec!["numpy".to_string(), "leftpad".to_string()],
            ..Default::default()
        });
        let pool = make_pool(2, 0, &["numpy"]);
        let wp = make_warm_pod(Duration::from_secs(60), now);
        assert_eq!(
            should_recycle(&sandbox, &wp, Some(&pool), now, DAY),
            Err("untracked-packages")
        );
    }
}
