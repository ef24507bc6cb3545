//! Atomic warm-pod assignment.
//!
//! `allocate` moves one WarmPod from `Ready` to `Assigned` for a sandbox, or
//! reports a miss. It must be linearizable across concurrent sandbox
//! reconciles: two sandboxes never receive the same pod. The apiserver's
//! resourceVersion check on the status write is the only serialization
//! point; no in-process lock is involved.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::debug;

use crate::cache::ClusterCache;
use crate::crd::{Sandbox, SandboxSpec, WarmPod, WarmPodPhase, WarmPool};
use crate::errors::{Error, is_conflict};
use crate::metrics;

pub struct WarmPodAllocator {
    client: Client,
    cache: Arc<ClusterCache>,
    /// Restrict candidate pools to one namespace when set
    pool_namespace: Option<String>,
}

impl WarmPodAllocator {
    pub fn new(client: Client, cache: Arc<ClusterCache>, pool_namespace: Option<String>) -> Self {
        Self {
            client,
            cache,
            pool_namespace,
        }
    }

    /// Try to claim a Ready warm pod compatible with the sandbox. Returns
    /// `None` on a miss; the caller falls back to a cold start.
    pub async fn allocate(&self, sandbox: &Sandbox) -> Result<Option<WarmPod>, Error> {
        let pools = candidate_pools(
            self.cache.warm_pools(),
            &sandbox.spec,
            self.pool_namespace.as_deref(),
        );

        for pool in pools {
            let pool_namespace = pool.namespace().unwrap_or_default();
            let pool_name = pool.name_any();
            let candidates =
                ready_pods_oldest_first(self.cache.warm_pods_for_pool(&pool_namespace, &pool_name));

            for candidate in candidates {
                match self.try_claim(&candidate, sandbox).await? {
                    Some(claimed) => {
                        metrics::allocation("hit");
                        debug!(
                            warm_pod = %claimed.name_any(),
                            pool = %pool_name,
                            sandbox = %sandbox.name_any(),
                            "claimed warm pod"
                        );
                        return Ok(Some(claimed));
                    }
                    // Lost the race or the pod moved on; never retry the
                    // same pod within one call.
                    None => continue,
                }
            }
        }

        metrics::allocation("miss");
        Ok(None)
    }

    /// Compare-and-swap one candidate from Ready to Assigned. A `None`
    /// return means the candidate was not claimable (gone, no longer Ready,
    /// or someone else won the write).
    async fn try_claim(
        &self,
        candidate: &WarmPod,
        sandbox: &Sandbox,
    ) -> Result<Option<WarmPod>, Error> {
        let namespace = candidate
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let name = candidate.name_any();
        let api: Api<WarmPod> = Api::namespaced(self.client.clone(), &namespace);

        // Fresh read: the cached copy may be stale on either side of the race.
        let Some(mut latest) = api.get_opt(&name).await? else {
            return Ok(None);
        };
        if latest.metadata.deletion_timestamp.is_some() {
            return Ok(None);
        }
        let status = latest.status.get_or_insert_with(Default::default);
        if status.phase != WarmPodPhase::Ready || !status.assigned_to.is_empty() {
            return Ok(None);
        }

        status.phase = WarmPodPhase::Assigned;
        status.assigned_to = sandbox.name_any();
        status.assigned_at = Some(Time(Utc::now()));

        // replace_status carries the resourceVersion from the read above;
        // a stale version surfaces as a 409 and the candidate is skipped.
        match api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&latest)?)
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(err) if is_conflict(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Pools able to serve the sandbox: runtime must match, exact security-level
/// matches sort first, then higher availability.
pub(crate) fn candidate_pools(
    pools: Vec<WarmPool>,
    spec: &SandboxSpec,
    namespace_scope: Option<&str>,
) -> Vec<WarmPool> {
    let mut matching: Vec<WarmPool> = pools
        .into_iter()
        .filter(|p| p.spec.runtime == spec.runtime)
        .filter(|p| {
            namespace_scope
                .map(|ns| p.metadata.namespace.as_deref() == Some(ns))
                .unwrap_or(true)
        })
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();

    matching.sort_by(|a, b| {
        let a_exact = a.spec.security_level == spec.security_level;
        let b_exact = b.spec.security_level == spec.security_level;
        b_exact
            .cmp(&a_exact)
            .then_with(|| b.available().cmp(&a.available()))
    });
    matching
}

/// Assignable pods ordered oldest-first, which maximizes recycling fairness
/// and keeps TTL expiry from surprising a fresh assignment.
pub(crate) fn ready_pods_oldest_first(pods: Vec<WarmPod>) -> Vec<WarmPod> {
    let mut ready: Vec<WarmPod> = pods
        .into_iter()
        .filter(|wp| wp.is_assignable() && wp.metadata.deletion_timestamp.is_none())
        .collect();
    ready.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
    });
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{WarmPodSpec, WarmPodStatus, WarmPoolSpec, WarmPoolStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn make_pool(name: &str, runtime: &str, level: &str, available: u32) -> WarmPool {
        let spec: WarmPoolSpec = serde_json::from_value(serde_json::json!({
            "runtime": runtime,
            "securityLevel": level,
            "minSize": 1,
        }))
        .unwrap();
        let mut pool = WarmPool::new(name, spec);
        pool.metadata.namespace = Some("pools".to_string());
        pool.status = Some(WarmPoolStatus {
            available_pods: available,
            ..Default::default()
        });
        pool
    }

    fn make_warm_pod(name: &str, phase: WarmPodPhase, created_secs: i64) -> WarmPod {
        let spec: WarmPodSpec = serde_json::from_value(serde_json::json!({
            "poolRef": { "name": "p", "namespace": "pools" },
        }))
        .unwrap();
        let mut wp = WarmPod::new(name, spec);
        wp.metadata.namespace = Some("pools".to_string());
        wp.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::from_timestamp(created_secs, 0).unwrap(),
        ));
        wp.status = Some(WarmPodStatus {
            phase,
            ..Default::default()
        });
        wp
    }

    fn sandbox_spec(runtime: &str, level: &str) -> SandboxSpec {
        serde_json::from_value(serde_json::json!({
            "runtime": runtime,
            "securityLevel": level,
        }))
        .unwrap()
    }

    #[test]
    fn test_candidate_pools_filters_runtime() {
        let pools = vec![
            make_pool("py", "python:3.10", "standard", 1),
            make_pool("node", "node:20", "standard", 5),
        ];
        let spec = sandbox_spec("python:3.10", "standard");
        let candidates = candidate_pools(pools, &spec, None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].metadata.name.as_deref(), Some("py"));
    }

    #[test]
    fn test_candidate_pools_prefers_exact_security_level() {
        let pools = vec![
            make_pool("high-pool", "python:3.10", "high", 10),
            make_pool("std-pool", "python:3.10", "standard", 1),
        ];
        let spec = sandbox_spec("python:3.10", "standard");
        let candidates = candidate_pools(pools, &spec, None);
        // exact match first despite lower availability
        assert_eq!(candidates[0].metadata.name.as_deref(), Some("std-pool"));
        // fallback pool still eligible
        assert_eq!(candidates[1].metadata.name.as_deref(), Some("high-pool"));
    }

    #[test]
    fn test_candidate_pools_namespace_scope() {
        let mut scoped = make_pool("other", "python:3.10", "standard", 1);
        scoped.metadata.namespace = Some("elsewhere".to_string());
        let pools = vec![scoped, make_pool("local", "python:3.10", "standard", 1)];
        let spec = sandbox_spec("python:3.10", "standard");
        let candidates = candidate_pools(pools, &spec, Some("pools"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].metadata.name.as_deref(), Some("local"));
    }

    #[test]
    fn test_ready_pods_oldest_first() {
        let pods = vec![
            make_warm_pod("young", WarmPodPhase::Ready, 2_000),
            make_warm_pod("assigned", WarmPodPhase::Assigned, 500),
            make_warm_pod("old", WarmPodPhase::Ready, 1_000),
            make_warm_pod("pending", WarmPodPhase::Pending, 100),
        ];
        let ready = ready_pods_oldest_first(pods);
        let names: Vec<_> = ready
            .iter()
            .map(|wp| wp.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["old", "young"]);
    }

    #[test]
    fn test_bound_pods_not_assignable() {
        let mut wp = make_warm_pod("wp", WarmPodPhase::Ready, 0);
        wp.status.as_mut().unwrap().assigned_to = "sb-9".to_string();
        assert!(ready_pods_oldest_first(vec![wp]).is_empty());
    }
}
