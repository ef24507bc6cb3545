//! WarmPool reconciler: keeps each pool's ready-pod count within
//! `[minSize, maxSize]` and applies the auto-scaling policy.
//!
//! The read phase is pure (`count_children` + `plan`) so the sizing rules
//! are testable without a cluster; the write phase creates or marks pods
//! and refreshes the pool status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Context, guard, object_key};
use crate::crd::conditions::{CONDITION_READY, set_condition};
use crate::crd::{
    ConditionStatus, LABEL_MANAGED_BY, LABEL_POOL, MANAGER_NAME, PoolRef, WarmPod, WarmPodPhase,
    WarmPodSpec, WarmPool, WarmPoolSpec,
};
use crate::errors::{Error, is_already_exists};
use crate::metrics;
use crate::patch::update_status;
use crate::validation;

pub async fn reconcile(pool: Arc<WarmPool>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(pool.as_ref());
    let deadline = ctx.config.controllers.reconcile_deadline();
    let inner = {
        let ctx = ctx.clone();
        let pool = pool.clone();
        async move {
            match tokio::time::timeout(deadline, reconcile_inner(&pool, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(deadline)),
            }
        }
    };
    match guard(key.clone(), inner).await {
        Ok(action) => {
            ctx.note_success(&key);
            metrics::reconcile("warmpool", "ok");
            Ok(action)
        }
        Err(err) => Err(err),
    }
}

pub fn error_policy(pool: Arc<WarmPool>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(pool.as_ref());
    metrics::reconcile("warmpool", "error");
    let delay = ctx.next_backoff(&key);
    warn!(key, error = %err, "warm pool reconcile failed; backing off");
    Action::requeue(delay)
}

async fn reconcile_inner(pool: &WarmPool, ctx: &Context) -> Result<Action, Error> {
    let namespace = pool
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;
    let name = pool.name_any();

    // children carry owner references; deletion cascades without our help
    if pool.meta().deletion_timestamp.is_some() {
        return Ok(Action::requeue(ctx.resync()));
    }

    let pool_api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Err(err) = validation::validate_pool(&pool.spec) {
        let message = err.to_string();
        warn!(pool = %name, %message, "pool spec rejected");
        update_status(&pool_api, &name, |status| {
            set_condition(
                &mut status.conditions,
                CONDITION_READY,
                ConditionStatus::False,
                "InvalidSpec",
                &message,
            );
        })
        .await?;
        return Ok(Action::requeue(ctx.resync()));
    }

    let children = ctx.cache.warm_pods_for_pool(&namespace, &name);
    let counts = count_children(&children);
    let last_scale = pool
        .status
        .as_ref()
        .and_then(|s| s.last_scale_time.as_ref())
        .map(|t| t.0);
    let plan = plan(&pool.spec, counts, last_scale, Utc::now());

    let wp_api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut scaled = false;

    // creation errors don't abort the loop; the next cycle retries the rest
    let mut created = 0u32;
    for _ in 0..plan.create {
        let warm_pod = new_warm_pod(pool, &namespace, &name);
        match wp_api.create(&PostParams::default(), &warm_pod).await {
            Ok(_) => created += 1,
            Err(err) if is_already_exists(&err) => {}
            Err(err) => warn!(pool = %name, error = %err, "warm pod creation failed"),
        }
    }
    if created > 0 {
        scaled = true;
        info!(pool = %name, created, "scaled pool up");
    }

    if plan.scale_down {
        if let Some(oldest) = oldest_ready(&children) {
            let oldest_name = oldest.name_any();
            // the flip loses to a concurrent assignment, which is fine
            update_status(&wp_api, &oldest_name, |status| {
                if status.phase == WarmPodPhase::Ready {
                    status.phase = WarmPodPhase::Terminating;
                }
            })
            .await?;
            scaled = true;
            info!(pool = %name, warm_pod = %oldest_name, "scaled pool down");
        }
    }

    let min_size = pool.spec.min_size;
    update_status(&pool_api, &name, move |status| {
        status.available_pods = counts.available;
        status.assigned_pods = counts.assigned;
        status.pending_pods = counts.pending + created;
        if scaled {
            status.last_scale_time = Some(Time(Utc::now()));
        }
        let ready = counts.available >= min_size;
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            if ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            if ready { "MinimumAvailable" } else { "BelowMinimum" },
            "",
        );
    })
    .await?;

    Ok(Action::requeue(ctx.resync()))
}

fn new_warm_pod(pool: &WarmPool, namespace: &str, pool_name: &str) -> WarmPod {
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{}-wp-{}", pool_name, &suffix[..8]);

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_POOL.to_string(), pool_name.to_string());

    WarmPod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![
                pool.controller_owner_ref(&()).expect("pool has a name"),
            ]),
            ..Default::default()
        },
        spec: WarmPodSpec {
            pool_ref: PoolRef {
                name: pool_name.to_string(),
                namespace: namespace.to_string(),
            },
        },
        status: None,
    }
}

/// Phase totals over non-terminating children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolCounts {
    pub available: u32,
    pub assigned: u32,
    pub pending: u32,
}

pub(crate) fn count_children(children: &[WarmPod]) -> PoolCounts {
    let mut counts = PoolCounts::default();
    for wp in children {
        if wp.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match wp.phase() {
            WarmPodPhase::Ready => counts.available += 1,
            WarmPodPhase::Assigned => counts.assigned += 1,
            WarmPodPhase::Pending => counts.pending += 1,
            WarmPodPhase::Terminating => {}
        }
    }
    counts
}

/// What one reconcile cycle should do to the pool's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolPlan {
    pub create: u32,
    pub scale_down: bool,
}

pub(crate) fn plan(
    spec: &WarmPoolSpec,
    counts: PoolCounts,
    last_scale: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PoolPlan {
    let total = counts.available + counts.assigned + counts.pending;

    // deficit creation; pending pods count as scale-up already in progress
    let mut create = spec.min_size.saturating_sub(counts.available + counts.pending);
    // rate-limit bursts to one minSize batch per cycle
    create = create.min(spec.min_size.max(1));
    if spec.max_size > 0 {
        create = create.min(spec.max_size.saturating_sub(total));
    }

    let mut scale_down = false;
    if let Some(auto) = spec.auto_scaling.as_ref().filter(|a| a.enabled) {
        if spec.max_size > 0 {
            let in_service = counts.available + counts.assigned;
            let utilization = counts.assigned * 100 / in_service.max(1);
            if utilization > auto.target_utilization_percent
                && in_service < spec.max_size
                && spec.max_size.saturating_sub(total + create) > 0
            {
                // conservative scale-up: one pod at a time
                create += 1;
            } else if utilization < auto.target_utilization_percent / 2
                && counts.available > spec.min_size
                && last_scale.is_none_or(|t| {
                    now.signed_duration_since(t)
                        >= chrono::Duration::seconds(auto.scale_down_delay_seconds as i64)
                })
            {
                scale_down = true;
            }
        }
    }

    PoolPlan { create, scale_down }
}

/// Oldest Ready child, the scale-down victim.
fn oldest_ready(children: &[WarmPod]) -> Option<&WarmPod> {
    children
        .iter()
        .filter(|wp| wp.phase() == WarmPodPhase::Ready)
        .filter(|wp| wp.metadata.deletion_timestamp.is_none())
        .min_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_spec(json: serde_json::Value) -> WarmPoolSpec {
        serde_json::from_value(json).unwrap()
    }

    fn counts(available: u32, assigned: u32, pending: u32) -> PoolCounts {
        PoolCounts {
            available,
            assigned,
            pending,
        }
    }

    #[test]
    fn test_deficit_creation() {
        let spec = pool_spec(serde_json::json!({ "runtime": "python:3.10", "minSize": 3 }));
        let now = Utc::now();
        assert_eq!(
            plan(&spec, counts(1, 0, 0), None, now),
            PoolPlan {
                create: 2,
                scale_down: false
            }
        );
        // pending pods count toward the deficit
        assert_eq!(plan(&spec, counts(1, 0, 2), None, now).create, 0);
        // satisfied pool creates nothing
        assert_eq!(plan(&spec, counts(3, 5, 0), None, now).create, 0);
    }

    #[test]
    fn test_creation_respects_max_size() {
        let spec = pool_spec(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 5,
            "maxSize": 6,
        }));
        let now = Utc::now();
        // 4 already exist in some phase; only 2 slots left
        assert_eq!(plan(&spec, counts(1, 3, 0), None, now).create, 2);
    }

    #[test]
    fn test_min_size_zero_stays_idle() {
        let spec = pool_spec(serde_json::json!({ "runtime": "python:3.10", "minSize": 0 }));
        assert_eq!(
            plan(&spec, counts(0, 0, 0), None, Utc::now()),
            PoolPlan::default()
        );
    }

    #[test]
    fn test_scale_up_on_high_utilization() {
        let spec = pool_spec(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 1,
            "maxSize": 10,
            "autoScaling": { "enabled": true, "targetUtilizationPercent": 80 },
        }));
        let now = Utc::now();
        // 7 of 8 in service assigned: 87% > 80%
        assert_eq!(plan(&spec, counts(1, 7, 0), None, now).create, 1);
        // at max: no scale-up
        assert_eq!(plan(&spec, counts(1, 9, 0), None, now).create, 0);
    }

    #[test]
    fn test_scale_down_waits_for_delay() {
        let spec = pool_spec(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 1,
            "maxSize": 10,
            "autoScaling": {
                "enabled": true,
                "targetUtilizationPercent": 80,
                "scaleDownDelaySeconds": 300,
            },
        }));
        let now = Utc::now();
        // idle pool over minSize, no scale in the last delay window
        assert!(plan(&spec, counts(4, 0, 0), None, now).scale_down);
        let recent = now - chrono::Duration::seconds(60);
        assert!(!plan(&spec, counts(4, 0, 0), Some(recent), now).scale_down);
        let stale = now - chrono::Duration::seconds(600);
        assert!(plan(&spec, counts(4, 0, 0), Some(stale), now).scale_down);
        // at minSize: never below
        assert!(!plan(&spec, counts(1, 0, 0), Some(stale), now).scale_down);
    }

    #[test]
    fn test_autoscaling_requires_enabled_and_bounded() {
        let now = Utc::now();
        // maxSize 0 means unbounded but autoscaling needs a bound
        let unbounded = pool_spec(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 1,
            "maxSize": 0,
            "autoScaling": { "enabled": true, "targetUtilizationPercent": 50 },
        }));
        let result = plan(&unbounded, counts(1, 9, 0), None, now);
        assert_eq!(result.create, 0);
        assert!(!result.scale_down);

        let disabled = pool_spec(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 1,
            "maxSize": 10,
            "autoScaling": { "enabled": false, "targetUtilizationPercent": 50 },
        }));
        assert_eq!(plan(&disabled, counts(1, 9, 0), None, now).create, 0);
    }

    #[test]
    fn test_count_children_skips_terminating() {
        let make = |phase: WarmPodPhase| {
            let spec: WarmPodSpec = serde_json::from_value(serde_json::json!({
                "poolRef": { "name": "p" },
            }))
            .unwrap();
            let mut wp = WarmPod::new("wp", spec);
            wp.status = Some(crate::crd::WarmPodStatus {
                phase,
                ..Default::default()
            });
            wp
        };
        let children = vec![
            make(WarmPodPhase::Ready),
            make(WarmPodPhase::Ready),
            make(WarmPodPhase::Assigned),
            make(WarmPodPhase::Pending),
            make(WarmPodPhase::Terminating),
        ];
        assert_eq!(count_children(&children), counts(2, 1, 1));
    }
}
