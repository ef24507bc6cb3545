//! WarmPod reconciler: drives a single pool member through its phases.
//!
//! ```text
//!   Pending ──pod Running + ready──▶ Ready
//!   Ready ──(allocator promotes)──▶ Assigned   [external transition]
//!   Ready ──TTL expired OR pool delete──▶ Terminating
//!   Assigned ──sandbox vanished OR mismatch──▶ Terminating
//!   Terminating ──pod deleted──▶ (WarmPod deleted)
//! ```
//!
//! The `Ready → Assigned` promotion belongs to the allocator; this
//! reconciler only guards its own transitions so a concurrent assignment
//! always wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{info, warn};

use super::{Context, ensure_finalizer, guard, object_key, remove_finalizer};
use crate::crd::{LABEL_SANDBOX_ID, WarmPod, WarmPodPhase, WarmPool};
use crate::errors::{Error, is_already_exists, is_not_found};
use crate::metrics;
use crate::patch::update_status;
use crate::podspec;
use crate::runtimes;

pub async fn reconcile(warm_pod: Arc<WarmPod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(warm_pod.as_ref());
    let deadline = ctx.config.controllers.reconcile_deadline();
    let inner = {
        let ctx = ctx.clone();
        let warm_pod = warm_pod.clone();
        async move {
            match tokio::time::timeout(deadline, reconcile_inner(&warm_pod, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(deadline)),
            }
        }
    };
    match guard(key.clone(), inner).await {
        Ok(action) => {
            ctx.note_success(&key);
            metrics::reconcile("warmpod", "ok");
            Ok(action)
        }
        Err(err) => Err(err),
    }
}

pub fn error_policy(warm_pod: Arc<WarmPod>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(warm_pod.as_ref());
    metrics::reconcile("warmpod", "error");
    let delay = ctx.next_backoff(&key);
    warn!(key, error = %err, "warm pod reconcile failed; backing off");
    Action::requeue(delay)
}

async fn reconcile_inner(warm_pod: &WarmPod, ctx: &Context) -> Result<Action, Error> {
    let namespace = warm_pod
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;
    let name = warm_pod.name_any();
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &namespace);

    if warm_pod.meta().deletion_timestamp.is_some() {
        return finalize_deletion(warm_pod, ctx, &api, &namespace).await;
    }

    ensure_finalizer(&api, warm_pod).await?;

    match warm_pod.phase() {
        WarmPodPhase::Pending => pending(warm_pod, ctx, &api, &namespace, &name).await,
        WarmPodPhase::Ready => ready(warm_pod, ctx, &api, &namespace, &name).await,
        WarmPodPhase::Assigned => assigned(warm_pod, ctx, &api, &namespace, &name).await,
        WarmPodPhase::Terminating => terminating(warm_pod, ctx, &api, &namespace, &name).await,
    }
}

/// Resolve the owning pool through the cache.
fn parent_pool(warm_pod: &WarmPod, ctx: &Context, namespace: &str) -> Option<WarmPool> {
    let pool_ref = &warm_pod.spec.pool_ref;
    let pool_namespace = if pool_ref.namespace.is_empty() {
        namespace
    } else {
        pool_ref.namespace.as_str()
    };
    ctx.cache.warm_pool(pool_namespace, &pool_ref.name)
}

/// Pending: make sure the backing pod exists, then wait for it to report
/// ready before advertising the pod as assignable.
async fn pending(
    warm_pod: &WarmPod,
    ctx: &Context,
    api: &Api<WarmPod>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let Some(pool) = parent_pool(warm_pod, ctx, namespace) else {
        return to_terminating(api, name, WarmPodPhase::Pending, "pool gone").await;
    };
    let Some(runtime) = runtimes::resolve(&pool.spec.runtime) else {
        return to_terminating(api, name, WarmPodPhase::Pending, "unknown runtime").await;
    };

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let status = warm_pod.status_cloned();

    if status.pod_name.is_empty() {
        let pod = podspec::build_warm_pod(
            &pool,
            warm_pod,
            runtime,
            ctx.config.cluster.runtime_class.as_deref(),
        );
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {}
            Err(err) => return Err(err.into()),
        }
        let pod_namespace = namespace.to_string();
        update_status(api, name, move |status| {
            status.pod_name = pod_name.clone();
            status.pod_namespace = pod_namespace.clone();
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    match pods.get_opt(&status.pod_name).await? {
        None => {
            // recorded pod never materialized or was removed; rebuild it
            let pod = podspec::build_warm_pod(
                &pool,
                warm_pod,
                runtime,
                ctx.config.cluster.runtime_class.as_deref(),
            );
            match pods.create(&PostParams::default(), &pod).await {
                Ok(_) => {}
                Err(err) if is_already_exists(&err) => {}
                Err(err) => return Err(err.into()),
            }
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Some(pod) => {
            let pod_phase = pod.status.as_ref().and_then(|s| s.phase.clone());
            if matches!(pod_phase.as_deref(), Some("Failed") | Some("Succeeded")) {
                return to_terminating(api, name, WarmPodPhase::Pending, "backing pod terminated during warmup")
                    .await;
            }
            if podspec::pod_is_ready(&pod) {
                update_status(api, name, |status| {
                    if status.phase == WarmPodPhase::Pending {
                        status.phase = WarmPodPhase::Ready;
                        status.last_heartbeat = Some(Time(Utc::now()));
                    }
                })
                .await?;
                info!(warm_pod = %name, "warm pod ready");
                Ok(Action::requeue(ctx.resync()))
            } else {
                Ok(Action::requeue(Duration::from_secs(5)))
            }
        }
    }
}

/// Ready: enforce the pool TTL, watch the backing pod, refresh the
/// heartbeat. Every transition is guarded so a concurrent assignment wins.
async fn ready(
    warm_pod: &WarmPod,
    ctx: &Context,
    api: &Api<WarmPod>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let Some(pool) = parent_pool(warm_pod, ctx, namespace) else {
        return to_terminating(api, name, WarmPodPhase::Ready, "pool gone").await;
    };

    if pool.spec.ttl_seconds > 0 {
        if let Some(created) = warm_pod.metadata.creation_timestamp.as_ref() {
            let age = Utc::now().signed_duration_since(created.0);
            if age > chrono::Duration::seconds(pool.spec.ttl_seconds as i64) {
                return to_terminating(api, name, WarmPodPhase::Ready, "ttl expired").await;
            }
        }
    }

    let status = warm_pod.status_cloned();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    match pods.get_opt(&status.pod_name).await? {
        None => to_terminating(api, name, WarmPodPhase::Ready, "backing pod gone").await,
        Some(pod) if !podspec::pod_is_ready(&pod) => {
            // pod still exists but regressed; go back to waiting on it
            update_status(api, name, |status| {
                if status.phase == WarmPodPhase::Ready {
                    status.phase = WarmPodPhase::Pending;
                }
            })
            .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Some(_) => {
            // best-effort heartbeat; a lost race here is harmless
            let result = update_status(api, name, |status| {
                if status.phase == WarmPodPhase::Ready {
                    status.last_heartbeat = Some(Time(Utc::now()));
                }
            })
            .await;
            if let Err(err) = result
                && !matches!(err, Error::Conflict(..))
            {
                return Err(err);
            }
            Ok(Action::requeue(ctx.resync()))
        }
    }
}

/// Assigned: the pod now belongs to a sandbox; verify both sides still
/// agree and tear down on any mismatch.
async fn assigned(
    warm_pod: &WarmPod,
    ctx: &Context,
    api: &Api<WarmPod>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let status = warm_pod.status_cloned();
    if status.assigned_to.is_empty() {
        return to_terminating(api, name, WarmPodPhase::Assigned, "assigned without a sandbox id")
            .await;
    }

    let Some(sandbox) = ctx.cache.sandbox_by_id(&status.assigned_to) else {
        return to_terminating(api, name, WarmPodPhase::Assigned, "assigned sandbox vanished").await;
    };
    if sandbox.phase() == crate::crd::SandboxPhase::Terminated {
        return to_terminating(api, name, WarmPodPhase::Assigned, "assigned sandbox terminated").await;
    }
    if let Some(ref warm_ref) = sandbox.status_cloned().warm_pod_ref {
        if warm_ref.name != name {
            return to_terminating(
                api,
                name,
                WarmPodPhase::Assigned,
                "sandbox references a different warm pod",
            )
            .await;
        }
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    match pods.get_opt(&status.pod_name).await? {
        None => to_terminating(api, name, WarmPodPhase::Assigned, "backing pod gone").await,
        Some(pod) => {
            // the sandbox-id label lands during adoption; tolerate its
            // absence but never a different owner
            let label = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_SANDBOX_ID));
            if label.is_some_and(|id| id != &status.assigned_to) {
                return to_terminating(
                    api,
                    name,
                    WarmPodPhase::Assigned,
                    "pod labeled for a different sandbox",
                )
                .await;
            }
            Ok(Action::requeue(ctx.resync()))
        }
    }
}

/// Terminating: delete the backing pod, then delete the WarmPod itself.
async fn terminating(
    warm_pod: &WarmPod,
    ctx: &Context,
    api: &Api<WarmPod>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let status = warm_pod.status_cloned();
    if !status.pod_name.is_empty() {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        match pods
            .delete(&status.pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(err) if is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(Action::requeue(Duration::from_secs(2)))
}

/// Deletion in progress: make sure the backing pod is gone before releasing
/// the finalizer.
async fn finalize_deletion(
    warm_pod: &WarmPod,
    ctx: &Context,
    api: &Api<WarmPod>,
    namespace: &str,
) -> Result<Action, Error> {
    let status = warm_pod.status_cloned();
    if !status.pod_name.is_empty() {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        match pods
            .delete(&status.pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
        if pods.get_opt(&status.pod_name).await?.is_some() {
            // pod deletion still settling
            return Ok(Action::requeue(Duration::from_secs(2)));
        }
    }
    remove_finalizer(api, &warm_pod.name_any()).await?;
    Ok(Action::requeue(ctx.resync()))
}

/// Flip into Terminating, but only from the phase the caller observed, so a
/// concurrent transition (e.g. the allocator's promotion) always wins.
async fn to_terminating(
    api: &Api<WarmPod>,
    name: &str,
    expected: WarmPodPhase,
    reason: &str,
) -> Result<Action, Error> {
    info!(warm_pod = %name, reason, "terminating warm pod");
    update_status(api, name, move |status| {
        if status.phase == expected {
            status.phase = WarmPodPhase::Terminating;
        }
    })
    .await?;
    Ok(Action::requeue(Duration::ZERO))
}
