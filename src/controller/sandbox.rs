//! Sandbox reconciler: drives a Sandbox through its phase machine.
//!
//! ```text
//!   ""  ──initialize──▶ Pending
//!   Pending ──allocate warm OR create pod──▶ Creating
//!   Creating ──pod Ready + service ready──▶ Running
//!   Running ──delete request OR timeout──▶ Terminating
//!   Terminating ──cleanup complete──▶ Terminated (finalizer removed)
//!   any non-terminal ──unrecoverable error──▶ Failed
//! ```
//!
//! Idempotent: reconciling an unchanged sandbox twice produces no second
//! write, because every status mutation checks the freshest state first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Context, ensure_finalizer, guard, object_key, remove_finalizer};
use crate::crd::conditions::{
    CONDITION_POD_MISSING, CONDITION_READY, CONDITION_VALIDATION_FAILED, set_condition,
};
use crate::crd::{
    ConditionStatus, LABEL_POOL, LABEL_SANDBOX_ID, Sandbox, SandboxPhase, WarmPod, WarmPodPhase,
    WarmPodRef,
};
use crate::errors::{Error, is_already_exists, is_not_found};
use crate::metrics;
use crate::patch::update_status;
use crate::podspec;
use crate::runtimes;
use crate::validation;

pub async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(sandbox.as_ref());
    let deadline = ctx.config.controllers.reconcile_deadline();
    let inner = {
        let ctx = ctx.clone();
        let sandbox = sandbox.clone();
        async move {
            match tokio::time::timeout(deadline, reconcile_inner(&sandbox, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(deadline)),
            }
        }
    };
    match guard(key.clone(), inner).await {
        Ok(action) => {
            ctx.note_success(&key);
            metrics::reconcile("sandbox", "ok");
            Ok(action)
        }
        Err(err) => Err(err),
    }
}

pub fn error_policy(sandbox: Arc<Sandbox>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(sandbox.as_ref());
    metrics::reconcile("sandbox", "error");
    let delay = ctx.next_backoff(&key);
    warn!(key, error = %err, "sandbox reconcile failed; backing off");
    Action::requeue(delay)
}

async fn reconcile_inner(sandbox: &Sandbox, ctx: &Context) -> Result<Action, Error> {
    let namespace = sandbox
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;
    let name = sandbox.name_any();
    let phase = sandbox.phase();

    // termination wins over everything else
    if sandbox.meta().deletion_timestamp.is_some() || phase == SandboxPhase::Terminating {
        return terminate(sandbox, ctx, &namespace, &name).await;
    }

    match phase {
        SandboxPhase::Unset => initialize(sandbox, ctx, &namespace, &name).await,
        SandboxPhase::Pending => provision(sandbox, ctx, &namespace, &name).await,
        SandboxPhase::Creating => observe_readiness(sandbox, ctx, &namespace, &name).await,
        SandboxPhase::Running => observe_running(sandbox, ctx, &namespace, &name).await,
        SandboxPhase::Terminating => terminate(sandbox, ctx, &namespace, &name).await,
        // parked states: nothing to do until a delete request arrives
        SandboxPhase::Failed | SandboxPhase::Terminated => Ok(Action::requeue(ctx.resync())),
    }
}

/// First touch: attach the finalizer, validate the spec, enter Pending.
async fn initialize(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);

    // finalizer first so even a rejected sandbox blocks deletion on cleanup
    ensure_finalizer(&api, sandbox).await?;

    let validated =
        validation::validate_name(name).and_then(|_| validation::validate_sandbox(&sandbox.spec));
    if let Err(err) = validated {
        let message = err.to_string();
        warn!(sandbox = %name, %message, "spec rejected");
        update_status(&api, name, |status| {
            status.phase = SandboxPhase::Failed;
            set_condition(
                &mut status.conditions,
                CONDITION_VALIDATION_FAILED,
                ConditionStatus::True,
                "InvalidSpec",
                &message,
            );
        })
        .await?;
        return Ok(Action::requeue(ctx.resync()));
    }

    update_status(&api, name, |status| {
        if status.phase == SandboxPhase::Unset {
            status.phase = SandboxPhase::Pending;
        }
    })
    .await?;
    info!(sandbox = %name, "initialized");
    Ok(Action::requeue(Duration::ZERO))
}

/// Pending: adopt a warm pod when the spec asks for one and the allocator
/// has a hit; otherwise materialize everything from scratch.
async fn provision(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let status = sandbox.status_cloned();

    if sandbox.spec.use_warm_pool && status.warm_pod_ref.is_none() {
        if let Some(warm_pod) = ctx.allocator.allocate(sandbox).await? {
            return adopt_warm_pod(sandbox, ctx, namespace, name, warm_pod).await;
        }
        debug!(sandbox = %name, "allocator miss; creating from scratch");
    }

    create_from_scratch(sandbox, ctx, namespace, name).await
}

/// Cold start: pod, then network policy, then service. A partial creation
/// compensates by deleting what already landed; if compensation also fails
/// the finalizer keeps cleanup alive for the next reconcile.
async fn create_from_scratch(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let runtime = runtimes::resolve(&sandbox.spec.runtime)
        .ok_or_else(|| Error::Validation(format!("unknown runtime '{}'", sandbox.spec.runtime)))?;

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let policies: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), namespace);

    let pod = podspec::build_sandbox_pod(
        sandbox,
        runtime,
        ctx.config.cluster.runtime_class.as_deref(),
    );
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    match pods.create(&PostParams::default(), &pod).await {
        Ok(_) => {}
        Err(err) if is_already_exists(&err) => {}
        Err(err) => return Err(err.into()),
    }

    let policy = podspec::build_network_policy(sandbox);
    let policy_name = policy.metadata.name.clone().unwrap_or_default();
    if let Err(err) = policies.create(&PostParams::default(), &policy).await
        && !is_already_exists(&err)
    {
        warn!(sandbox = %name, error = %err, "network policy creation failed; deleting pod");
        let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
        return Err(err.into());
    }

    let service = podspec::build_service(sandbox);
    if let Err(err) = services.create(&PostParams::default(), &service).await
        && !is_already_exists(&err)
    {
        warn!(sandbox = %name, error = %err, "service creation failed; compensating");
        let _ = policies.delete(&policy_name, &DeleteParams::default()).await;
        let _ = pods.delete(&pod_name, &DeleteParams::default()).await;
        return Err(err.into());
    }

    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);
    let pod_namespace = namespace.to_string();
    update_status(&api, name, move |status| {
        status.phase = SandboxPhase::Creating;
        status.pod_name = pod_name.clone();
        status.pod_namespace = pod_namespace.clone();
    })
    .await?;
    info!(sandbox = %name, "created sandbox pod from scratch");
    Ok(Action::requeue(Duration::from_secs(2)))
}

/// Take over an allocator-claimed warm pod: transfer pod ownership, expose
/// the service, and record the adoption.
async fn adopt_warm_pod(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
    warm_pod: WarmPod,
) -> Result<Action, Error> {
    let wp_status = warm_pod.status_cloned();
    let pod_namespace = if wp_status.pod_namespace.is_empty() {
        warm_pod.namespace().unwrap_or_default()
    } else {
        wp_status.pod_namespace.clone()
    };
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);

    match transfer_pod_ownership(&ctx.client, sandbox, &pod_namespace, &wp_status.pod_name).await {
        Ok(pod) => {
            let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
            let service = podspec::build_service(sandbox);
            match services.create(&PostParams::default(), &service).await {
                Ok(_) => {}
                Err(err) if is_already_exists(&err) => {}
                Err(err) => return Err(err.into()),
            }

            let ready = podspec::pod_is_ready(&pod);
            let warm_ref = WarmPodRef {
                name: warm_pod.name_any(),
                namespace: warm_pod.namespace().unwrap_or_default(),
            };
            let endpoint = podspec::endpoint_for(name, namespace);
            let pod_name = wp_status.pod_name.clone();
            let pod_ns = pod_namespace.clone();
            update_status(&api, name, move |status| {
                status.warm_pod_ref = Some(warm_ref.clone());
                status.pod_name = pod_name.clone();
                status.pod_namespace = pod_ns.clone();
                if ready {
                    status.phase = SandboxPhase::Running;
                    if status.start_time.is_none() {
                        status.start_time = Some(Time(Utc::now()));
                    }
                    status.endpoint = endpoint.clone();
                    set_condition(
                        &mut status.conditions,
                        CONDITION_READY,
                        ConditionStatus::True,
                        "WarmPodAdopted",
                        "adopted a pre-initialized pod",
                    );
                } else {
                    status.phase = SandboxPhase::Creating;
                }
            })
            .await?;
            info!(
                sandbox = %name,
                warm_pod = %warm_pod.name_any(),
                ready,
                "adopted warm pod"
            );
            Ok(Action::requeue(if ready {
                ctx.resync()
            } else {
                Duration::from_secs(2)
            }))
        }
        Err(err) => {
            warn!(
                sandbox = %name,
                warm_pod = %warm_pod.name_any(),
                error = %err,
                "warm pod adoption failed; releasing the claim"
            );
            // the warm pod reconciler tears down the half-transferred pod
            if let Some(wp_namespace) = warm_pod.namespace() {
                let wp_api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &wp_namespace);
                let _ = update_status(&wp_api, &warm_pod.name_any(), |status| {
                    status.phase = WarmPodPhase::Terminating;
                })
                .await;
            }
            update_status(&api, name, |status| {
                status.warm_pod_ref = None;
                status.phase = SandboxPhase::Pending;
            })
            .await?;
            Err(err)
        }
    }
}

/// Move the backing pod from its WarmPod to the sandbox: drop the old owner
/// reference first, then add the sandbox's controller reference and swap the
/// pool label for the sandbox id. Two steps; the warm pod reconciler
/// tolerates the transient ownerless state.
async fn transfer_pod_ownership(
    client: &Client,
    sandbox: &Sandbox,
    pod_namespace: &str,
    pod_name: &str,
) -> Result<Pod, Error> {
    if pod_name.is_empty() {
        return Err(Error::MissingField("status.podName"));
    }
    let pods: Api<Pod> = Api::namespaced(client.clone(), pod_namespace);
    let pp = PatchParams::default();

    pods.patch(
        pod_name,
        &pp,
        &Patch::Merge(&json!({
            "metadata": { "ownerReferences": [] }
        })),
    )
    .await?;

    let owner = sandbox
        .controller_owner_ref(&())
        .ok_or(Error::MissingField("metadata.name"))?;
    let updated = pods
        .patch(
            pod_name,
            &pp,
            &Patch::Merge(&json!({
                "metadata": {
                    "ownerReferences": [owner],
                    "labels": {
                        LABEL_SANDBOX_ID: sandbox.name_any(),
                        LABEL_POOL: null,
                    },
                }
            })),
        )
        .await?;
    Ok(updated)
}

/// How a backing pod's phase reads from the sandbox's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappedPhase {
    /// Pod still coming up
    Starting,
    /// Running with all containers ready
    Ready,
    /// Running but not yet ready
    RunningNotReady,
    /// Pod finished on its own
    Succeeded,
    /// Pod failed
    Failed,
    /// Node lost or status unreported
    Unknown,
}

pub(crate) fn map_pod_phase(pod: &Pod) -> MappedPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") | None => MappedPhase::Starting,
        Some("Running") => {
            if podspec::pod_is_ready(pod) {
                MappedPhase::Ready
            } else {
                MappedPhase::RunningNotReady
            }
        }
        Some("Succeeded") => MappedPhase::Succeeded,
        Some("Failed") => MappedPhase::Failed,
        Some(_) => MappedPhase::Unknown,
    }
}

/// Creating: watch the backing pod until it is Running and ready, then
/// advance to Running with the service endpoint recorded.
async fn observe_readiness(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let key = object_key(sandbox);
    let status = sandbox.status_cloned();
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);

    if status.pod_name.is_empty() {
        update_status(&api, name, |s| {
            if s.phase == SandboxPhase::Creating {
                s.phase = SandboxPhase::Pending;
            }
        })
        .await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let pod_namespace = if status.pod_namespace.is_empty() {
        namespace.to_string()
    } else {
        status.pod_namespace.clone()
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_namespace);

    let Some(pod) = pods.get_opt(&status.pod_name).await? else {
        // vanished mid-creation: re-provision rather than fail, nothing ran yet
        update_status(&api, name, |s| {
            if s.phase == SandboxPhase::Creating {
                s.phase = SandboxPhase::Pending;
                s.pod_name.clear();
                s.pod_namespace.clear();
            }
        })
        .await?;
        return Ok(Action::requeue(Duration::ZERO));
    };

    match map_pod_phase(&pod) {
        MappedPhase::Starting | MappedPhase::RunningNotReady => {
            ctx.clear_unknown_pod_phase(&key);
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        MappedPhase::Ready => {
            ctx.clear_unknown_pod_phase(&key);
            // the service fronts the endpoint; heal it if it is missing
            let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
            if services.get_opt(&podspec::service_name(name)).await?.is_none() {
                let service = podspec::build_service(sandbox);
                match services.create(&PostParams::default(), &service).await {
                    Ok(_) => {}
                    Err(err) if is_already_exists(&err) => {}
                    Err(err) => return Err(err.into()),
                }
                return Ok(Action::requeue(Duration::from_secs(2)));
            }

            let endpoint = podspec::endpoint_for(name, namespace);
            update_status(&api, name, move |s| {
                if s.phase == SandboxPhase::Creating {
                    s.phase = SandboxPhase::Running;
                    if s.start_time.is_none() {
                        s.start_time = Some(Time(Utc::now()));
                    }
                    s.endpoint = endpoint.clone();
                    set_condition(
                        &mut s.conditions,
                        CONDITION_READY,
                        ConditionStatus::True,
                        "PodReady",
                        "backing pod and service are ready",
                    );
                }
            })
            .await?;
            info!(sandbox = %name, "running");
            Ok(Action::requeue(ctx.resync()))
        }
        MappedPhase::Succeeded => {
            // the pod exited cleanly before the sandbox ever served; finish
            // through the termination path so cleanup still runs
            update_status(&api, name, |s| {
                if !matches!(
                    s.phase,
                    SandboxPhase::Terminating | SandboxPhase::Terminated
                ) {
                    s.phase = SandboxPhase::Terminating;
                }
            })
            .await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        MappedPhase::Failed => {
            update_status(&api, name, |s| {
                s.phase = SandboxPhase::Failed;
                set_condition(
                    &mut s.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    "PodFailed",
                    "backing pod failed during creation",
                );
            })
            .await?;
            Ok(Action::requeue(ctx.resync()))
        }
        MappedPhase::Unknown => {
            let streak = ctx.note_unknown_pod_phase(&key);
            if streak >= 2 {
                ctx.clear_unknown_pod_phase(&key);
                update_status(&api, name, |s| {
                    s.phase = SandboxPhase::Failed;
                    set_condition(
                        &mut s.conditions,
                        CONDITION_READY,
                        ConditionStatus::False,
                        "PodUnknown",
                        "backing pod phase unknown on consecutive observations",
                    );
                })
                .await?;
                Ok(Action::requeue(ctx.resync()))
            } else {
                Ok(Action::requeue(Duration::from_secs(5)))
            }
        }
    }
}

/// Running: fail fast when the backing pod disappears or dies. The user
/// contract is no silent recreation.
async fn observe_running(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let status = sandbox.status_cloned();
    let pod_namespace = if status.pod_namespace.is_empty() {
        namespace.to_string()
    } else {
        status.pod_namespace.clone()
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_namespace);
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);

    let Some(pod) = pods.get_opt(&status.pod_name).await? else {
        update_status(&api, name, |s| {
            if s.phase == SandboxPhase::Running {
                s.phase = SandboxPhase::Failed;
                set_condition(
                    &mut s.conditions,
                    CONDITION_POD_MISSING,
                    ConditionStatus::True,
                    "PodMissing",
                    "backing pod no longer exists",
                );
            }
        })
        .await?;
        warn!(sandbox = %name, "backing pod vanished while running");
        return Ok(Action::requeue(ctx.resync()));
    };

    match map_pod_phase(&pod) {
        MappedPhase::Succeeded => {
            update_status(&api, name, |s| {
                if s.phase == SandboxPhase::Running {
                    s.phase = SandboxPhase::Terminating;
                }
            })
            .await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        MappedPhase::Failed => {
            update_status(&api, name, |s| {
                if s.phase == SandboxPhase::Running {
                    s.phase = SandboxPhase::Failed;
                    set_condition(
                        &mut s.conditions,
                        CONDITION_READY,
                        ConditionStatus::False,
                        "PodFailed",
                        "backing pod failed",
                    );
                }
            })
            .await?;
            Ok(Action::requeue(ctx.resync()))
        }
        _ => Ok(Action::requeue(ctx.resync())),
    }
}

/// Terminating: cascade cleanup, then mark Terminated and release the
/// finalizer. Warm pods go through the recycler; cold pods are deleted
/// along with the service and network policy.
async fn terminate(
    sandbox: &Sandbox,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);
    let status = sandbox.status_cloned();

    if status.phase == SandboxPhase::Terminated {
        remove_finalizer(&api, name).await?;
        return Ok(Action::requeue(ctx.resync()));
    }

    if status.phase != SandboxPhase::Terminating {
        update_status(&api, name, |s| {
            if !matches!(
                s.phase,
                SandboxPhase::Terminating | SandboxPhase::Terminated
            ) {
                s.phase = SandboxPhase::Terminating;
            }
        })
        .await?;
        info!(sandbox = %name, "terminating");
    }

    if let Some(ref warm_ref) = status.warm_pod_ref {
        let wp_namespace = if warm_ref.namespace.is_empty() {
            namespace.to_string()
        } else {
            warm_ref.namespace.clone()
        };
        if let Some(warm_pod) = ctx.cache.warm_pod(&wp_namespace, &warm_ref.name) {
            ctx.recycler.process(sandbox, &warm_pod).await?;
        }
    } else if !status.pod_name.is_empty() {
        let pod_namespace = if status.pod_namespace.is_empty() {
            namespace.to_string()
        } else {
            status.pod_namespace.clone()
        };
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_namespace);
        match pods
            .delete(&status.pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    match services
        .delete(&podspec::service_name(name), &DeleteParams::default())
        .await
    {
        Ok(_) => {}
        Err(err) if is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }

    let policies: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), namespace);
    let policy_name = podspec::network_policy_name(&podspec::sandbox_pod_name(name));
    match policies.delete(&policy_name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(err) if is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }

    match update_status(&api, name, |s| {
        s.phase = SandboxPhase::Terminated;
    })
    .await
    {
        Ok(_) => {}
        // the object may already be going away under us
        Err(Error::Kube { source }) if is_not_found(&source) => {}
        Err(err) => return Err(err),
    }
    remove_finalizer(&api, name).await?;
    info!(sandbox = %name, "terminated");
    Ok(Action::requeue(ctx.resync()))
}
