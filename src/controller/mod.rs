//! Controller wiring shared by the sandbox, warm pool and warm pod
//! reconcilers.
//!
//! Each kind gets its own `kube_runtime` controller: deduplicated work
//! queue, at-most-one in-flight reconcile per key, and owned-resource
//! triggers. The shared error policy adds capped exponential backoff per
//! key, and a panic guard at the worker boundary converts panics into
//! ordinary reconcile errors.

pub mod sandbox;
pub mod warmpod;
pub mod warmpool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::WarmPodAllocator;
use crate::cache::ClusterCache;
use crate::config::Config;
use crate::crd::{Sandbox, WarmPod, WarmPool};
use crate::errors::Error;
use crate::recycler::Recycler;
use crate::sweeper::Sweeper;

/// Failed reconciles back off exponentially between these bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(16 * 60);

/// Shared state injected into every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub cache: Arc<ClusterCache>,
    pub config: Config,
    pub allocator: WarmPodAllocator,
    pub recycler: Recycler,
    /// Consecutive failures per reconcile key, for backoff
    failures: Mutex<HashMap<String, u32>>,
    /// Consecutive Unknown pod-phase observations per sandbox key
    unknown_pod_phases: Mutex<HashMap<String, u8>>,
}

impl Context {
    pub fn new(client: Client, cache: Arc<ClusterCache>, config: Config) -> Arc<Self> {
        let allocator = WarmPodAllocator::new(
            client.clone(),
            cache.clone(),
            config.allocator.pool_namespace.clone(),
        );
        let recycler = Recycler::new(client.clone(), cache.clone(), &config.recycler);
        Arc::new(Self {
            client,
            cache,
            config,
            allocator,
            recycler,
            failures: Mutex::new(HashMap::new()),
            unknown_pod_phases: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn note_success(&self, key: &str) {
        self.failures.lock().unwrap().remove(key);
    }

    pub(crate) fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_duration(*count)
    }

    /// Track consecutive Unknown pod-phase observations for one sandbox;
    /// returns the updated streak length.
    pub(crate) fn note_unknown_pod_phase(&self, key: &str) -> u8 {
        let mut map = self.unknown_pod_phases.lock().unwrap();
        let count = map.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub(crate) fn clear_unknown_pod_phase(&self, key: &str) {
        self.unknown_pod_phases.lock().unwrap().remove(key);
    }

    /// Steady-state requeue interval; doubles as the resync guard against
    /// missed watch events.
    pub(crate) fn resync(&self) -> Duration {
        self.config.controllers.resync_interval()
    }
}

pub(crate) fn backoff_duration(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(22);
    BACKOFF_INITIAL.saturating_mul(1u32 << exp).min(BACKOFF_MAX)
}

/// Catch panics at the worker boundary and convert them into reconcile
/// errors so they requeue instead of unwinding across the controller.
pub(crate) async fn guard<F>(key: String, fut: F) -> Result<Action, Error>
where
    F: Future<Output = Result<Action, Error>>,
{
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::ReconcilePanic(key)),
    }
}

/// Reconcile key "namespace/name" used for logging and backoff tracking.
pub(crate) fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Attach the cleanup finalizer if the object does not carry it yet.
pub(crate) async fn ensure_finalizer<K>(api: &Api<K>, obj: &K) -> Result<(), Error>
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    if obj.finalizers().iter().any(|f| f == crate::crd::FINALIZER) {
        return Ok(());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(crate::crd::FINALIZER.to_string());
    api.patch(
        &obj.name_any(),
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&serde_json::json!({
            "metadata": { "finalizers": finalizers }
        })),
    )
    .await?;
    Ok(())
}

/// Strip the cleanup finalizer, releasing the object for deletion.
pub(crate) async fn remove_finalizer<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    let Some(latest) = api.get_opt(name).await? else {
        return Ok(());
    };
    if !latest.finalizers().iter().any(|f| f == crate::crd::FINALIZER) {
        return Ok(());
    }
    let finalizers: Vec<String> = latest
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != crate::crd::FINALIZER)
        .cloned()
        .collect();
    api.patch(
        name,
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&serde_json::json!({
            "metadata": { "finalizers": finalizers }
        })),
    )
    .await?;
    Ok(())
}

/// Start the three controllers and the background sweeper; resolves once
/// shutdown fires and the workers have drained.
pub async fn run(client: Client, config: Config, shutdown: CancellationToken) -> Result<(), Error> {
    let cache = ClusterCache::spawn(&client);
    cache.wait_until_ready().await;
    info!("resource cache hydrated");

    let ctx = Context::new(client.clone(), cache.clone(), config.clone());
    let controller_config =
        ControllerConfig::default().concurrency(config.controllers.worker_count as u16);
    let wc = watcher::Config::default();

    let sandbox_loop = Controller::new(Api::<Sandbox>::all(client.clone()), wc.clone())
        .with_config(controller_config.clone())
        .owns(Api::<Pod>::all(client.clone()), wc.clone())
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(sandbox::reconcile, sandbox::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(controller = "sandbox", object = %obj, "reconciled"),
                Err(err) => warn!(controller = "sandbox", error = %err, "controller error"),
            }
        });

    let pool_loop = Controller::new(Api::<WarmPool>::all(client.clone()), wc.clone())
        .with_config(controller_config.clone())
        .owns(Api::<WarmPod>::all(client.clone()), wc.clone())
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(warmpool::reconcile, warmpool::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(controller = "warmpool", object = %obj, "reconciled"),
                Err(err) => warn!(controller = "warmpool", error = %err, "controller error"),
            }
        });

    let warm_pod_loop = Controller::new(Api::<WarmPod>::all(client.clone()), wc.clone())
        .with_config(controller_config)
        .owns(Api::<Pod>::all(client.clone()), wc)
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(warmpod::reconcile, warmpod::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(controller = "warmpod", object = %obj, "reconciled"),
                Err(err) => warn!(controller = "warmpod", error = %err, "controller error"),
            }
        });

    let sweeper = Sweeper::new(client, cache, &config.sweeper).spawn(shutdown.clone());

    tokio::join!(sandbox_loop, pool_loop, warm_pod_loop);
    let _ = sweeper.await;
    info!("controllers drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_duration(1), Duration::from_millis(5));
        assert_eq!(backoff_duration(2), Duration::from_millis(10));
        assert_eq!(backoff_duration(3), Duration::from_millis(20));
        assert_eq!(backoff_duration(11), Duration::from_millis(5 * 1024));
        // capped at 16 minutes no matter how long the losing streak
        assert_eq!(backoff_duration(30), Duration::from_secs(16 * 60));
        assert_eq!(backoff_duration(u32::MAX), Duration::from_secs(16 * 60));
    }

    #[tokio::test]
    async fn test_guard_converts_panics() {
        let result = guard("ns/x".to_string(), async { panic!("boom") }).await;
        assert!(matches!(result, Err(Error::ReconcilePanic(key)) if key == "ns/x"));

        let ok = guard("ns/x".to_string(), async {
            Ok(Action::requeue(Duration::from_secs(1)))
        })
        .await;
        assert!(ok.is_ok());
    }
}
