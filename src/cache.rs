//! In-memory projection of cluster state.
//!
//! One reflector-backed store per watched kind, hydrated from authoritative
//! watch streams. Controllers, the allocator, and the sweeper read through
//! these stores; every getter hands back an owned clone so no caller can
//! alias the cached object.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::crd::{Sandbox, WarmPod, WarmPool};

/// Read-side handle over all watched kinds.
pub struct ClusterCache {
    sandboxes: Store<Sandbox>,
    warm_pools: Store<WarmPool>,
    warm_pods: Store<WarmPod>,
    pods: Store<Pod>,
}

impl ClusterCache {
    /// Start watch-backed reflectors for every kind. The driver tasks run for
    /// the life of the process; watch errors log and the stream resumes with
    /// the watcher's default backoff.
    pub fn spawn(client: &Client) -> Arc<Self> {
        Arc::new(Self {
            sandboxes: spawn_reflector(Api::all(client.clone()), "sandboxes"),
            warm_pools: spawn_reflector(Api::all(client.clone()), "warmpools"),
            warm_pods: spawn_reflector(Api::all(client.clone()), "warmpods"),
            pods: spawn_reflector(Api::all(client.clone()), "pods"),
        })
    }

    /// Block until every store has seen its initial list.
    pub async fn wait_until_ready(&self) {
        self.sandboxes.wait_until_ready().await.ok();
        self.warm_pools.wait_until_ready().await.ok();
        self.warm_pods.wait_until_ready().await.ok();
        self.pods.wait_until_ready().await.ok();
    }

    pub fn sandbox(&self, namespace: &str, name: &str) -> Option<Sandbox> {
        self.sandboxes
            .get(&ObjectRef::new(name).within(namespace))
            .map(|o| (*o).clone())
    }

    /// Look a sandbox up by id alone. Sandbox ids are stable cluster-wide
    /// names, so the first match is the match.
    pub fn sandbox_by_id(&self, id: &str) -> Option<Sandbox> {
        self.sandboxes
            .state()
            .into_iter()
            .find(|s| s.metadata.name.as_deref() == Some(id))
            .map(|o| (*o).clone())
    }

    pub fn sandboxes(&self) -> Vec<Sandbox> {
        self.sandboxes
            .state()
            .into_iter()
            .map(|o| (*o).clone())
            .collect()
    }

    pub fn warm_pool(&self, namespace: &str, name: &str) -> Option<WarmPool> {
        self.warm_pools
            .get(&ObjectRef::new(name).within(namespace))
            .map(|o| (*o).clone())
    }

    pub fn warm_pools(&self) -> Vec<WarmPool> {
        self.warm_pools
            .state()
            .into_iter()
            .map(|o| (*o).clone())
            .collect()
    }

    pub fn warm_pod(&self, namespace: &str, name: &str) -> Option<WarmPod> {
        self.warm_pods
            .get(&ObjectRef::new(name).within(namespace))
            .map(|o| (*o).clone())
    }

    /// Children of one pool, matched through their pool reference.
    pub fn warm_pods_for_pool(&self, pool_namespace: &str, pool_name: &str) -> Vec<WarmPod> {
        self.warm_pods
            .state()
            .into_iter()
            .filter(|wp| {
                wp.spec.pool_ref.name == pool_name
                    && wp.metadata.namespace.as_deref() == Some(pool_namespace)
            })
            .map(|o| (*o).clone())
            .collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .get(&ObjectRef::new(name).within(namespace))
            .map(|o| (*o).clone())
    }

    pub fn pod_exists(&self, namespace: &str, name: &str) -> bool {
        self.pods
            .get(&ObjectRef::new(name).within(namespace))
            .is_some()
    }
}

fn spawn_reflector<K>(api: Api<K>, kind: &'static str) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let (store, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    tokio::spawn(async move {
        let mut objects = std::pin::pin!(stream.touched_objects());
        while let Some(item) = objects.next().await {
            if let Err(err) = item {
                warn!(kind, error = %err, "watch stream error");
            }
        }
    });
    store
}
