//! Control-plane façade consumed by the HTTP API layer.
//!
//! Thin, validated verbs over the declarative resources. Nothing here
//! drives state itself; the reconcilers own all transitions. The metadata
//! store only supplies pagination rows and counts, enriched with cluster
//! status per row.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config as KubeConfig, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cache::ClusterCache;
use crate::config::ClusterConfig;
use crate::crd::{
    FilesystemSpec, NetworkAccess, ProfileRef, ResourceRequests, Sandbox, SandboxPhase,
    SandboxSpec, SandboxStatus, SecurityLevel, WarmPool, WarmPoolSpec, WarmPoolStatus,
};
use crate::errors::{Error, is_not_found};
use crate::metadata::MetadataStore;
use crate::validation;

/// Build the Kubernetes client: in-cluster config first, kubeconfig second.
pub async fn connect(cluster: &ClusterConfig) -> anyhow::Result<Client> {
    if let Ok(config) = KubeConfig::incluster() {
        return Client::try_from(config).context("Failed to create in-cluster client");
    }

    let kubeconfig = if let Some(ref path) = cluster.kubeconfig {
        let expanded = tilde_expand(path);
        Kubeconfig::read_from(expanded).context("Failed to read kubeconfig")?
    } else {
        Kubeconfig::read().context("Failed to read default kubeconfig")?
    };

    let mut options = KubeConfigOptions::default();
    if let Some(ref context) = cluster.context {
        options.context = Some(context.clone());
    }

    let config = KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .context("Failed to build client config from kubeconfig")?;
    Client::try_from(config).context("Failed to create client")
}

fn tilde_expand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, rest);
        }
    }
    path.to_string()
}

/// Client request to create a sandbox. Everything except the runtime is
/// optional and defaulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    /// Stable name; generated when omitted
    #[serde(default)]
    pub name: Option<String>,
    pub runtime: String,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub resources: Option<ResourceRequests>,
    #[serde(default)]
    pub network_access: Option<NetworkAccess>,
    #[serde(default)]
    pub filesystem: Option<FilesystemSpec>,
    #[serde(default)]
    pub use_warm_pool: bool,
    #[serde(default)]
    pub profile_ref: Option<ProfileRef>,
    #[serde(default)]
    pub owner_user_id: String,
}

impl CreateSandboxRequest {
    fn into_spec(self) -> SandboxSpec {
        SandboxSpec {
            runtime: self.runtime,
            security_level: self.security_level,
            timeout_seconds: self.timeout_seconds,
            resources: self.resources.unwrap_or_default(),
            network_access: self.network_access.unwrap_or_default(),
            filesystem: self.filesystem.unwrap_or_default(),
            use_warm_pool: self.use_warm_pool,
            profile_ref: self.profile_ref,
            owner_user_id: self.owner_user_id,
        }
    }
}

/// One row of a sandbox listing: metadata-store row enriched with observed
/// cluster state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub id: String,
    pub runtime: String,
    pub phase: SandboxPhase,
    pub endpoint: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct ControlPlane {
    client: Client,
    cache: Arc<ClusterCache>,
    metadata: Arc<dyn MetadataStore>,
    namespace: String,
}

impl ControlPlane {
    pub fn new(
        client: Client,
        cache: Arc<ClusterCache>,
        metadata: Arc<dyn MetadataStore>,
        namespace: String,
    ) -> Self {
        Self {
            client,
            cache,
            metadata,
            namespace,
        }
    }

    fn sandboxes(&self) -> Api<Sandbox> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn warm_pools(&self) -> Api<WarmPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Persist a new Sandbox and wait for the reconciler to acknowledge it
    /// (phase at least Pending). Validation failures surface immediately.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox, Error> {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("sb-{}", &Uuid::new_v4().simple().to_string()[..8]));
        validation::validate_name(&name)?;

        let spec = request.into_spec();
        validation::validate_sandbox(&spec)?;

        let owner = spec.owner_user_id.clone();
        let runtime = spec.runtime.clone();
        let sandbox = Sandbox::new(&name, spec);
        let api = self.sandboxes();
        api.create(&PostParams::default(), &sandbox).await?;

        // lookup metadata is best-effort; the cluster stays authoritative
        if let Err(err) = self
            .metadata
            .create_sandbox_metadata(&name, &owner, &runtime)
            .await
        {
            warn!(sandbox = %name, error = %err, "metadata row creation failed");
        }

        // wait for the reconciler's first touch
        for _ in 0..20 {
            if let Some(latest) = api.get_opt(&name).await? {
                if latest.phase() != SandboxPhase::Unset {
                    return Ok(latest);
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        api.get_opt(&name)
            .await?
            .ok_or_else(|| Error::SandboxNotFound(name))
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox, Error> {
        self.sandboxes()
            .get_opt(id)
            .await?
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))
    }

    pub async fn get_sandbox_status(&self, id: &str) -> Result<SandboxStatus, Error> {
        Ok(self.get_sandbox(id).await?.status_cloned())
    }

    /// Rows come from the metadata store (count and pagination included);
    /// each row is enriched with the observed phase and endpoint.
    pub async fn list_sandboxes(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SandboxSummary>, usize), Error> {
        let (rows, total) = self.metadata.list_sandboxes(user_id, limit, offset).await?;
        let summaries = rows
            .into_iter()
            .map(|row| {
                let status = self
                    .cache
                    .sandbox(&self.namespace, &row.id)
                    .map(|s| s.status_cloned())
                    .unwrap_or_default();
                SandboxSummary {
                    id: row.id,
                    runtime: row.runtime,
                    phase: status.phase,
                    endpoint: status.endpoint,
                    created_at: row.created_at,
                }
            })
            .collect();
        Ok((summaries, total))
    }

    /// Delete the Sandbox resource. The finalizer holds the object until
    /// cleanup completes, so a subsequent get may still see it Terminating.
    pub async fn terminate_sandbox(&self, id: &str) -> Result<(), Error> {
        let api = self.sandboxes();
        match api.delete(id, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {
                return Err(Error::SandboxNotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = self.metadata.delete_sandbox_metadata(id).await {
            warn!(sandbox = %id, error = %err, "metadata row deletion failed");
        }
        Ok(())
    }

    pub async fn create_warm_pool(
        &self,
        name: &str,
        spec: WarmPoolSpec,
    ) -> Result<WarmPool, Error> {
        validation::validate_name(name)?;
        validation::validate_pool(&spec)?;
        let pool = WarmPool::new(name, spec);
        Ok(self.warm_pools().create(&PostParams::default(), &pool).await?)
    }

    pub async fn get_warm_pool(&self, name: &str) -> Result<WarmPool, Error> {
        self.warm_pools()
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    pub async fn get_warm_pool_status(&self, name: &str) -> Result<WarmPoolStatus, Error> {
        Ok(self.get_warm_pool(name).await?.status_cloned())
    }

    /// Replace the declared spec; the pool reconciler converges on it.
    pub async fn update_warm_pool(
        &self,
        name: &str,
        spec: WarmPoolSpec,
    ) -> Result<WarmPool, Error> {
        validation::validate_pool(&spec)?;
        let api = self.warm_pools();
        let mut pool = self
            .get_warm_pool(name)
            .await?;
        pool.spec = spec;
        pool.status = None;
        Ok(api.replace(name, &PostParams::default(), &pool).await?)
    }

    pub async fn delete_warm_pool(&self, name: &str) -> Result<(), Error> {
        match self
            .warm_pools()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(Error::PoolNotFound(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_warm_pools(&self) -> Result<Vec<WarmPool>, Error> {
        let list = self.warm_pools().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// Ownership check delegated to the metadata store.
    pub async fn check_ownership(
        &self,
        user_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<bool, Error> {
        self.metadata
            .check_resource_ownership(user_id, kind, id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_into_spec() {
        let request: CreateSandboxRequest = serde_json::from_value(serde_json::json!({
            "runtime": "python:3.10",
            "useWarmPool": true,
        }))
        .unwrap();
        let spec = request.into_spec();
        assert_eq!(spec.runtime, "python:3.10");
        assert!(spec.use_warm_pool);
        assert_eq!(spec.security_level, SecurityLevel::Standard);
        assert_eq!(spec.resources.cpu, "500m");
        assert!(spec.filesystem.read_only_root);
    }

    #[test]
    fn test_tilde_expand() {
        unsafe { std::env::set_var("HOME", "/home/tester") };
        assert_eq!(tilde_expand("~/.kube/config"), "/home/tester/.kube/config");
        assert_eq!(tilde_expand("/etc/kubeconfig"), "/etc/kubeconfig");
    }
}
