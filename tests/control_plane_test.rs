//! Control-plane integration tests
//!
//! These tests exercise the sandbox lifecycle against a live cluster with
//! the safespace CRDs installed (`safespace crds | kubectl apply -f -`) and
//! the controller running. Ignored by default since they need a cluster.
//!
//! Run with: cargo test --test control_plane_test -- --ignored

use std::time::Duration;

use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};

use safespace::crd::{
    Sandbox, SandboxPhase, SandboxSpec, WarmPod, WarmPodPhase, WarmPool, WarmPoolSpec,
};

const NAMESPACE: &str = "safespace";

/// Probe for a reachable cluster; tests bail out quietly without one.
async fn cluster_client() -> Option<Client> {
    let client = Client::try_default().await.ok()?;
    client.apiserver_version().await.ok()?;
    Some(client)
}

fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn sandbox_spec(use_warm_pool: bool) -> SandboxSpec {
    serde_json::from_value(serde_json::json!({
        "runtime": "python:3.10",
        "timeoutSeconds": 300,
        "useWarmPool": use_warm_pool,
    }))
    .unwrap()
}

fn pool_spec(min_size: u32) -> WarmPoolSpec {
    serde_json::from_value(serde_json::json!({
        "runtime": "python:3.10",
        "minSize": min_size,
    }))
    .unwrap()
}

/// Poll until the sandbox reaches the wanted phase or the deadline passes.
async fn wait_for_phase(
    api: &Api<Sandbox>,
    name: &str,
    wanted: SandboxPhase,
    deadline: Duration,
) -> bool {
    let mut waited = Duration::ZERO;
    let step = Duration::from_millis(500);
    while waited < deadline {
        if let Ok(Some(sandbox)) = api.get_opt(name).await {
            if sandbox.phase() == wanted {
                return true;
            }
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    false
}

async fn cleanup_sandbox(api: &Api<Sandbox>, name: &str) {
    let _ = api.delete(name, &DeleteParams::default()).await;
}

// === Lifecycle scenarios ===

#[tokio::test]
#[ignore] // Requires a cluster with the controller running
async fn test_cold_create_run_terminate() {
    let Some(client) = cluster_client().await else {
        eprintln!("Skipping test: no cluster available");
        return;
    };
    let api: Api<Sandbox> = Api::namespaced(client, NAMESPACE);
    let name = unique_name("cold");

    let sandbox = Sandbox::new(&name, sandbox_spec(false));
    api.create(&PostParams::default(), &sandbox).await.unwrap();

    assert!(
        wait_for_phase(&api, &name, SandboxPhase::Running, Duration::from_secs(120)).await,
        "sandbox never reached Running"
    );
    let running = api.get(&name).await.unwrap();
    let status = running.status_cloned();
    assert!(!status.pod_name.is_empty(), "podName not recorded");
    assert!(status.start_time.is_some(), "startTime not recorded");
    assert!(!status.endpoint.is_empty(), "endpoint not recorded");

    api.delete(&name, &DeleteParams::default()).await.unwrap();
    // the finalizer holds the object until cleanup completes, then it goes
    let mut waited = Duration::ZERO;
    while waited < Duration::from_secs(120) {
        if api.get_opt(&name).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += Duration::from_secs(1);
    }
    panic!("sandbox was not fully deleted");
}

#[tokio::test]
#[ignore] // Requires a cluster with the controller running
async fn test_warm_hit_assigns_existing_pod() {
    let Some(client) = cluster_client().await else {
        eprintln!("Skipping test: no cluster available");
        return;
    };
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), NAMESPACE);
    let warm_pods: Api<WarmPod> = Api::namespaced(client.clone(), NAMESPACE);
    let sandboxes: Api<Sandbox> = Api::namespaced(client, NAMESPACE);

    let pool_name = unique_name("pool");
    let pool = WarmPool::new(&pool_name, pool_spec(1));
    pools.create(&PostParams::default(), &pool).await.unwrap();

    // wait for the pool to produce a Ready warm pod
    let mut ready_pod = None;
    for _ in 0..240 {
        let list = warm_pods
            .list(&kube::api::ListParams::default())
            .await
            .unwrap();
        ready_pod = list
            .items
            .into_iter()
            .find(|wp| wp.spec.pool_ref.name == pool_name && wp.is_assignable());
        if ready_pod.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let ready_pod = ready_pod.expect("pool never produced a Ready warm pod");

    let name = unique_name("warm");
    let sandbox = Sandbox::new(&name, sandbox_spec(true));
    sandboxes
        .create(&PostParams::default(), &sandbox)
        .await
        .unwrap();

    assert!(
        wait_for_phase(&sandboxes, &name, SandboxPhase::Running, Duration::from_secs(60)).await,
        "warm sandbox never reached Running"
    );

    let running = sandboxes.get(&name).await.unwrap();
    let status = running.status_cloned();
    let warm_ref = status.warm_pod_ref.expect("warmPodRef not recorded");
    assert_eq!(warm_ref.name, ready_pod.name_any());

    let claimed = warm_pods.get(&ready_pod.name_any()).await.unwrap();
    let claimed_status = claimed.status_cloned();
    assert_eq!(claimed_status.phase, WarmPodPhase::Assigned);
    assert_eq!(claimed_status.assigned_to, name);

    cleanup_sandbox(&sandboxes, &name).await;
    let _ = pools.delete(&pool_name, &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore] // Requires a cluster with the controller running
async fn test_allocator_race_single_winner() {
    let Some(client) = cluster_client().await else {
        eprintln!("Skipping test: no cluster available");
        return;
    };
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), NAMESPACE);
    let warm_pods: Api<WarmPod> = Api::namespaced(client.clone(), NAMESPACE);
    let sandboxes: Api<Sandbox> = Api::namespaced(client, NAMESPACE);

    let pool_name = unique_name("race");
    let pool = WarmPool::new(&pool_name, pool_spec(1));
    pools.create(&PostParams::default(), &pool).await.unwrap();

    // one Ready pod, two takers
    for _ in 0..240 {
        let list = warm_pods
            .list(&kube::api::ListParams::default())
            .await
            .unwrap();
        if list
            .items
            .iter()
            .any(|wp| wp.spec.pool_ref.name == pool_name && wp.is_assignable())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let first = unique_name("racer");
    let second = unique_name("racer");
    for name in [&first, &second] {
        let sandbox = Sandbox::new(name, sandbox_spec(true));
        sandboxes
            .create(&PostParams::default(), &sandbox)
            .await
            .unwrap();
    }

    for name in [&first, &second] {
        assert!(
            wait_for_phase(&sandboxes, name, SandboxPhase::Running, Duration::from_secs(180)).await,
            "sandbox {} never reached Running",
            name
        );
    }

    // exactly one adopted the warm pod, the other went cold
    let mut warm_refs = 0;
    for name in [&first, &second] {
        if sandboxes
            .get(name)
            .await
            .unwrap()
            .status_cloned()
            .warm_pod_ref
            .is_some()
        {
            warm_refs += 1;
        }
    }
    assert_eq!(warm_refs, 1, "expected exactly one warm adoption");

    for name in [&first, &second] {
        cleanup_sandbox(&sandboxes, name).await;
    }
    let _ = pools.delete(&pool_name, &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore] // Requires a cluster with the controller running
async fn test_pool_maintains_min_size() {
    let Some(client) = cluster_client().await else {
        eprintln!("Skipping test: no cluster available");
        return;
    };
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), NAMESPACE);
    let warm_pods: Api<WarmPod> = Api::namespaced(client, NAMESPACE);

    let pool_name = unique_name("sized");
    let pool = WarmPool::new(&pool_name, pool_spec(2));
    pools.create(&PostParams::default(), &pool).await.unwrap();

    let mut ready = 0;
    for _ in 0..360 {
        let list = warm_pods
            .list(&kube::api::ListParams::default())
            .await
            .unwrap();
        ready = list
            .items
            .iter()
            .filter(|wp| wp.spec.pool_ref.name == pool_name && wp.is_assignable())
            .count();
        if ready >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(ready >= 2, "pool never reached minSize ready pods");

    let status = pools.get(&pool_name).await.unwrap().status_cloned();
    assert!(status.available_pods >= 2);

    let _ = pools.delete(&pool_name, &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore] // Requires a cluster with the controller running
async fn test_terminate_unknown_sandbox_is_clean_404() {
    let Some(client) = cluster_client().await else {
        eprintln!("Skipping test: no cluster available");
        return;
    };
    let api: Api<Sandbox> = Api::namespaced(client, NAMESPACE);
    let result = api
        .delete("does-not-exist-anywhere", &DeleteParams::default())
        .await;
    match result {
        Err(kube::Error::Api(ae)) => assert_eq!(ae.code, 404),
        other => panic!("expected a 404, got {:?}", other.map(|_| ())),
    }
}
