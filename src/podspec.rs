//! Pod, Service and NetworkPolicy construction for sandboxes and warm pods.
//!
//! Everything the control plane creates in the cluster is built here so the
//! security posture lives in one place: non-root uid, dropped capabilities,
//! seccomp, read-only root with declared writable paths as emptyDir mounts,
//! and a default-deny NetworkPolicy with explicit egress holes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, Pod, PodSpec, ResourceRequirements,
    SeccompProfile, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{
    LABEL_MANAGED_BY, LABEL_POOL, LABEL_SANDBOX_ID, MANAGER_NAME, ResourceRequests, Sandbox,
    SecurityLevel, WarmPod, WarmPool,
};
use crate::runtimes::{self, RuntimeEnvironment};

/// Name of the main container in every managed pod
pub const CONTAINER_NAME: &str = "sandbox";

/// Port the in-pod execution service listens on
pub const SERVICE_PORT: i32 = 8080;

/// Annotation carrying declared egress domains for DNS-aware CNIs
pub const ANNOTATION_EGRESS_DOMAINS: &str = "safespace.dev/egress-domains";

/// Marker file whose mtime separates preload writes from session writes
pub const PROVISION_MARKER: &str = "/tmp/.provisioned";

/// Backing pod name for a sandbox
pub fn sandbox_pod_name(sandbox_name: &str) -> String {
    format!("sandbox-{}", sandbox_name)
}

/// Service name for a sandbox's execution endpoint
pub fn service_name(sandbox_name: &str) -> String {
    format!("sandbox-{}-svc", sandbox_name)
}

/// NetworkPolicy name for a pod
pub fn network_policy_name(pod_name: &str) -> String {
    format!("{}-deny-all", pod_name)
}

/// In-cluster address of a sandbox's execution service
pub fn endpoint_for(sandbox_name: &str, namespace: &str) -> String {
    format!(
        "http://{}.{}.svc:{}",
        service_name(sandbox_name),
        namespace,
        SERVICE_PORT
    )
}

/// Standard labels for all managed pods
fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels
}

/// Labels for a pod bound to a sandbox
pub fn sandbox_pod_labels(sandbox_name: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_name.to_string());
    labels
}

/// Labels for a pod sitting in a warm pool
pub fn warm_pod_labels(pool_name: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(LABEL_POOL.to_string(), pool_name.to_string());
    labels
}

/// Container security context for a given isolation level. Every level is
/// non-root with all capabilities dropped; `high` additionally pins the
/// primary group so nothing inherits volume group ownership.
fn security_context(level: SecurityLevel, read_only_root: bool) -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(read_only_root),
        run_as_non_root: Some(true),
        run_as_user: Some(1000),
        run_as_group: if level == SecurityLevel::High {
            Some(1000)
        } else {
            None
        },
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resource limits from declared quantity strings.
fn resource_limits(resources: &ResourceRequests) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(resources.cpu.clone()));
    limits.insert("memory".to_string(), Quantity(resources.memory.clone()));
    if let Some(ref storage) = resources.ephemeral_storage {
        limits.insert("ephemeral-storage".to_string(), Quantity(storage.clone()));
    }
    ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    }
}

/// EmptyDir volumes and mounts for each declared writable path.
fn writable_volumes(paths: &[String]) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let name = format!("writable-{}", i);
        volumes.push(Volume {
            name: name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: path.clone(),
            ..Default::default()
        });
    }
    (volumes, mounts)
}

fn restricted_annotations() -> BTreeMap<String, String> {
    let mut ann = BTreeMap::new();
    ann.insert(
        "pod-security.kubernetes.io/enforce".to_string(),
        "restricted".to_string(),
    );
    ann
}

/// Build the backing Pod for a sandbox created from scratch.
pub fn build_sandbox_pod(
    sandbox: &Sandbox,
    runtime: &RuntimeEnvironment,
    runtime_class: Option<&str>,
) -> Pod {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();
    let spec = &sandbox.spec;

    let (volumes, mounts) = writable_volumes(&spec.filesystem.writable_paths);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(runtime.image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ]),
        security_context: Some(security_context(
            spec.security_level,
            spec.filesystem.read_only_root,
        )),
        resources: Some(resource_limits(&spec.resources)),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let owner_ref = sandbox
        .controller_owner_ref(&())
        .expect("sandbox has a name");

    Pod {
        metadata: ObjectMeta {
            name: Some(sandbox_pod_name(&name)),
            namespace: Some(namespace),
            labels: Some(sandbox_pod_labels(&name)),
            annotations: Some(restricted_annotations()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            enable_service_links: Some(spec.security_level != SecurityLevel::High),
            runtime_class_name: runtime_class.map(|s| s.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the backing Pod for a warm pool member, including preload init
/// containers run in declared order and a package-install step.
pub fn build_warm_pod(
    pool: &WarmPool,
    warm_pod: &WarmPod,
    runtime: &RuntimeEnvironment,
    runtime_class: Option<&str>,
) -> Pod {
    let pool_name = pool.name_any();
    let pod_name = warm_pod.name_any();
    let namespace = warm_pod.namespace().unwrap_or_default();

    let default_paths = vec!["/workspace".to_string(), "/tmp".to_string()];
    let (volumes, mounts) = writable_volumes(&default_paths);

    let mut init_containers = Vec::new();
    for (i, script) in pool.spec.preload_scripts.iter().enumerate() {
        init_containers.push(Container {
            name: format!("preload-{}-{}", i, script.name),
            image: Some(runtime.image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.content.clone(),
            ]),
            security_context: Some(security_context(pool.spec.security_level, false)),
            volume_mounts: Some(mounts.clone()),
            ..Default::default()
        });
    }
    if let Some(install) = runtimes::install_command(runtime, &pool.spec.preload_packages) {
        init_containers.push(Container {
            name: "preload-packages".to_string(),
            image: Some(runtime.image.to_string()),
            command: Some(install),
            security_context: Some(security_context(pool.spec.security_level, false)),
            volume_mounts: Some(mounts.clone()),
            ..Default::default()
        });
    }
    // Stamp the provision marker last so anything written afterwards counts
    // as session state.
    init_containers.push(Container {
        name: "provision-marker".to_string(),
        image: Some(runtime.image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch {}", PROVISION_MARKER),
        ]),
        security_context: Some(security_context(pool.spec.security_level, false)),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    });

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(runtime.image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ]),
        security_context: Some(security_context(pool.spec.security_level, true)),
        resources: Some(resource_limits(&pool.spec.resources)),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let owner_ref = warm_pod
        .controller_owner_ref(&())
        .expect("warm pod has a name");

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace),
            labels: Some(warm_pod_labels(&pool_name)),
            annotations: Some(restricted_annotations()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            runtime_class_name: runtime_class.map(|s| s.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Service exposing a sandbox's execution endpoint.
pub fn build_service(sandbox: &Sandbox) -> Service {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();
    let owner_ref = sandbox
        .controller_owner_ref(&())
        .expect("sandbox has a name");

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_SANDBOX_ID.to_string(), name.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&name)),
            namespace: Some(namespace),
            labels: Some(sandbox_pod_labels(&name)),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(SERVICE_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the default-deny NetworkPolicy for a sandbox, opening only the
/// declared egress holes. Vanilla NetworkPolicy cannot match FQDNs, so
/// declared domains ride along as an annotation for DNS-aware CNIs while
/// ports and protocols are enforced natively.
pub fn build_network_policy(sandbox: &Sandbox) -> NetworkPolicy {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();
    let spec = &sandbox.spec;
    let owner_ref = sandbox
        .controller_owner_ref(&())
        .expect("sandbox has a name");

    let mut match_labels = BTreeMap::new();
    match_labels.insert(LABEL_SANDBOX_ID.to_string(), name.clone());

    let mut egress: Vec<NetworkPolicyEgressRule> = Vec::new();
    let mut domains: Vec<&str> = Vec::new();
    for rule in &spec.network_access.egress {
        domains.push(rule.domain.as_str());
        let ports: Vec<NetworkPolicyPort> = rule
            .ports
            .iter()
            .map(|p| NetworkPolicyPort {
                port: Some(IntOrString::Int(i32::from(p.port))),
                protocol: Some(if p.protocol.is_empty() {
                    "TCP".to_string()
                } else {
                    p.protocol.clone()
                }),
                ..Default::default()
            })
            .collect();
        egress.push(NetworkPolicyEgressRule {
            ports: if ports.is_empty() { None } else { Some(ports) },
            to: None,
        });
    }
    if !egress.is_empty() {
        // DNS stays reachable whenever any egress is allowed
        egress.push(NetworkPolicyEgressRule {
            ports: Some(
                ["UDP", "TCP"]
                    .iter()
                    .map(|proto| NetworkPolicyPort {
                        port: Some(IntOrString::Int(53)),
                        protocol: Some(proto.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            to: None,
        });
    }

    let ingress = if spec.network_access.ingress {
        // same-namespace only; the Service fronts the pod
        vec![NetworkPolicyIngressRule {
            from: None,
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(SERVICE_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
        }]
    } else {
        Vec::new()
    };

    let mut annotations = BTreeMap::new();
    if !domains.is_empty() {
        annotations.insert(ANNOTATION_EGRESS_DOMAINS.to_string(), domains.join(","));
    }

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(network_policy_name(&sandbox_pod_name(&name))),
            namespace: Some(namespace),
            labels: Some(sandbox_pod_labels(&name)),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            },
            // empty lists mean deny-all in both directions
            ingress: Some(ingress),
            egress: Some(egress),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
        }),
    }
}

/// True when the pod is Running and reports a True Ready condition.
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}
