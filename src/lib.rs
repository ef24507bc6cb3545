//! safespace library
//!
//! Kubernetes control plane for secure, ephemeral code-execution sandboxes
//! used by LLM agents: reconcilers for Sandbox, WarmPool and WarmPod
//! resources, atomic warm-pod allocation, pod recycling, and a background
//! sweeper, plus the façade the HTTP API layer consumes.

pub mod allocator;
pub mod cache;
pub mod config;
pub mod controller;
pub mod controlplane;
pub mod crd;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod patch;
pub mod podspec;
pub mod recycler;
pub mod runtimes;
pub mod sweeper;
pub mod validation;
