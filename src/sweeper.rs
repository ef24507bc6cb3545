//! Background sweeper enforcing timeouts and stuck-state deadlines.
//!
//! Runs on a fixed interval, independent of change events, so sandboxes
//! whose pods stopped generating watch traffic still get reclaimed. The
//! sweeper only advances phases; actual cleanup stays with the reconcilers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ClusterCache;
use crate::config::SweeperConfig;
use crate::crd::conditions::{
    CONDITION_EXPIRED, CONDITION_POD_MISSING, CONDITION_STUCK, set_condition,
};
use crate::crd::{ConditionStatus, Sandbox, SandboxPhase};
use crate::errors::Error;
use crate::metrics;
use crate::patch::update_status;

/// What the sweeper decided for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepVerdict {
    /// Outlived its declared timeout plus grace: advance to Terminating
    Expire,
    /// Never left Pending/Creating: park in Failed
    MarkStuck,
    /// Running but its pod is gone from the cache: park in Failed
    PodMissing,
}

pub struct Sweeper {
    client: Client,
    cache: Arc<ClusterCache>,
    interval: Duration,
    grace: Duration,
    stuck_after: Duration,
}

impl Sweeper {
    pub fn new(client: Client, cache: Arc<ClusterCache>, config: &SweeperConfig) -> Self {
        Self {
            client,
            cache,
            interval: config.interval(),
            grace: config.timeout_grace(),
            stuck_after: config.stuck_threshold(),
        }
    }

    /// Run until shutdown, sweeping every interval.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.sweep_once().await;
            }
        })
    }

    /// One pass over every cached sandbox. Per-sandbox errors are logged and
    /// the pass continues; the next tick retries.
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        for sandbox in self.cache.sandboxes() {
            let status = sandbox.status_cloned();
            let pod_namespace = if status.pod_namespace.is_empty() {
                sandbox.namespace().unwrap_or_default()
            } else {
                status.pod_namespace.clone()
            };
            let pod_exists = !status.pod_name.is_empty()
                && self.cache.pod_exists(&pod_namespace, &status.pod_name);
            let Some(verdict) = assess(&sandbox, pod_exists, now, self.grace, self.stuck_after)
            else {
                continue;
            };
            if let Err(err) = self.apply(&sandbox, verdict).await {
                warn!(
                    sandbox = %sandbox.name_any(),
                    error = %err,
                    "sweeper transition failed"
                );
            }
        }
    }

    async fn apply(&self, sandbox: &Sandbox, verdict: SweepVerdict) -> Result<(), Error> {
        let namespace = sandbox
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let name = sandbox.name_any();
        let api: Api<Sandbox> = Api::namespaced(self.client.clone(), &namespace);

        update_status(&api, &name, |status| {
            // a concurrent delete or terminate wins over the sweep
            if matches!(
                status.phase,
                SandboxPhase::Terminating | SandboxPhase::Terminated
            ) {
                return;
            }
            match verdict {
                SweepVerdict::Expire => {
                    status.phase = SandboxPhase::Terminating;
                    set_condition(
                        &mut status.conditions,
                        CONDITION_EXPIRED,
                        ConditionStatus::True,
                        "Timeout",
                        "sandbox outlived its declared timeout",
                    );
                }
                SweepVerdict::MarkStuck => {
                    status.phase = SandboxPhase::Failed;
                    set_condition(
                        &mut status.conditions,
                        CONDITION_STUCK,
                        ConditionStatus::True,
                        "CreationTimeout",
                        "sandbox did not become ready in time",
                    );
                }
                SweepVerdict::PodMissing => {
                    status.phase = SandboxPhase::Failed;
                    set_condition(
                        &mut status.conditions,
                        CONDITION_POD_MISSING,
                        ConditionStatus::True,
                        "PodMissing",
                        "backing pod no longer exists",
                    );
                }
            }
        })
        .await?;

        let action = match verdict {
            SweepVerdict::Expire => "expire",
            SweepVerdict::MarkStuck => "stuck",
            SweepVerdict::PodMissing => "pod-missing",
        };
        metrics::sweep(action);
        info!(sandbox = %name, action, "sweeper advanced sandbox phase");
        Ok(())
    }
}

/// Decide what, if anything, the sweeper should do with one sandbox.
pub(crate) fn assess(
    sandbox: &Sandbox,
    pod_exists: bool,
    now: DateTime<Utc>,
    grace: Duration,
    stuck_after: Duration,
) -> Option<SweepVerdict> {
    let status = sandbox.status_cloned();
    if matches!(
        status.phase,
        SandboxPhase::Terminating | SandboxPhase::Terminated | SandboxPhase::Failed
    ) {
        return None;
    }
    if sandbox.metadata.deletion_timestamp.is_some() {
        return None;
    }

    // timeout enforcement: only for sandboxes that declared one and started
    if sandbox.spec.timeout_seconds > 0 {
        if let Some(start) = status.start_time.as_ref() {
            let deadline = chrono::Duration::seconds(sandbox.spec.timeout_seconds as i64)
                + chrono::Duration::from_std(grace).unwrap_or_default();
            if now.signed_duration_since(start.0) > deadline {
                return Some(SweepVerdict::Expire);
            }
        }
    }

    // stuck detection: never left a transitional phase
    if matches!(status.phase, SandboxPhase::Pending | SandboxPhase::Creating) {
        if let Some(created) = sandbox.metadata.creation_timestamp.as_ref() {
            let limit = chrono::Duration::from_std(stuck_after).unwrap_or_default();
            if now.signed_duration_since(created.0) > limit {
                return Some(SweepVerdict::MarkStuck);
            }
        }
    }

    // pod drift: Running but the backing pod is gone
    if status.phase == SandboxPhase::Running && !status.pod_name.is_empty() && !pod_exists {
        return Some(SweepVerdict::PodMissing);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SandboxSpec, SandboxStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const GRACE: Duration = Duration::from_secs(300);
    const STUCK: Duration = Duration::from_secs(600);

    fn make_sandbox(
        timeout_seconds: u64,
        phase: SandboxPhase,
        started_ago: Option<Duration>,
        created_ago: Duration,
        now: DateTime<Utc>,
    ) -> Sandbox {
        let spec: SandboxSpec = serde_json::from_value(serde_json::json!({
            "runtime": "python:3.10",
            "timeoutSeconds": timeout_seconds,
        }))
        .unwrap();
        let mut sandbox = Sandbox::new("sb-1", spec);
        sandbox.metadata.namespace = Some("default".to_string());
        sandbox.metadata.creation_timestamp =
            Some(Time(now - chrono::Duration::from_std(created_ago).unwrap()));
        sandbox.status = Some(SandboxStatus {
            phase,
            pod_name: "sandbox-sb-1".to_string(),
            start_time: started_ago
                .map(|ago| Time(now - chrono::Duration::from_std(ago).unwrap())),
            ..Default::default()
        });
        sandbox
    }

    #[test]
    fn test_timeout_enforced_after_grace() {
        let now = Utc::now();
        // 60s timeout, started 300s ago: past timeout but within grace
        let sandbox = make_sandbox(
            60,
            SandboxPhase::Running,
            Some(Duration::from_secs(300)),
            Duration::from_secs(400),
            now,
        );
        assert_eq!(assess(&sandbox, true, now, GRACE, STUCK), None);

        // past timeout + grace
        assert_eq!(
            assess(
                &sandbox,
                true,
                now + chrono::Duration::seconds(120),
                GRACE,
                STUCK
            ),
            Some(SweepVerdict::Expire)
        );
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let now = Utc::now();
        let sandbox = make_sandbox(
            0,
            SandboxPhase::Running,
            Some(Duration::from_secs(1_000_000)),
            Duration::from_secs(1_000_000),
            now,
        );
        assert_eq!(assess(&sandbox, true, now, GRACE, STUCK), None);
    }

    #[test]
    fn test_stuck_detection() {
        let now = Utc::now();
        let sandbox = make_sandbox(
            0,
            SandboxPhase::Creating,
            None,
            Duration::from_secs(11 * 60),
            now,
        );
        assert_eq!(
            assess(&sandbox, true, now, GRACE, STUCK),
            Some(SweepVerdict::MarkStuck)
        );

        // not yet past the threshold
        let young = make_sandbox(
            0,
            SandboxPhase::Pending,
            None,
            Duration::from_secs(5 * 60),
            now,
        );
        assert_eq!(assess(&young, true, now, GRACE, STUCK), None);
    }

    #[test]
    fn test_pod_drift() {
        let now = Utc::now();
        let sandbox = make_sandbox(
            0,
            SandboxPhase::Running,
            Some(Duration::from_secs(30)),
            Duration::from_secs(60),
            now,
        );
        assert_eq!(
            assess(&sandbox, false, now, GRACE, STUCK),
            Some(SweepVerdict::PodMissing)
        );
        assert_eq!(assess(&sandbox, true, now, GRACE, STUCK), None);
    }

    #[test]
    fn test_terminal_phases_untouched() {
        let now = Utc::now();
        for phase in [
            SandboxPhase::Terminating,
            SandboxPhase::Terminated,
            SandboxPhase::Failed,
        ] {
            let sandbox = make_sandbox(
                1,
                phase,
                Some(Duration::from_secs(1_000_000)),
                Duration::from_secs(1_000_000),
                now,
            );
            assert_eq!(assess(&sandbox, false, now, GRACE, STUCK), None);
        }
    }
}
