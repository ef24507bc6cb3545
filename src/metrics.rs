//! Prometheus counters for control-plane activity.
//!
//! Compiled in by default; disabling the `metrics` feature turns every
//! recording call into a no-op so call sites stay unconditional.

#[cfg(feature = "metrics")]
mod imp {
    use lazy_static::lazy_static;
    use prometheus::{IntCounterVec, register_int_counter_vec};

    lazy_static! {
        static ref RECONCILES: IntCounterVec = register_int_counter_vec!(
            "safespace_reconciles_total",
            "Reconcile invocations by controller and outcome",
            &["controller", "outcome"]
        )
        .unwrap();
        static ref ALLOCATIONS: IntCounterVec = register_int_counter_vec!(
            "safespace_warm_allocations_total",
            "Warm pod allocation attempts by outcome",
            &["outcome"]
        )
        .unwrap();
        static ref RECYCLES: IntCounterVec = register_int_counter_vec!(
            "safespace_recycles_total",
            "Recycle decisions by outcome and reason",
            &["outcome", "reason"]
        )
        .unwrap();
        static ref SWEEPS: IntCounterVec = register_int_counter_vec!(
            "safespace_sweeper_transitions_total",
            "Phase transitions forced by the background sweeper",
            &["action"]
        )
        .unwrap();
    }

    pub fn reconcile(controller: &str, outcome: &str) {
        RECONCILES.with_label_values(&[controller, outcome]).inc();
    }

    pub fn allocation(outcome: &str) {
        ALLOCATIONS.with_label_values(&[outcome]).inc();
    }

    pub fn recycle_success() {
        RECYCLES.with_label_values(&["success", ""]).inc();
    }

    pub fn recycle_rejected(reason: &str) {
        RECYCLES.with_label_values(&["rejected", reason]).inc();
    }

    pub fn sweep(action: &str) {
        SWEEPS.with_label_values(&[action]).inc();
    }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    pub fn reconcile(_controller: &str, _outcome: &str) {}
    pub fn allocation(_outcome: &str) {}
    pub fn recycle_success() {}
    pub fn recycle_rejected(_reason: &str) {}
    pub fn sweep(_action: &str) {}
}

pub use imp::*;
