//! Prometheus metrics
//!
//! Collectors are created lazily and registered into the default registry by
//! [`register`], which the metrics server gathers from.

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("kmm_reconcile_total", "Reconciliation passes by result"),
        &["controller", "result"],
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"))
});

pub static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "kmm_reconcile_duration_seconds",
            "Duration of reconciliation passes",
        ),
        &["controller"],
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"))
});

pub static JOBS_CREATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("kmm_jobs_created_total", "Build and sign jobs created"),
        &["stage"],
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"))
});

pub static GC_DELETIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("kmm_gc_deletions_total", "Garbage-collected objects by kind"),
        &["kind", "result"],
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"))
});

pub static UNRESOLVED_KERNELS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "kmm_unresolved_kernels",
            "Kernel versions of a module that resolved to no image",
        ),
        &["namespace", "module"],
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"))
});

/// Register every collector with the default registry
pub fn register() {
    let registry = prometheus::default_registry();
    // Re-registration only fails with AlreadyReg, which is harmless
    let _ = registry.register(Box::new(RECONCILE_TOTAL.clone()));
    let _ = registry.register(Box::new(RECONCILE_DURATION.clone()));
    let _ = registry.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = registry.register(Box::new(GC_DELETIONS_TOTAL.clone()));
    let _ = registry.register(Box::new(UNRESOLVED_KERNELS.clone()));
}
