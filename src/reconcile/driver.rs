//! Generic reconciliation driver
//!
//! A pass is the same sequence for every top-level kind; what differs is how
//! each step is carried out. Kinds plug their behavior in through
//! [`ReconcileHooks`] and share [`ReconcileDriver::reconcile`]:
//!
//! ```text
//! fetch ─▶ resolve ─▶ orchestrate ─▶ project ─▶ aggregate ─▶ collect_garbage ─▶ requeue?
//! ```
//!
//! Passes keep no state between runs: everything is rebuilt from the cluster.

use super::gc::GcReport;
use crate::domain::ObjectKey;
use crate::error::Result;
use crate::metrics;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a successful pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next change
    Done,
    /// Work is still running; come back later
    RequeueAfter(Duration),
}

/// Per-kind behavior of a reconciliation pass
#[async_trait]
pub trait ReconcileHooks: Send + Sync {
    type Object: Send + Sync;
    type Targets: Send + Sync;
    type Outcomes: Send + Sync;
    type Projection: Send + Sync;

    /// Controller name used in logs and metrics
    fn controller(&self) -> &'static str;

    /// Read the object; `None` when it no longer exists
    async fn fetch(&self, key: &ObjectKey) -> Result<Option<Self::Object>>;

    /// Select targets and resolve their kernel mappings
    async fn resolve(&self, object: &Self::Object) -> Result<Self::Targets>;

    /// Drive the image pipeline of every resolved kernel version
    async fn orchestrate(&self, targets: &Self::Targets) -> Result<Self::Outcomes>;

    /// Create or patch the derived state of completed kernel versions
    async fn project(
        &self,
        object: &Self::Object,
        targets: &Self::Targets,
        outcomes: &Self::Outcomes,
    ) -> Result<Self::Projection>;

    /// Write the object status
    async fn aggregate(
        &self,
        object: &Self::Object,
        targets: &Self::Targets,
        outcomes: &Self::Outcomes,
        projection: &Self::Projection,
    ) -> Result<()>;

    /// Delete derived objects outside the pass scope
    async fn collect_garbage(&self, targets: &Self::Targets) -> GcReport;

    fn requeue_after(&self, outcomes: &Self::Outcomes) -> Option<Duration>;
}

/// Runs reconciliation passes for one kind
pub struct ReconcileDriver<H> {
    hooks: H,
}

impl<H: ReconcileHooks> ReconcileDriver<H> {
    pub fn new(hooks: H) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Run one pass for `key`
    #[instrument(skip_all, fields(controller = self.hooks.controller(), object = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let controller = self.hooks.controller();
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[controller])
            .start_timer();

        let result = self.run_pass(key).await;
        let label = match &result {
            Ok(ReconcileOutcome::Done) => "done",
            Ok(ReconcileOutcome::RequeueAfter(_)) => "requeue",
            Err(_) => "error",
        };
        metrics::RECONCILE_TOTAL
            .with_label_values(&[controller, label])
            .inc();
        result
    }

    async fn run_pass(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(object) = self.hooks.fetch(key).await? else {
            debug!("Object no longer exists");
            return Ok(ReconcileOutcome::Done);
        };

        let targets = self.hooks.resolve(&object).await?;
        let outcomes = self.hooks.orchestrate(&targets).await?;
        let projection = self.hooks.project(&object, &targets, &outcomes).await?;
        self.hooks
            .aggregate(&object, &targets, &outcomes, &projection)
            .await?;

        let report = self.hooks.collect_garbage(&targets).await;
        if !report.deleted.is_empty() {
            info!(deleted = report.deleted.len(), "Garbage collected stale objects");
        }
        if !report.is_clean() {
            warn!(failed = report.failed.len(), "Garbage collection left objects behind");
        }

        Ok(match self.hooks.requeue_after(&outcomes) {
            Some(delay) => {
                debug!(?delay, "Pipelines still running; requeueing");
                ReconcileOutcome::RequeueAfter(delay)
            }
            None => ReconcileOutcome::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;

    /// Hooks recording the order of calls
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        missing: bool,
        fail_orchestrate: bool,
        in_progress: bool,
    }

    #[async_trait]
    impl ReconcileHooks for Recorder {
        type Object = ();
        type Targets = ();
        type Outcomes = bool;
        type Projection = ();

        fn controller(&self) -> &'static str {
            "test"
        }

        async fn fetch(&self, _key: &ObjectKey) -> Result<Option<()>> {
            self.calls.lock().push("fetch");
            Ok((!self.missing).then_some(()))
        }

        async fn resolve(&self, _object: &()) -> Result<()> {
            self.calls.lock().push("resolve");
            Ok(())
        }

        async fn orchestrate(&self, _targets: &()) -> Result<bool> {
            self.calls.lock().push("orchestrate");
            if self.fail_orchestrate {
                return Err(Error::StoreUnavailable("api down".into()));
            }
            Ok(self.in_progress)
        }

        async fn project(&self, _o: &(), _t: &(), _out: &bool) -> Result<()> {
            self.calls.lock().push("project");
            Ok(())
        }

        async fn aggregate(&self, _o: &(), _t: &(), _out: &bool, _p: &()) -> Result<()> {
            self.calls.lock().push("aggregate");
            Ok(())
        }

        async fn collect_garbage(&self, _targets: &()) -> GcReport {
            self.calls.lock().push("gc");
            GcReport::default()
        }

        fn requeue_after(&self, in_progress: &bool) -> Option<Duration> {
            in_progress.then(|| Duration::from_secs(30))
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("drivers", "kmod")
    }

    #[tokio::test]
    async fn test_pass_order() {
        let driver = ReconcileDriver::new(Recorder::default());
        let outcome = driver.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(
            *driver.hooks().calls.lock(),
            vec!["fetch", "resolve", "orchestrate", "project", "aggregate", "gc"]
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_done() {
        let driver = ReconcileDriver::new(Recorder {
            missing: true,
            ..Default::default()
        });
        assert_eq!(driver.reconcile(&key()).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(*driver.hooks().calls.lock(), vec!["fetch"]);
    }

    #[tokio::test]
    async fn test_transient_error_aborts_pass() {
        let driver = ReconcileDriver::new(Recorder {
            fail_orchestrate: true,
            ..Default::default()
        });
        assert!(driver.reconcile(&key()).await.is_err());
        assert_eq!(
            *driver.hooks().calls.lock(),
            vec!["fetch", "resolve", "orchestrate"]
        );
    }

    #[tokio::test]
    async fn test_in_progress_requeues() {
        let driver = ReconcileDriver::new(Recorder {
            in_progress: true,
            ..Default::default()
        });
        assert_eq!(
            driver.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::from_secs(30))
        );
    }
}
