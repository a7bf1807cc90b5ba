//! Controller runtime wiring
//!
//! Binds the reconcile drivers to `kube::runtime` controllers: watch setup,
//! the Module finalizer, requeue decisions and per-object retry backoff.

use crate::adapters::KubeCluster;
use crate::config::OperatorConfig;
use crate::crd::{ManagedCluster, ManagedClusterModule, ManifestWork, Module};
use crate::domain::{ImageRegistryRef, ObjectKey};
use crate::error::{Error, ErrorAction, Result};
use crate::labels::{matches_selector, MODULE_NAME_LABEL, OWNER_KIND_LABEL};
use crate::reconcile::{
    HubHooks, HubPorts, HubReconciler, ModuleHooks, ModulePorts, ModuleReconciler,
    ReconcileDriver, ReconcileHooks, ReconcileOutcome,
};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Finalizer holding a Module until its node entries are removed
pub const MODULE_FINALIZER: &str = "kmm.sigs.x-k8s.io/module-finalizer";

const RETRY_INITIAL: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);

// =============================================================================
// Retry Tracking
// =============================================================================

/// Exponential backoff per object, reset after a successful pass.
///
/// Entries idle for longer than twice the maximum delay belong to objects
/// that stopped failing without a successful pass (usually deleted ones)
/// and are dropped.
pub struct RetryTracker {
    initial: Duration,
    max: Duration,
    backoffs: DashMap<String, (ExponentialBackoff, Instant)>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(RETRY_INITIAL, RETRY_MAX)
    }
}

impl RetryTracker {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            backoffs: DashMap::new(),
        }
    }

    /// Delay before the next attempt for `key`
    pub fn next_delay(&self, key: &str) -> Duration {
        self.prune_idle();
        let mut entry = self.backoffs.entry(key.to_string()).or_insert_with(|| {
            let backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(self.initial)
                .with_max_interval(self.max)
                .with_randomization_factor(0.1)
                .with_max_elapsed_time(None)
                .build();
            (backoff, Instant::now())
        });
        let (backoff, last_used) = entry.value_mut();
        *last_used = Instant::now();
        backoff.next_backoff().unwrap_or(self.max)
    }

    pub fn reset(&self, key: &str) {
        self.backoffs.remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.backoffs.len()
    }

    fn prune_idle(&self) {
        let idle = self.max * 2;
        self.backoffs.retain(|_, (_, last_used)| last_used.elapsed() <= idle);
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Done => Action::await_change(),
            ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Requeue decision for a failed pass
pub fn requeue_action(error: &Error, key: &str, retries: &RetryTracker) -> Action {
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(retries.next_delay(key)),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

fn finalizer_error(err: FinalizerError<Error>) -> Error {
    match err {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => Error::Kube(e),
        other => Error::Internal(other.to_string()),
    }
}

fn object_key<K: Resource>(object: &K) -> ObjectKey {
    ObjectKey {
        namespace: object.namespace(),
        name: object.name_any(),
    }
}

/// Top-level objects whose selector matches the given labels
fn matching<K, F>(
    store: &Store<K>,
    labels: &BTreeMap<String, String>,
    selector: F,
) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    F: Fn(&K) -> &BTreeMap<String, String>,
{
    store
        .state()
        .into_iter()
        .filter(|object| matches_selector(labels, selector(object.as_ref())))
        .map(|object| ObjectRef::from_obj(object.as_ref()))
        .collect()
}

/// Node events worth a Module pass.
///
/// Only nodes carrying the kernel label are considered, and only when their
/// labels differ from the last event seen for them; status heartbeats and
/// deletions are dropped.
pub struct NodeLabelFilter {
    kernel_label: String,
    seen: DashMap<String, BTreeMap<String, String>>,
}

impl NodeLabelFilter {
    pub fn new(kernel_label: impl Into<String>) -> Self {
        Self {
            kernel_label: kernel_label.into(),
            seen: DashMap::new(),
        }
    }

    pub fn admit(&self, meta: &ObjectMeta) -> bool {
        let name = meta.name.clone().unwrap_or_default();
        let labels = meta.labels.clone().unwrap_or_default();
        if meta.deletion_timestamp.is_some() || !labels.contains_key(&self.kernel_label) {
            self.seen.remove(&name);
            return false;
        }
        match self.seen.insert(name, labels.clone()) {
            Some(previous) => previous != labels,
            None => true,
        }
    }
}

/// Hub module named by a derived object's module label
fn hub_module_of(meta: &ObjectMeta) -> Option<ObjectRef<ManagedClusterModule>> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MODULE_NAME_LABEL))
        .map(|name| ObjectRef::new(name))
}

/// State shared by the reconcile and error-policy callbacks of one controller
pub struct Context<H: ReconcileHooks> {
    client: Client,
    driver: ReconcileDriver<H>,
    retries: RetryTracker,
}

impl<H: ReconcileHooks> Context<H> {
    pub fn new(client: Client, driver: ReconcileDriver<H>) -> Self {
        Self {
            client,
            driver,
            retries: RetryTracker::default(),
        }
    }
}

fn error_policy<K, H>(object: Arc<K>, error: &Error, ctx: Arc<Context<H>>) -> Action
where
    K: Resource,
    H: ReconcileHooks,
{
    let key = object_key(object.as_ref()).to_string();
    let action = requeue_action(error, &key, &ctx.retries);
    if error.is_transient() {
        warn!(object = %key, %error, ?action, "Reconciliation failed");
    } else if error.is_resolution_error() {
        warn!(object = %key, %error, "Kernel mappings cannot be resolved; waiting for a change");
    } else if error.is_retryable() {
        error!(object = %key, %error, ?action, "Reconciliation failed");
    } else {
        error!(object = %key, %error, "Reconciliation failed; waiting for a change");
    }
    action
}

// =============================================================================
// Module Controller
// =============================================================================

#[instrument(skip_all, fields(module = %module.name_any(), namespace = module.namespace()))]
async fn reconcile_module(module: Arc<Module>, ctx: Arc<Context<ModuleHooks>>) -> Result<Action> {
    let key = object_key(module.as_ref());
    let namespace = key
        .namespace
        .clone()
        .ok_or_else(|| Error::Internal(format!("module {} has no namespace", key.name)))?;
    let api: Api<Module> = Api::namespaced(ctx.client.clone(), &namespace);

    let action = finalizer(&api, MODULE_FINALIZER, module, |event| async {
        match event {
            FinalizerEvent::Apply(_) => ctx.driver.reconcile(&key).await.map(Action::from),
            FinalizerEvent::Cleanup(module) => {
                info!("Module deleted; removing node entries");
                ctx.driver.hooks().cleanup(&module).await?;
                ctx.retries.reset(&key.to_string());
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(finalizer_error)?;

    ctx.retries.reset(&key.to_string());
    Ok(action)
}

/// Run the spoke controller until shutdown
pub async fn run_module_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    registry: ImageRegistryRef,
) -> Result<()> {
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let ports = ModulePorts {
        modules: cluster.clone(),
        nodes: cluster.clone(),
        jobs: cluster.clone(),
        workloads: cluster.clone(),
        node_state: cluster.clone(),
        registry,
    };
    let nodes = NodeLabelFilter::new(config.kernel_label.clone());
    let reconciler: ModuleReconciler = ReconcileDriver::new(ModuleHooks::new(config, ports));
    let ctx = Arc::new(Context::new(client.clone(), reconciler));

    let modules: Api<Module> = Api::all(client.clone());
    modules
        .list(&Default::default())
        .await
        .map_err(|e| Error::Configuration(format!("Module CRD not available: {}", e)))?;

    info!("Starting Module controller");
    let derived = watcher::Config::default().labels(MODULE_NAME_LABEL);
    let controller = Controller::new(modules, watcher::Config::default());
    let store = controller.store();

    controller
        .owns::<Job>(Api::all(client.clone()), derived.clone())
        .owns::<DaemonSet>(Api::all(client.clone()), derived)
        .watches(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            move |node: Node| {
                if !nodes.admit(&node.metadata) {
                    return Vec::new();
                }
                let labels = node.metadata.labels.unwrap_or_default();
                matching(&store, &labels, |module| &module.spec.selector)
            },
        )
        .shutdown_on_signal()
        .run(reconcile_module, error_policy::<Module, ModuleHooks>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, action)) => debug!(module = %object, ?action, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller event failed"),
            }
        })
        .await;

    info!("Module controller stopped");
    Ok(())
}

// =============================================================================
// Hub Controller
// =============================================================================

#[instrument(skip_all, fields(module = %module.name_any()))]
async fn reconcile_hub_module(
    module: Arc<ManagedClusterModule>,
    ctx: Arc<Context<HubHooks>>,
) -> Result<Action> {
    let key = ObjectKey::cluster_scoped(module.name_any());
    let outcome = ctx.driver.reconcile(&key).await?;
    ctx.retries.reset(&key.to_string());
    Ok(outcome.into())
}

/// Run the hub controller until shutdown
pub async fn run_hub_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    registry: ImageRegistryRef,
) -> Result<()> {
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let ports = HubPorts {
        modules: cluster.clone(),
        clusters: cluster.clone(),
        jobs: cluster.clone(),
        manifests: cluster.clone(),
        registry,
    };
    let job_namespace = config.hub_job_namespace.clone();
    let reconciler: HubReconciler = ReconcileDriver::new(HubHooks::new(config, ports));
    let ctx = Arc::new(Context::new(client.clone(), reconciler));

    let modules: Api<ManagedClusterModule> = Api::all(client.clone());
    modules
        .list(&Default::default())
        .await
        .map_err(|e| {
            Error::Configuration(format!("ManagedClusterModule CRD not available: {}", e))
        })?;

    info!(job_namespace = %job_namespace, "Starting ManagedClusterModule controller");
    let derived = watcher::Config::default().labels(MODULE_NAME_LABEL);
    let hub_jobs = watcher::Config::default().labels(&format!(
        "{},{}={}",
        MODULE_NAME_LABEL,
        OWNER_KIND_LABEL,
        ManagedClusterModule::kind(&())
    ));
    let controller = Controller::new(modules, watcher::Config::default());
    let store = controller.store();

    // Hub jobs and manifests live in other namespaces than their cluster-scoped
    // owner, so they map back through the module label instead of owner refs
    controller
        .watches(
            Api::<Job>::namespaced(client.clone(), &job_namespace),
            hub_jobs,
            |job: Job| hub_module_of(&job.metadata),
        )
        .watches(
            Api::<ManifestWork>::all(client.clone()),
            derived,
            |work: ManifestWork| hub_module_of(&work.metadata),
        )
        .watches(
            Api::<ManagedCluster>::all(client.clone()),
            watcher::Config::default(),
            move |cluster: ManagedCluster| {
                let labels = cluster.metadata.labels.unwrap_or_default();
                matching(&store, &labels, |module| &module.spec.selector)
            },
        )
        .shutdown_on_signal()
        .run(reconcile_hub_module, error_policy::<ManagedClusterModule, HubHooks>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, action)) => debug!(module = %object, ?action, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller event failed"),
            }
        })
        .await;

    info!("ManagedClusterModule controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_grows_and_resets() {
        let retries = RetryTracker::new(Duration::from_secs(1), Duration::from_secs(8));

        let first = retries.next_delay("drivers/kmod");
        assert!(first <= Duration::from_millis(1100));

        let mut last = first;
        for _ in 0..10 {
            last = retries.next_delay("drivers/kmod");
            assert!(last <= Duration::from_secs(9));
        }
        assert!(last > first);
        assert_eq!(retries.tracked(), 1);

        retries.reset("drivers/kmod");
        assert_eq!(retries.tracked(), 0);
        assert!(retries.next_delay("drivers/kmod") <= Duration::from_millis(1100));
    }

    #[test]
    fn test_idle_retry_entries_are_dropped() {
        let retries = RetryTracker::new(Duration::from_millis(1), Duration::from_millis(5));

        retries.next_delay("drivers/deleted");
        assert_eq!(retries.tracked(), 1);

        std::thread::sleep(Duration::from_millis(20));
        retries.next_delay("drivers/kmod");
        assert_eq!(retries.tracked(), 1);
        retries.reset("drivers/kmod");
        assert_eq!(retries.tracked(), 0);
    }

    #[test]
    fn test_node_filter_admits_label_changes_only() {
        let filter = NodeLabelFilter::new("kernel");
        let node = |labels: &[(&str, &str)]| ObjectMeta {
            name: Some("n1".into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };

        assert!(!filter.admit(&node(&[("role", "worker")])));
        assert!(filter.admit(&node(&[("kernel", "5.14.0-1")])));
        // Heartbeat with unchanged labels
        assert!(!filter.admit(&node(&[("kernel", "5.14.0-1")])));
        assert!(filter.admit(&node(&[("kernel", "5.14.0-1"), ("role", "worker")])));
        assert!(filter.admit(&node(&[("kernel", "5.15.0-2"), ("role", "worker")])));

        let mut deleting = node(&[("kernel", "5.15.0-2"), ("role", "worker")]);
        deleting.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        assert!(!filter.admit(&deleting));
    }

    #[test]
    fn test_outcome_to_action() {
        assert_eq!(Action::from(ReconcileOutcome::Done), Action::await_change());
        assert_eq!(
            Action::from(ReconcileOutcome::RequeueAfter(Duration::from_secs(30))),
            Action::requeue(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_requeue_action_follows_error_kind() {
        let retries = RetryTracker::default();

        let spec_error = Error::Template {
            field: "containerImage".into(),
            reason: "unknown placeholder".into(),
        };
        assert_eq!(requeue_action(&spec_error, "ns/a", &retries), Action::await_change());
        assert_eq!(retries.tracked(), 0);

        let duplicate = Error::DuplicateJobs {
            module: "kmod".into(),
            kernel_version: "5.14.0-1".into(),
            stage: "build".into(),
            count: 2,
        };
        assert_eq!(
            requeue_action(&duplicate, "ns/a", &retries),
            Action::requeue(Duration::from_secs(30))
        );

        let outage = Error::StoreUnavailable("apiserver".into());
        let _ = requeue_action(&outage, "ns/a", &retries);
        assert_eq!(retries.tracked(), 1);
    }

    #[test]
    fn test_finalizer_errors_unwrap() {
        let err = finalizer_error(FinalizerError::ApplyFailed(Error::Internal("boom".into())));
        assert!(matches!(err, Error::Internal(msg) if msg == "boom"));

        let err = finalizer_error(FinalizerError::<Error>::UnnamedObject);
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_hub_module_from_label() {
        let meta = ObjectMeta {
            labels: Some(crate::labels::module_selector("kmod")),
            ..Default::default()
        };
        assert_eq!(hub_module_of(&meta), Some(ObjectRef::new("kmod")));
        assert_eq!(hub_module_of(&ObjectMeta::default()), None);
    }
}
