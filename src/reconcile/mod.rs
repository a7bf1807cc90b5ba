//! Reconciliation passes
//!
//! ```text
//! ┌────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │  selector  │──▶│ pipeline (per kernel)│──▶│      projector      │
//! │ nodes/     │   │ build ─▶ sign        │   │ workloads, node     │
//! │ clusters   │   └─────────────────────┘   │ entries, manifests  │
//! └────────────┘                             └──────────┬──────────┘
//!                                                       ▼
//!                                  ┌────────────────────────────────┐
//!                                  │ status ─▶ gc ─▶ requeue?        │
//!                                  └────────────────────────────────┘
//! ```
//!
//! [`driver`] runs the sequence; [`module`] and [`hub`] plug in the spoke and
//! hub behavior.

pub mod driver;
pub mod gc;
pub mod hub;
pub mod module;
pub mod projector;
pub mod selector;
pub mod status;

pub use driver::{ReconcileDriver, ReconcileHooks, ReconcileOutcome};
pub use gc::{GarbageCollector, GcReport, GcScope};
pub use hub::{HubHooks, HubPorts, HubReconciler};
pub use module::{ModuleHooks, ModulePorts, ModuleReconciler};
pub use projector::{DesiredStateProjector, Projection};
pub use selector::{NodeModuleSelector, Selection};
