//! Applies a catalog to a host.
//!
//! The applier turns a decoded [`Catalog`] into a dependency graph, then
//! drives that graph to completion under a worker concurrency bound,
//! reconciling each resource against the host through a
//! [`System`](conform_sys::System) implementation.
//!
//! The components, and how data flows between them:
//!
//! - `Graph` owns the per-resource bookkeeping: outstanding-dependency
//!   counts, reverse edges, readiness and terminal states. It validates the
//!   catalog structure (unique ids, no dangling dependencies, no cycles)
//!   before anything touches the host.
//! - `Scheduler` is the only holder of the graph. It drains ready resources
//!   into a jobs queue, waits for completions, marks the graph and thereby
//!   unlocks successors. A failed resource skips its transitive descendants;
//!   independent branches keep going.
//! - Workers are symmetric consumers of the jobs queue, one OS thread each.
//!   A worker runs the applier matching the resource kind and reports back
//!   whether the host was mutated.
//! - The appliers perform the actual reconciliation through the system
//!   interface, so a dry run only has to swap the interface implementation.
//!
//! The dependency contract is strict: if `B` depends on `A`, every side
//! effect of applying `A` is observable before `B` starts, because the graph
//! is marked strictly before successors are dispatched. No ordering exists
//! between independent resources. With one worker the execution follows a
//! deterministic topological order, ties broken by ascending resource id.

#![deny(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use conform_catalog::Catalog;
use conform_sys::{CancelToken, OwnerResolver, System};

mod applier;
mod graph;
mod report;
mod scheduler;
mod worker;

pub use graph::CatalogError;
pub use report::{ApplyError, ApplyReport, FailureReport, ResourceFailure};

use applier::ApplyContext;
use graph::Graph;
use scheduler::Scheduler;

/// Configuration of one apply run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of resources applied concurrently.
    pub jobs: usize,
    /// Shell interpreter used for script-form exec resources.
    pub shell: PathBuf,
}

impl Default for ApplyOptions {
    fn default() -> ApplyOptions {
        ApplyOptions {
            jobs: 1,
            shell: "/bin/bash".into(),
        }
    }
}

/// Apply a catalog to the host behind `system`.
///
/// The catalog structure is validated first; a structural error means
/// nothing was applied. Resource failures do not stop independent branches:
/// everything that can still run does, and the composite
/// [`FailureReport`] lists every failure at the end. Tripping `cancel` stops
/// the dispatch of new work and interrupts in-flight system operations.
pub fn apply(
    catalog: &Catalog,
    system: Arc<dyn System>,
    options: &ApplyOptions,
    cancel: CancelToken,
) -> Result<ApplyReport, ApplyError> {
    let graph = Graph::build(catalog)?;
    info!(
        "applying {} resources with {} workers",
        catalog.len(),
        options.jobs.max(1)
    );
    let ctx = Arc::new(ApplyContext {
        system,
        shell: options.shell.clone(),
        owners: OwnerResolver::new(),
        cancel,
    });
    Scheduler::new(graph, ctx, options.jobs).run()
}
