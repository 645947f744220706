use std::fmt;

use thiserror::Error;

use conform_catalog::{Resource, ResourceId};
use conform_sys::SysError;

use crate::applier::CommandFailed;
use crate::graph::CatalogError;

/// Outcome of a run where every resource converged.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Resources that completed and mutated the host.
    pub changed: usize,
    /// Resources that completed without touching anything (already converged
    /// resources, no-ops and condition-skipped commands).
    pub unchanged: usize,
}

impl ApplyReport {
    /// Total number of resources that completed.
    pub fn total(&self) -> usize {
        self.changed + self.unchanged
    }
}

/// A resource that failed to apply.
#[derive(Debug)]
pub struct ResourceFailure {
    /// Id of the failed resource.
    pub id: ResourceId,
    /// Its diagnostic comment.
    pub comment: String,
    /// What went wrong.
    pub error: anyhow::Error,
}

impl ResourceFailure {
    pub(crate) fn new(resource: &Resource, error: anyhow::Error) -> ResourceFailure {
        ResourceFailure {
            id: resource.id,
            comment: resource.comment.clone(),
            error,
        }
    }

    /// Whether this failure is only the cancellation signal surfacing, not a
    /// problem with the resource itself.
    pub fn is_cancelled(&self) -> bool {
        self.error
            .chain()
            .any(|e| e.downcast_ref::<SysError>().is_some_and(SysError::is_cancelled))
    }
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // single line with the whole cause chain, then any captured command
        // output verbatim
        write!(f, "resource {} ({}): {:#}", self.id, self.comment, self.error)?;
        if let Some(failed) = self.error.downcast_ref::<CommandFailed>() {
            if !failed.output.is_empty() {
                write!(f, "\n{}", String::from_utf8_lossy(&failed.output))?;
            }
        }
        Ok(())
    }
}

/// The composite error of a run where some resources failed or the run was
/// interrupted: every per-resource failure, the resources skipped because of
/// them, and the cancellation marker.
#[derive(Debug, Default)]
pub struct FailureReport {
    /// The failed resources, in completion order.
    pub failures: Vec<ResourceFailure>,
    /// Resources not applied because an ancestor failed.
    pub skipped: Vec<ResourceId>,
    /// Whether the run was interrupted by the cancellation signal.
    pub cancelled: bool,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut lines: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        if !self.skipped.is_empty() {
            lines.push(format!(
                "{} dependent resources were skipped",
                self.skipped.len()
            ));
        }
        if self.cancelled {
            lines.push("the run was interrupted before completing".to_owned());
        }
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for FailureReport {}

/// Everything that can go wrong in [`apply`](crate::apply).
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The catalog is structurally invalid; nothing was applied.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// One or more resources failed, or the run was cancelled.
    #[error(transparent)]
    Failed(#[from] FailureReport),
    /// The graph has no runnable resource but work remains: a bug in the
    /// scheduler, not in the catalog.
    #[error("scheduler stalled with {pending} resources outstanding, this is a bug")]
    Stalled {
        /// Number of resources left behind.
        pending: usize,
    },
}
