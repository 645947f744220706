//! The per-kind resource appliers: reconcile observed host state to the
//! declared one through the system interface.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use conform_catalog::ResourceBody;
use conform_sys::{CancelToken, OwnerResolver, System};

use crate::scheduler::Job;

mod exec;
mod file;

/// State shared by every worker of one apply run.
pub(crate) struct ApplyContext {
    /// The host the appliers act on.
    pub system: Arc<dyn System>,
    /// Shell interpreter used for script-form exec resources.
    pub shell: PathBuf,
    /// User/group resolution caches, populated lazily.
    pub owners: OwnerResolver,
    /// The ambient cancellation signal.
    pub cancel: CancelToken,
}

/// A command that ran and exited unsuccessfully. The captured combined
/// output rides along for the final report.
#[derive(Debug)]
pub(crate) struct CommandFailed {
    /// Exit status, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
}

impl fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "command exited with status {}", status),
            None => write!(f, "command was killed by a signal"),
        }
    }
}

impl std::error::Error for CommandFailed {}

/// Apply one resource, returning whether the host was mutated.
pub(crate) fn apply_resource(job: &Job, ctx: &ApplyContext) -> Result<bool> {
    match &job.resource.body {
        ResourceBody::Noop => Ok(false),
        ResourceBody::File(file) => file::apply_file(file, ctx),
        ResourceBody::Exec(exec) => exec::apply_exec(exec, job.deps_changed, ctx),
    }
}
