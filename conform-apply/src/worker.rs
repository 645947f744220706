use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::trace;

use conform_sys::SysError;

use crate::applier::{apply_resource, ApplyContext};
use crate::report::ResourceFailure;
use crate::scheduler::{Completion, Job};

/// Body of a worker thread: consume jobs until the queue closes and report a
/// completion for each one.
///
/// Workers never see the graph; everything they need rides on the [`Job`].
pub(crate) fn worker_loop(
    jobs: Receiver<Job>,
    completions: Sender<Completion>,
    ctx: Arc<ApplyContext>,
) {
    while let Ok(job) = jobs.recv() {
        let id = job.resource.id;
        trace!("applying resource {} ({})", id, job.resource.comment);
        let result = if ctx.cancel.is_cancelled() {
            // a job drained after cancellation is not applied at all
            Err(ResourceFailure::new(
                &job.resource,
                SysError::Cancelled.into(),
            ))
        } else {
            apply_resource(&job, &ctx).map_err(|e| ResourceFailure::new(&job.resource, e))
        };
        if completions.send(Completion { id, result }).is_err() {
            // the scheduler is gone
            break;
        }
    }
}
