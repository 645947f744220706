use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use log::{debug, trace, warn};

use conform_catalog::{Resource, ResourceId};

use crate::applier::ApplyContext;
use crate::graph::{Graph, Outcome};
use crate::report::{ApplyError, ApplyReport, FailureReport, ResourceFailure};
use crate::worker::worker_loop;

/// A unit of work handed to a worker.
pub(crate) struct Job {
    /// The resource to apply.
    pub resource: Resource,
    /// Whether any dependency of the resource reported a host mutation.
    pub deps_changed: bool,
}

/// What a worker reports back for a job.
pub(crate) struct Completion {
    /// Id of the applied resource.
    pub id: ResourceId,
    /// Whether the host was mutated, or why the resource failed.
    pub result: Result<bool, ResourceFailure>,
}

/// Drives the graph to completion under the worker concurrency bound.
///
/// Dispatch and completion are two queues: jobs out, completions in. The
/// workers are symmetric consumers of the jobs queue; the graph lives with
/// the scheduler and nobody else ever touches it.
pub(crate) struct Scheduler {
    graph: Graph,
    ctx: Arc<ApplyContext>,
    jobs: usize,
}

impl Scheduler {
    /// Make a scheduler running at most `jobs` appliers at a time.
    pub fn new(graph: Graph, ctx: Arc<ApplyContext>, jobs: usize) -> Scheduler {
        Scheduler {
            graph,
            ctx,
            jobs: jobs.max(1),
        }
    }

    /// Run the graph to completion and aggregate the outcome.
    pub fn run(mut self) -> Result<ApplyReport, ApplyError> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (completion_tx, completion_rx) = unbounded::<Completion>();

        let mut workers = Vec::with_capacity(self.jobs);
        for i in 0..self.jobs {
            let job_rx = job_rx.clone();
            let completion_tx = completion_tx.clone();
            let ctx = self.ctx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("Worker {}", i))
                    .spawn(move || worker_loop(job_rx, completion_tx, ctx))
                    .expect("Failed to spawn worker thread"),
            );
        }
        // the scheduler keeps only its own ends of the two queues
        drop(job_rx);
        drop(completion_tx);

        let mut in_flight = 0usize;
        let mut report = ApplyReport::default();
        let mut failures: Vec<ResourceFailure> = Vec::new();
        let mut stalled = None;
        loop {
            if self.ctx.cancel.is_cancelled() {
                debug!("cancellation observed, not dispatching further work");
                break;
            }
            for id in self.graph.take_ready() {
                let resource = self.graph.resource(id).clone();
                let deps_changed = self.graph.deps_changed(id);
                trace!("dispatching resource {} ({})", id, resource.comment);
                job_tx
                    .send(Job {
                        resource,
                        deps_changed,
                    })
                    .expect("The workers are gone");
                in_flight += 1;
            }
            if in_flight == 0 {
                if self.graph.is_done() {
                    break;
                }
                // nothing runnable, nothing running, work remaining: a bug
                stalled = Some(self.graph.pending());
                break;
            }
            let completion = completion_rx
                .recv()
                .expect("All the workers exited with jobs in flight");
            in_flight -= 1;
            record(&mut self.graph, &mut report, &mut failures, completion);
        }

        // wind down: close the jobs queue and account for everything still
        // in flight (workers bail out quickly once the cancellation trips)
        drop(job_tx);
        while in_flight > 0 {
            let completion = completion_rx
                .recv()
                .expect("All the workers exited with jobs in flight");
            in_flight -= 1;
            record(&mut self.graph, &mut report, &mut failures, completion);
        }
        for worker in workers {
            worker.join().expect("Worker panicked");
        }

        if let Some(pending) = stalled {
            return Err(ApplyError::Stalled { pending });
        }
        let cancelled = self.ctx.cancel.is_cancelled();
        // failures that are only the cancellation surfacing are not resource
        // problems, the cancellation marker covers them
        failures.retain(|failure| !failure.is_cancelled());
        if !failures.is_empty() || cancelled {
            return Err(ApplyError::Failed(FailureReport {
                failures,
                skipped: self.graph.skipped(),
                cancelled,
            }));
        }
        Ok(report)
    }
}

fn record(
    graph: &mut Graph,
    report: &mut ApplyReport,
    failures: &mut Vec<ResourceFailure>,
    completion: Completion,
) {
    match completion.result {
        Ok(changed) => {
            trace!("resource {} done, changed: {}", completion.id, changed);
            if changed {
                report.changed += 1;
            } else {
                report.unchanged += 1;
            }
            graph.mark(completion.id, Outcome::Success { changed });
        }
        Err(failure) => {
            warn!("{}", failure);
            graph.mark(completion.id, Outcome::Failure);
            failures.push(failure);
        }
    }
}
