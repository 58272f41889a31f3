//! A single background thread that runs enqueued closures in order.

use std::thread;

use crossbeam_channel::{unbounded, Sender};

type Job<'scope> = Box<dyn FnOnce() + Send + 'scope>;

/// A worker thread scoped to a [`std::thread::Scope`].
///
/// Jobs run strictly in the order they were enqueued. Dropping the worker
/// closes the queue; the thread finishes the remaining jobs and exits before
/// the owning scope joins.
pub struct Worker<'scope> {
    jobs: Sender<Job<'scope>>,
}

impl<'scope> Worker<'scope> {
    pub fn new<'env>(scope: &'scope thread::Scope<'scope, 'env>) -> Self {
        let (jobs, queue) = unbounded::<Job<'scope>>();
        scope.spawn(move || {
            for job in queue {
                job();
            }
        });
        Self { jobs }
    }

    /// Enqueue a job and return immediately.
    pub fn run(&self, job: impl FnOnce() + Send + 'scope) {
        // Send only fails if the thread is gone, which only happens once the
        // scope is unwinding; the job can be discarded then.
        let _ = self.jobs.send(Box::new(job));
    }
}
