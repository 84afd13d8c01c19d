use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::trace;

use crate::error::Error;
use crate::request::TrackedRequest;
use crate::response::Outcome;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Where delivery tasks run — the stand-in for the caller's "main thread".
///
/// Implementations must run submitted jobs in submission order, one at a
/// time; the pipeline's ordering guarantees (intermediate before final,
/// response before finish) rest on that.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// The default executor: one dedicated thread draining a channel in order.
pub struct SingleThreadExecutor {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SingleThreadExecutor {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("tern-delivery".to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("failed to spawn the delivery thread");
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }
}

impl Default for SingleThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SingleThreadExecutor {
    fn execute(&self, job: Job) {
        if let Some(sender) = &self.sender {
            // A send can only fail after the thread is gone, i.e. mid-drop.
            let _ = sender.send(job);
        }
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain pending deliveries and
        // exit.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Posts responses and errors onto the delivery executor, with the
/// cancellation and finish bookkeeping both stages share.
pub(crate) struct ResponseDelivery {
    executor: Arc<dyn Executor>,
}

impl ResponseDelivery {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Deliver a parsed response. `after` runs once the delivery task is
    /// done — the cache stage uses it to schedule the refresh that follows
    /// an intermediate response.
    pub(crate) fn post_response(
        &self,
        request: Arc<TrackedRequest>,
        outcome: Outcome,
        after: Option<Job>,
    ) {
        request.mark_delivered();
        trace!(request = %request.identifier(), "post-response");
        self.executor
            .execute(Box::new(move || run_delivery(&request, outcome, after)));
    }

    pub(crate) fn post_error(&self, request: Arc<TrackedRequest>, error: Error) {
        trace!(request = %request.identifier(), "post-error");
        self.executor
            .execute(Box::new(move || run_delivery(&request, Outcome::Failure(error), None)));
    }

    /// Run an arbitrary job on the executor, behind all pending deliveries.
    pub(crate) fn execute(&self, job: Job) {
        self.executor.execute(job);
    }
}

/// The delivery task: the last cancellation checkpoint, and the only place
/// listeners are invoked.
fn run_delivery(request: &Arc<TrackedRequest>, outcome: Outcome, after: Option<Job>) {
    if request.is_canceled() {
        request.clone().finish("canceled-at-delivery");
        return;
    }

    match outcome {
        Outcome::Success { value, intermediate } => {
            request.deliver_value(value);
            if intermediate {
                trace!(request = %request.identifier(), "intermediate-response");
            } else {
                request.clone().finish("done");
            }
        }
        Outcome::Failure(error) => {
            request.deliver_error(error);
            request.clone().finish("done");
        }
    }

    if let Some(job) = after {
        job();
    }
}
