//! The cache dispatcher: a single worker that answers requests from the
//! disk cache when it can, and forwards the rest to the network stage.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use tern_cache::epoch_millis;

use crate::panic_message;
use crate::queue::{CacheJob, QueueCore};
use crate::request::TrackedRequest;
use crate::response::{NetworkResponse, Outcome};

/// Drain the cache queue until it is closed. The cache is initialized here,
/// before the first lookup, so every dispatch observes a scanned index.
pub(crate) fn run(core: &Arc<QueueCore>) {
    debug!("Cache dispatcher starting");
    if let Err(err) = core.cache.lock().initialize() {
        warn!("Failed to initialize the disk cache: {err}");
    }

    while let Some(job) = core.cache_queue.take() {
        // A fault in one request (a panicking parser, say) must not take the
        // whole stage down.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| process(core, job))) {
            warn!(
                "Cache dispatcher survived a panic: {}",
                panic_message(&payload)
            );
        }
    }
    debug!("Cache dispatcher exiting");
}

fn process(core: &Arc<QueueCore>, job: CacheJob) {
    match job {
        CacheJob::Clear { callback, .. } => {
            core.cache.lock().clear();
            core.delivery.execute(callback);
        }
        CacheJob::Request(ranked) => process_request(core, ranked.0),
    }
}

fn process_request(core: &Arc<QueueCore>, request: Arc<TrackedRequest>) {
    if request.is_canceled() {
        request.finish("cache-discard-canceled");
        return;
    }

    let entry = core.cache.lock().get(request.cache_key());
    let Some(entry) = entry else {
        debug!(key = request.cache_key(), "Cache miss");
        core.enqueue_network(request);
        return;
    };

    let now = epoch_millis();
    if entry.is_expired_at(now) {
        // Unusable as-is, but its validators make the network attempt
        // conditional.
        debug!(key = request.cache_key(), "Cache hit, fully expired");
        request.set_cache_entry(entry);
        core.enqueue_network(request);
        return;
    }

    // Parse the stored body as if it had just arrived over the wire.
    let synthetic = NetworkResponse::from_cache(&entry);
    let parsed = match request.parse(&synthetic) {
        Ok(parsed) => parsed,
        Err(error) => {
            core.delivery.post_error(request, error);
            return;
        }
    };

    if !entry.refresh_needed_at(now) {
        debug!(key = request.cache_key(), "Cache hit");
        core.delivery.post_response(
            request,
            Outcome::Success {
                value: parsed.value,
                intermediate: false,
            },
            None,
        );
        return;
    }

    // Past the soft TTL: serve the cached copy immediately, and schedule the
    // refresh to run right after the intermediate delivery completes.
    debug!(key = request.cache_key(), "Cache hit, refresh needed");
    request.set_cache_entry(entry);
    let weak_core = Arc::downgrade(core);
    let refresh_target = request.clone();
    core.delivery.post_response(
        request,
        Outcome::Success {
            value: parsed.value,
            intermediate: true,
        },
        Some(Box::new(move || {
            if let Some(core) = weak_core.upgrade() {
                core.enqueue_network(refresh_target);
            }
        })),
    );
}
