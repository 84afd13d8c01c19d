//! A client-side HTTP request pipeline.
//!
//! Callers enqueue typed [`Request`]s onto a [`RequestQueue`]; the pipeline
//! answers them from a disk-backed LRU cache when it can, coalesces
//! identical in-flight requests, drives the rest through a worker pool with
//! retry/backoff and redirect handling, and delivers parsed results (or
//! errors) through listener callbacks in a deterministic order on a
//! designated executor.
//!
//! ```no_run
//! use tern_client::{RequestQueueBuilder, StringRequest};
//!
//! let queue = RequestQueueBuilder::new("/tmp/http-cache").build();
//! queue.start();
//! queue.add(StringRequest::get(
//!     "http://example.com/greeting",
//!     |body| println!("got: {body}"),
//!     |err| eprintln!("failed: {err}"),
//! ));
//! ```

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

pub use tern_cache::{epoch_millis, CacheEntry, DiskCache};

pub use crate::delivery::{Executor, SingleThreadExecutor};
pub use crate::error::{Error, ErrorKind};
pub use crate::headers::entry_from_response;
pub use crate::pool::BufferPool;
pub use crate::queue::{ListenerToken, RequestQueue};
pub use crate::request::{
    JsonRequest, Method, Priority, Request, RequestHandle, StringRequest,
};
pub use crate::response::{NetworkResponse, Parsed};
pub use crate::retry::RetryPolicy;
pub use crate::transport::{
    HttpExchange, Transport, TransportError, TransportRequest, UreqTransport,
};

mod cache_stage;
mod delivery;
mod error;
mod headers;
mod network;
mod pool;
mod queue;
mod request;
mod response;
mod retry;
mod transport;

/// Bytes the default transport's buffer pool retains.
const DEFAULT_POOL_BYTES: usize = 4_096;

/// Network workers spawned by default.
const DEFAULT_NETWORK_THREADS: usize = 4;

/// Builder for a [`RequestQueue`].
#[must_use]
pub struct RequestQueueBuilder {
    cache_dir: PathBuf,
    max_cache_bytes: Option<u64>,
    network_threads: usize,
    transport: Option<Arc<dyn Transport>>,
    executor: Option<Arc<dyn Executor>>,
}

impl RequestQueueBuilder {
    /// A queue whose disk cache lives under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_bytes: None,
            network_threads: DEFAULT_NETWORK_THREADS,
            transport: None,
            executor: None,
        }
    }

    /// Cap the disk cache; unbounded when not set.
    pub fn max_cache_bytes(mut self, max_cache_bytes: u64) -> Self {
        self.max_cache_bytes = Some(max_cache_bytes);
        self
    }

    /// Size of the network worker pool.
    pub fn network_threads(mut self, network_threads: usize) -> Self {
        self.network_threads = network_threads.max(1);
        self
    }

    /// Replace the default `ureq` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the default single-thread delivery executor.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> RequestQueue {
        let cache = match self.max_cache_bytes {
            Some(max) => DiskCache::new(&self.cache_dir, max),
            None => DiskCache::unbounded(&self.cache_dir),
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(UreqTransport::new(Arc::new(BufferPool::new(
                DEFAULT_POOL_BYTES,
            ))))
        });
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SingleThreadExecutor::new()));
        RequestQueue::from_parts(cache, transport, executor, self.network_threads)
    }
}

/// Best-effort text of a panic payload, for dispatcher logs.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
