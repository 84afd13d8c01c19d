use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use tern_cache::DiskCache;

use crate::cache_stage;
use crate::delivery::{Executor, Job, ResponseDelivery};
use crate::network;
use crate::request::{Priority, Request, RequestHandle, TrackedRequest, TypedRequest};
use crate::transport::Transport;

/// A blocking queue ordered by priority (descending), then admission
/// sequence (ascending). Closing wakes all blocked takers, which is how the
/// dispatchers are told to quit.
pub(crate) struct BlockingPriorityQueue<T: Ord> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    heap: BinaryHeap<T>,
    closed: bool,
}

impl<T: Ord> BlockingPriorityQueue<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.state.lock().heap.push(item);
        self.available.notify_one();
    }

    /// Block until an item is available, or `None` once the queue is closed.
    /// A closed queue yields nothing even if items remain, matching the
    /// interrupt-on-stop dispatcher contract.
    pub(crate) fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.heap.pop() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    fn open(&self) {
        self.state.lock().closed = false;
    }
}

/// Heap ordering for requests: max-heap on `(priority, Reverse(sequence))`,
/// i.e. highest priority first, FIFO within a priority.
pub(crate) struct Ranked(pub(crate) Arc<TrackedRequest>);

impl Ranked {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.0.priority(), Reverse(self.0.sequence()))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// Work items for the cache dispatcher.
pub(crate) enum CacheJob {
    Request(Ranked),
    /// Administrative: wipe the cache on the cache-stage thread, then run
    /// the callback on the delivery executor.
    Clear { sequence: u64, callback: Job },
}

impl CacheJob {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        match self {
            Self::Request(ranked) => ranked.rank(),
            Self::Clear { sequence, .. } => (Priority::Immediate, Reverse(*sequence)),
        }
    }
}

impl PartialEq for CacheJob {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for CacheJob {}

impl PartialOrd for CacheJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

type FinishedListener = Arc<dyn Fn(&RequestHandle) + Send + Sync>;

/// Identifies a finished-listener registration for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

/// Shared state of one queue: everything the dispatcher threads, the
/// delivery tasks, and the public handle reach for.
pub(crate) struct QueueCore {
    sequence: AtomicU64,
    pub(crate) cache: Mutex<DiskCache>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delivery: ResponseDelivery,
    pub(crate) cache_queue: BlockingPriorityQueue<CacheJob>,
    pub(crate) network_queue: BlockingPriorityQueue<Ranked>,
    /// Every admitted, unfinished request, by identifier.
    current: Mutex<FxHashMap<String, Arc<TrackedRequest>>>,
    /// Cache keys with an in-flight request. `None` means "in flight, no
    /// followers yet"; `Some` queues the duplicates waiting on the primary.
    waiting: Mutex<FxHashMap<String, Option<VecDeque<Arc<TrackedRequest>>>>>,
    listeners: Mutex<Vec<(u64, FinishedListener)>>,
    next_listener: AtomicU64,
}

impl QueueCore {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn enqueue_network(&self, request: Arc<TrackedRequest>) {
        self.network_queue.push(Ranked(request));
    }

    pub(crate) fn enqueue_cache(&self, request: Arc<TrackedRequest>) {
        self.cache_queue.push(CacheJob::Request(Ranked(request)));
    }

    /// Admit a bound request: number it and route it to the right stage —
    /// or park it behind an identical in-flight request.
    pub(crate) fn admit(&self, request: Arc<TrackedRequest>) {
        self.current
            .lock()
            .insert(request.identifier().to_owned(), request.clone());
        request.assign_sequence(self.next_sequence());
        trace!(
            request = %request.identifier(),
            url = request.origin_url(),
            sequence = request.sequence(),
            "Admitted request"
        );

        if !request.should_cache() {
            self.enqueue_network(request);
            return;
        }

        let mut waiting = self.waiting.lock();
        let key = request.cache_key().to_owned();
        if let Some(slot) = waiting.get_mut(&key) {
            debug!("Request for {key} is already in flight; parking a duplicate");
            slot.get_or_insert_with(VecDeque::new).push_back(request);
        } else {
            waiting.insert(key, None);
            drop(waiting);
            self.enqueue_cache(request);
        }
    }

    /// Terminal bookkeeping, called exactly once per request via
    /// `TrackedRequest::finish`: drop it from the tracking set, notify
    /// listeners, and release any coalesced waiters back onto the cache
    /// stage, where they can pick up the entry the primary just stored.
    pub(crate) fn finish(&self, request: &Arc<TrackedRequest>) {
        self.current.lock().remove(request.identifier());

        let listeners: Vec<FinishedListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if !listeners.is_empty() {
            let handle = RequestHandle {
                inner: request.clone(),
            };
            for listener in listeners {
                listener(&handle);
            }
        }

        if request.should_cache() {
            let drained = self.waiting.lock().remove(request.cache_key());
            if let Some(Some(waiters)) = drained {
                debug!(
                    "Releasing {} requests waiting on {}",
                    waiters.len(),
                    request.cache_key()
                );
                for waiter in waiters {
                    self.enqueue_cache(waiter);
                }
            }
        }
    }

    fn cancel_all(&self, predicate: impl Fn(&RequestHandle) -> bool) {
        // Snapshot first: the predicate is user code and must not run under
        // the tracking lock.
        let requests: Vec<Arc<TrackedRequest>> = self.current.lock().values().cloned().collect();
        for request in requests {
            let handle = RequestHandle { inner: request };
            if predicate(&handle) {
                handle.inner.cancel();
            }
        }
    }

    fn add_listener(&self, listener: FinishedListener) -> ListenerToken {
        let token = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((token, listener));
        ListenerToken(token)
    }

    fn remove_listener(&self, token: ListenerToken) {
        self.listeners.lock().retain(|(id, _)| *id != token.0);
    }
}

/// The request pipeline: admission, scheduling, the cache and network
/// dispatchers, and delivery.
///
/// Construct one through [`crate::RequestQueueBuilder`], then [`start`] it.
///
/// [`start`]: RequestQueue::start
pub struct RequestQueue {
    core: Arc<QueueCore>,
    network_threads: usize,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestQueue {
    pub(crate) fn from_parts(
        cache: DiskCache,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        network_threads: usize,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                sequence: AtomicU64::new(0),
                cache: Mutex::new(cache),
                transport,
                delivery: ResponseDelivery::new(executor),
                cache_queue: BlockingPriorityQueue::new(),
                network_queue: BlockingPriorityQueue::new(),
                current: Mutex::new(FxHashMap::default()),
                waiting: Mutex::new(FxHashMap::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
            network_threads,
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    /// Admit a request. The returned handle outlives the request's
    /// lifecycle and can cancel it at any point.
    pub fn add<R: Request>(&self, request: R) -> RequestHandle {
        let tracked = Arc::new(TrackedRequest::new(Box::new(TypedRequest(request))));
        tracked.bind(Arc::downgrade(&self.core));
        self.core.admit(tracked.clone());
        RequestHandle { inner: tracked }
    }

    /// Spawn the dispatchers: one cache worker and the configured number of
    /// network workers. Stops any previously running dispatchers first.
    pub fn start(&self) {
        self.stop();
        self.core.cache_queue.open();
        self.core.network_queue.open();

        let mut dispatchers = self.dispatchers.lock();
        let core = self.core.clone();
        dispatchers.push(
            thread::Builder::new()
                .name("tern-cache-dispatcher".to_string())
                .spawn(move || cache_stage::run(&core))
                .expect("failed to spawn the cache dispatcher"),
        );
        for index in 0..self.network_threads {
            let core = self.core.clone();
            dispatchers.push(
                thread::Builder::new()
                    .name(format!("tern-network-dispatcher-{index}"))
                    .spawn(move || network::run(&core))
                    .expect("failed to spawn a network dispatcher"),
            );
        }
        debug!(network_threads = self.network_threads, "Request queue started");
    }

    /// Close the stage queues and join the dispatchers. Idempotent. Pending
    /// deliveries still drain through the delivery executor.
    pub fn stop(&self) {
        self.core.cache_queue.close();
        self.core.network_queue.close();
        let handles: Vec<JoinHandle<()>> = self.dispatchers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Cancel every tracked request the predicate matches.
    pub fn cancel_all(&self, predicate: impl Fn(&RequestHandle) -> bool) {
        self.core.cancel_all(predicate);
    }

    /// Cancel every tracked request carrying this tag.
    pub fn cancel_all_with_tag(&self, tag: &str) {
        self.cancel_all(|request| request.tag() == Some(tag));
    }

    /// Register a listener invoked once per request, when it finishes.
    pub fn add_finished_listener(
        &self,
        listener: impl Fn(&RequestHandle) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.core.add_listener(Arc::new(listener))
    }

    pub fn remove_finished_listener(&self, token: ListenerToken) {
        self.core.remove_listener(token);
    }

    /// Wipe the disk cache from the cache-stage thread, ahead of all queued
    /// lookups; the callback is posted to the delivery executor afterwards.
    pub fn clear_cache(&self, callback: impl FnOnce() + Send + 'static) {
        let sequence = self.core.next_sequence();
        self.core.cache_queue.push(CacheJob::Clear {
            sequence,
            callback: Box::new(callback),
        });
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::StringRequest;

    fn tracked(url: &str, priority: Priority, sequence: u64) -> Ranked {
        let request = Arc::new(TrackedRequest::new(Box::new(TypedRequest(
            StringRequest::get(url, |_| {}, |_| {}).with_priority(priority),
        ))));
        request.assign_sequence(sequence);
        Ranked(request)
    }

    #[test]
    fn heap_orders_by_priority_then_fifo() {
        let queue = BlockingPriorityQueue::new();
        queue.push(tracked("http://example.com/1", Priority::Normal, 1));
        queue.push(tracked("http://example.com/2", Priority::Low, 0));
        queue.push(tracked("http://example.com/3", Priority::High, 3));
        queue.push(tracked("http://example.com/4", Priority::Normal, 2));

        assert_eq!(queue.take().unwrap().0.sequence(), 3); // High
        assert_eq!(queue.take().unwrap().0.sequence(), 1); // Normal, earlier
        assert_eq!(queue.take().unwrap().0.sequence(), 2); // Normal, later
        assert_eq!(queue.take().unwrap().0.sequence(), 0); // Low
    }

    #[test]
    fn closed_queue_wakes_takers_and_yields_nothing() {
        let queue: BlockingPriorityQueue<Ranked> = BlockingPriorityQueue::new();
        queue.push(tracked("http://example.com/1", Priority::Normal, 0));
        queue.close();
        assert!(queue.take().is_none());
    }

    #[test]
    fn clear_jobs_outrank_requests() {
        let request = CacheJob::Request(tracked("http://example.com/1", Priority::High, 0));
        let clear = CacheJob::Clear {
            sequence: 5,
            callback: Box::new(|| {}),
        };
        assert!(clear > request);
    }
}
