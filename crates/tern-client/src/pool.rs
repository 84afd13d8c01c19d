use std::collections::VecDeque;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// A pool of reusable byte buffers, used to amortize allocation while
/// response bodies are assembled.
///
/// Buffers are handed out smallest-sufficient-first and trimmed
/// oldest-released-first once the pooled total exceeds the limit. The pool
/// accepts foreign buffers on release; returned buffers are not zeroed.
pub struct BufferPool {
    state: Mutex<PoolState>,
    size_limit: usize,
}

#[derive(Default)]
struct PoolState {
    /// `(buffer length, ticket)`, sorted by length.
    by_size: Vec<(usize, u64)>,
    /// Tickets in release order, oldest first.
    by_last_use: VecDeque<u64>,
    /// Ticket to buffer. Both orderings index into this map.
    buffers: FxHashMap<u64, Vec<u8>>,
    total_bytes: usize,
    next_ticket: u64,
}

impl BufferPool {
    /// A pool that retains at most `size_limit` bytes across all buffers.
    pub fn new(size_limit: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            size_limit,
        }
    }

    /// The smallest pooled buffer of at least `min_len` bytes, or a fresh
    /// buffer of exactly `min_len` if none qualifies.
    pub fn acquire(&self, min_len: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        let index = state.by_size.partition_point(|&(len, _)| len < min_len);
        if index < state.by_size.len() {
            let (len, ticket) = state.by_size.remove(index);
            state.by_last_use.retain(|&t| t != ticket);
            let buffer = state
                .buffers
                .remove(&ticket)
                .expect("pool orderings out of sync");
            state.total_bytes -= len;
            return buffer;
        }
        vec![0; min_len]
    }

    /// Return a buffer to the pool. Oversized buffers are dropped outright;
    /// otherwise the oldest pooled buffers are discarded until the total
    /// fits the limit again.
    pub fn release(&self, buffer: Vec<u8>) {
        let len = buffer.len();
        if len > self.size_limit {
            return;
        }

        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let index = state.by_size.partition_point(|&(l, _)| l < len);
        state.by_size.insert(index, (len, ticket));
        state.by_last_use.push_back(ticket);
        state.buffers.insert(ticket, buffer);
        state.total_bytes += len;

        while state.total_bytes > self.size_limit {
            let Some(oldest) = state.by_last_use.pop_front() else {
                break;
            };
            let buffer = state
                .buffers
                .remove(&oldest)
                .expect("pool orderings out of sync");
            state.by_size.retain(|&(_, t)| t != oldest);
            state.total_bytes -= buffer.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(pool: &BufferPool) {
        let state = pool.state.lock();
        assert_eq!(state.by_size.len(), state.buffers.len());
        assert_eq!(state.by_last_use.len(), state.buffers.len());
        let sum: usize = state.buffers.values().map(Vec::len).sum();
        assert_eq!(state.total_bytes, sum);
        assert!(state.by_size.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn acquire_prefers_smallest_sufficient_buffer() {
        let pool = BufferPool::new(4096);
        pool.release(vec![1; 100]);
        pool.release(vec![2; 300]);
        pool.release(vec![3; 200]);

        let buffer = pool.acquire(150);
        assert_eq!(buffer.len(), 200);
        assert_consistent(&pool);

        // Nothing pooled is big enough: a fresh, exactly-sized buffer.
        let buffer = pool.acquire(301);
        assert_eq!(buffer.len(), 301);
        assert_consistent(&pool);
    }

    #[test]
    fn release_trims_oldest_first() {
        let pool = BufferPool::new(500);
        pool.release(vec![1; 200]); // oldest
        pool.release(vec![2; 200]);
        pool.release(vec![3; 200]); // pushes total to 600: the oldest goes

        let state = pool.state.lock();
        assert_eq!(state.total_bytes, 400);
        assert!(!state.buffers.values().any(|b| b.first() == Some(&1)));
        drop(state);
        assert_consistent(&pool);
    }

    #[test]
    fn oversized_buffers_are_discarded() {
        let pool = BufferPool::new(100);
        pool.release(vec![0; 101]);
        let state = pool.state.lock();
        assert_eq!(state.total_bytes, 0);
        assert!(state.buffers.is_empty());
    }

    #[test]
    fn acquired_buffers_leave_the_pool() {
        let pool = BufferPool::new(4096);
        pool.release(vec![7; 64]);
        let first = pool.acquire(64);
        assert_eq!(first[0], 7);
        // The same buffer must not be handed out twice.
        let second = pool.acquire(64);
        assert_eq!(second[0], 0);
        assert_consistent(&pool);
    }
}
