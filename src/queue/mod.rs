//! Lock-free MPMC queue
//!
//! Michael & Scott FIFO whose nodes come from a [`GrowablePool`]. Links are
//! tagged pool handles rather than pointers, and because pool memory is
//! type-stable a thread working from a stale snapshot can only fail a CAS,
//! never touch freed memory.
//!
//! ## Node reclamation
//!
//! A popped node is still referenced twice: its value has to be read by the
//! popper that moved the head onto it, and it has to be unlinked later as the
//! old dummy by the next popper. Each party runs one release phase on the
//! node and whichever comes second returns it to the pool.

mod node;

use crate::error::{Error, Result};
use crate::pool::{GrowablePool, PoolHandle};
use node::{CachePadded, Link, Node};
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use tracing::error;

/// Default number of nodes added per pool chunk
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default limit on node pool chunks
pub const DEFAULT_MAX_CHUNKS: usize = 64;

/// Spins before `push` starts yielding
const SPIN_LIMIT: u32 = 64;

/// Unbounded multi-producer multi-consumer FIFO
pub struct LockFreeQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    len: AtomicIsize,
    nodes: GrowablePool<Node<T>>,
}

impl<T: Send> LockFreeQueue<T> {
    /// Create an empty queue whose node pool grows `blocks_per_chunk` nodes
    /// at a time, up to `max_chunks` chunks
    pub fn new(blocks_per_chunk: usize, max_chunks: usize) -> Result<Self> {
        let nodes = GrowablePool::new(blocks_per_chunk, max_chunks)?;
        Self::from_pool(nodes)
    }

    /// Create an empty queue with room for `capacity` values up front
    pub fn with_capacity(capacity: usize, blocks_per_chunk: usize, max_chunks: usize) -> Result<Self> {
        // One node is always held by the dummy
        let nodes = GrowablePool::with_capacity(capacity + 1, blocks_per_chunk, max_chunks)?;
        Self::from_pool(nodes)
    }

    fn from_pool(nodes: GrowablePool<Node<T>>) -> Result<Self> {
        let dummy = nodes
            .allocate()
            .ok_or_else(|| Error::Queue("no node available for the dummy".to_string()))?;
        nodes
            .get(dummy)
            .ok_or_else(|| Error::Queue(format!("dummy {} does not resolve", dummy)))?
            .prepare_dummy();

        let start = Link::new(dummy, 0).pack();
        Ok(Self {
            head: CachePadded::new(AtomicU64::new(start)),
            tail: CachePadded::new(AtomicU64::new(start)),
            len: AtomicIsize::new(0),
            nodes,
        })
    }

    /// Append a value; hands it back if the node pool is exhausted
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        match self.reserve() {
            Some(reserved) => {
                reserved.push(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Take a node now so a later push cannot fail
    ///
    /// Dropping the reservation unused returns the node to the pool.
    pub fn reserve(&self) -> Option<Reserved<'_, T>> {
        let handle = self.nodes.allocate()?;
        Some(Reserved { queue: self, handle })
    }

    /// Link a prepared node after the tail
    fn link(&self, handle: PoolHandle) {
        loop {
            let tail_raw = self.tail.load(Ordering::Acquire);
            let tail = Link::unpack(tail_raw);
            let Some(last) = self.node(tail.handle) else {
                error!(handle = %tail.handle, "Queue tail names a node outside its pool");
                return;
            };
            let next_raw = last.next.load(Ordering::Acquire);
            let next = Link::unpack(next_raw);

            if tail_raw != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                if last
                    .next
                    .compare_exchange(next_raw, next.swing(handle).pack(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail_raw,
                        tail.swing(handle).pack(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Another pusher linked past the tail; help it along
                let _ = self.tail.compare_exchange(
                    tail_raw,
                    tail.swing(next.handle).pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Append a value, spinning until the node pool has room
    pub fn push(&self, mut value: T) {
        let mut spins = 0u32;
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(back) => {
                    value = back;
                    if spins < SPIN_LIMIT {
                        spins += 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Remove the oldest value
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head_raw = self.head.load(Ordering::Acquire);
            let head = Link::unpack(head_raw);
            let tail_raw = self.tail.load(Ordering::Acquire);
            let tail = Link::unpack(tail_raw);
            let Some(dummy) = self.node(head.handle) else {
                error!(handle = %head.handle, "Queue head names a node outside its pool");
                return None;
            };
            let next = Link::unpack(dummy.next.load(Ordering::Acquire));

            if head_raw != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head.handle == tail.handle {
                if next.is_null() {
                    return None;
                }
                // Tail is lagging behind a linked node
                let _ = self.tail.compare_exchange(
                    tail_raw,
                    tail.swing(next.handle).pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            if next.is_null() {
                continue;
            }

            if self
                .head
                .compare_exchange(head_raw, head.swing(next.handle).pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let Some(first) = self.node(next.handle) else {
                    error!(handle = %next.handle, "Queue link names a node outside its pool");
                    return None;
                };
                // SAFETY: winning the head CAS makes us the only reader of
                // this node's value, and the node cannot be freed before our
                // release phase below.
                let value = unsafe { first.take() };
                self.len.fetch_sub(1, Ordering::Relaxed);

                if first.release() {
                    self.free(next.handle);
                }
                if dummy.release() {
                    self.free(head.handle);
                }
                return Some(value);
            }
        }
    }
}

impl<T> LockFreeQueue<T> {
    /// Links only ever name allocated nodes of our own pool, and chunks are
    /// not released while the queue is shared, so `None` means corruption
    fn node(&self, handle: PoolHandle) -> Option<&Node<T>> {
        let node = self.nodes.get(handle);
        debug_assert!(node.is_some(), "queue link {} is outside its pool", handle);
        node
    }

    fn free(&self, handle: PoolHandle) {
        if let Err(e) = self.nodes.deallocate(handle) {
            error!(error = %e, handle = %handle, "Failed to release queue node");
        }
    }

    /// Advisory emptiness check
    pub fn is_empty(&self) -> bool {
        let head = Link::unpack(self.head.load(Ordering::Acquire));
        self.node(head.handle)
            .map_or(true, |dummy| Link::unpack(dummy.next.load(Ordering::Acquire)).is_null())
    }

    /// Number of queued values; exact only when no operation is in flight
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }

    /// Total nodes in the backing pool, the dummy included
    pub fn node_capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Nodes available for new values
    pub fn free_nodes(&self) -> usize {
        self.nodes.free_blocks()
    }

    /// Release empty node chunks, keeping room for at least `capacity`
    /// values. Returns the number of chunks released.
    pub fn shrink(&mut self, capacity: usize) -> usize {
        self.nodes.shrink(capacity + 1)
    }
}

impl<T: Send> LockFreeQueue<T> {
    /// Reserve room for at least `capacity` values; returns the resulting
    /// value capacity
    pub fn grow(&self, capacity: usize) -> usize {
        self.nodes.grow(capacity + 1).saturating_sub(1)
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // Values still linked after the dummy need their destructors run
        let mut link = Link::unpack(self.head.load(Ordering::Relaxed));
        while let Some(node) = self.node(link.handle) {
            let next = Link::unpack(node.next.load(Ordering::Relaxed));
            if next.is_null() {
                break;
            }
            let Some(queued) = self.node(next.handle) else {
                break;
            };
            // SAFETY: `&mut self`; every node after the dummy holds an
            // unconsumed value
            drop(unsafe { queued.take() });
            link = next;
        }
    }
}

impl<T> std::fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("len", &self.len())
            .field("node_capacity", &self.node_capacity())
            .finish()
    }
}

/// A queue node taken ahead of its value
pub struct Reserved<'q, T> {
    queue: &'q LockFreeQueue<T>,
    handle: PoolHandle,
}

impl<T: Send> Reserved<'_, T> {
    /// Append `value` using the reserved node
    pub fn push(mut self, value: T) {
        let handle = std::mem::replace(&mut self.handle, PoolHandle::NULL);
        match self.queue.node(handle) {
            Some(node) => {
                // SAFETY: the node is ours alone until it is linked
                unsafe { node.prepare(value) };
                self.queue.link(handle);
            }
            None => error!(handle = %handle, "Reserved node is outside the queue pool"),
        }
    }
}

impl<T> Drop for Reserved<'_, T> {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            self.queue.free(self.handle);
        }
    }
}

impl<T> std::fmt::Debug for Reserved<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reserved").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = LockFreeQueue::new(8, 4).unwrap();
        queue.try_push("a").unwrap();
        queue.try_push("b").unwrap();
        queue.try_push("c").unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_exhaustion_hands_value_back() {
        // 4 nodes total, one of them the dummy
        let queue = LockFreeQueue::new(4, 1).unwrap();
        for i in 0..3 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.try_push(99), Err(99));

        assert_eq!(queue.try_pop(), Some(0));
        // The old dummy went back to the pool
        queue.try_push(3).unwrap();
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn test_nodes_are_recycled() {
        let queue = LockFreeQueue::with_capacity(15, 16, 1).unwrap();
        for round in 0..1000 {
            queue.try_push(round).unwrap();
            assert_eq!(queue.try_pop(), Some(round));
        }
        assert_eq!(queue.free_nodes(), queue.node_capacity() - 1);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: usize = 8;
        const TOTAL: usize = 10_000;

        let queue = Arc::new(LockFreeQueue::new(256, 64).unwrap());
        let popped = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..TOTAL / PRODUCERS {
                        queue.push(p * TOTAL + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let popped = Arc::clone(&popped);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while popped.load(Ordering::SeqCst) < TOTAL {
                        if let Some(value) = queue.try_pop() {
                            popped.fetch_add(1, Ordering::SeqCst);
                            seen.push(value);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut all = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(all.insert(value), "value {} popped twice", value);
            }
        }
        assert_eq!(all.len(), TOTAL);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_per_producer_order_is_kept() {
        let queue = Arc::new(LockFreeQueue::new(64, 64).unwrap());

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        queue.push((p, i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut last = [None::<u64>; 4];
        while let Some((p, i)) = queue.try_pop() {
            if let Some(prev) = last[p as usize] {
                assert!(i > prev);
            }
            last[p as usize] = Some(i);
        }
        assert!(last.iter().all(|l| *l == Some(499)));
    }

    #[test]
    fn test_drop_releases_queued_values() {
        let tracker = Arc::new(());
        {
            let queue = LockFreeQueue::new(8, 2).unwrap();
            for _ in 0..5 {
                queue.try_push(Arc::clone(&tracker)).unwrap();
            }
            drop(queue.try_pop());
            assert_eq!(Arc::strong_count(&tracker), 5);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_shrink_after_burst() {
        let mut queue = LockFreeQueue::new(4, 16).unwrap();
        for i in 0..30 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.node_capacity(), 32);
        while queue.try_pop().is_some() {}

        // The dummy pins one chunk
        let released = queue.shrink(0);
        assert!(released >= 6);
        assert!(queue.node_capacity() <= 8);

        queue.try_push(7).unwrap();
        assert_eq!(queue.try_pop(), Some(7));
        assert_eq!(queue.grow(20), queue.node_capacity() - 1);
    }

    #[test]
    fn test_reservation_guarantees_push() {
        // 4 nodes total, one of them the dummy
        let queue = LockFreeQueue::new(4, 1).unwrap();
        let first = queue.reserve().unwrap();
        let second = queue.reserve().unwrap();
        queue.try_push(0).unwrap();

        // Every node is spoken for
        assert!(queue.reserve().is_none());
        assert_eq!(queue.try_push(9), Err(9));

        second.push(2);
        drop(first);
        assert_eq!(queue.free_nodes(), 1);

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 2]);
        assert_eq!(queue.free_nodes(), 3);
    }
}
