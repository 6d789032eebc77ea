//! Growable chunked pool
//!
//! A stack of [`FixedPool`] chunks. Allocation tries the chunk that last
//! succeeded, then scans every chunk, and only when all of them are full
//! pushes a fresh chunk. Chunks are never unlinked while the pool is
//! shared: only [`GrowablePool::shrink`], which needs `&mut self`, releases
//! them.

use super::fixed::{FixedPool, MAX_BLOCKS};
use super::handle::PoolHandle;
use crate::error::{Error, Result};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Largest number of chunks a pool can address (one chunk id is reserved)
pub const MAX_CHUNKS: usize = u16::MAX as usize;

#[repr(align(64))]
struct Chunk<T> {
    pool: FixedPool<T>,
}

/// Lock-free pool that grows by whole chunks
pub struct GrowablePool<T> {
    blocks_per_chunk: usize,
    /// Append-only chunk stack; slots below `top` are published chunks or
    /// holes left by `shrink`
    chunks: Box<[AtomicPtr<Chunk<T>>]>,
    top: AtomicUsize,
    last_alloc: AtomicUsize,
    last_dealloc: AtomicUsize,
    _owns: PhantomData<Box<Chunk<T>>>,
}

// SAFETY: chunks are heap allocations owned by the pool and only freed
// through `&mut self` or `Drop`. Values move between threads through
// allocate/deallocate (T: Send) and are shared through `get` (T: Sync).
unsafe impl<T: Send> Send for GrowablePool<T> {}
unsafe impl<T: Send + Sync> Sync for GrowablePool<T> {}

impl<T: Default> GrowablePool<T> {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `blocks_per_chunk` - Blocks added by each growth step
    /// * `max_chunks` - Hard limit on the number of chunks
    pub fn new(blocks_per_chunk: usize, max_chunks: usize) -> Result<Self> {
        if blocks_per_chunk == 0 || blocks_per_chunk > MAX_BLOCKS {
            return Err(Error::InvalidArgument(format!(
                "blocks per chunk must be in 1..={}, got {}",
                MAX_BLOCKS, blocks_per_chunk
            )));
        }
        if max_chunks == 0 || max_chunks > MAX_CHUNKS {
            return Err(Error::InvalidArgument(format!(
                "max chunks must be in 1..={}, got {}",
                MAX_CHUNKS, max_chunks
            )));
        }

        let chunks = (0..max_chunks)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Ok(Self {
            blocks_per_chunk,
            chunks,
            top: AtomicUsize::new(0),
            last_alloc: AtomicUsize::new(0),
            last_dealloc: AtomicUsize::new(0),
            _owns: PhantomData,
        })
    }

    /// Create a pool and grow it to at least `capacity` blocks
    pub fn with_capacity(capacity: usize, blocks_per_chunk: usize, max_chunks: usize) -> Result<Self> {
        let pool = Self::new(blocks_per_chunk, max_chunks)?;
        if pool.grow(capacity) < capacity {
            return Err(Error::Pool(format!(
                "cannot reserve {} blocks with {} chunks of {}",
                capacity, max_chunks, blocks_per_chunk
            )));
        }
        Ok(pool)
    }

    /// Allocate a block, adding a chunk if every chunk is full
    pub fn allocate(&self) -> Option<PoolHandle> {
        loop {
            let hint = self.last_alloc.load(Ordering::Relaxed);
            if let Some(handle) = self.try_chunk(hint) {
                return Some(handle);
            }

            let top = self.top.load(Ordering::Acquire);
            for id in (0..top).filter(|&id| id != hint) {
                if let Some(handle) = self.try_chunk(id) {
                    self.last_alloc.store(id, Ordering::Relaxed);
                    return Some(handle);
                }
            }

            // Every chunk was full; a racing thread may drain the new chunk
            // before we get to it, in which case we scan again.
            let id = self.push_chunk()?;
            if let Some(handle) = self.try_chunk(id) {
                self.last_alloc.store(id, Ordering::Relaxed);
                return Some(handle);
            }
        }
    }

    /// Add chunks until the pool holds at least `capacity` blocks
    ///
    /// Returns the resulting capacity, which stays short of the request
    /// only when the chunk limit is reached.
    pub fn grow(&self, capacity: usize) -> usize {
        while self.capacity() < capacity {
            if self.push_chunk().is_none() {
                break;
            }
        }
        self.capacity()
    }

    fn push_chunk(&self) -> Option<usize> {
        let pool = match FixedPool::new(self.blocks_per_chunk) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "Failed to build pool chunk");
                return None;
            }
        };
        let raw = Box::into_raw(Box::new(Chunk { pool }));

        loop {
            let top = self.top.load(Ordering::Acquire);

            // Holes below the top are only left behind by `shrink`
            for id in 0..top {
                if self.chunks[id]
                    .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(chunk = id, "Refilled pool chunk");
                    return Some(id);
                }
            }

            if top >= self.chunks.len() {
                // SAFETY: `raw` was never published, so we still own it
                drop(unsafe { Box::from_raw(raw) });
                warn!(max_chunks = self.chunks.len(), "Pool reached its chunk limit");
                return None;
            }

            let published = self.chunks[top]
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            // Either we own slot `top` or someone else does; in both cases
            // help the stack height past it.
            let _ = self
                .top
                .compare_exchange(top, top + 1, Ordering::AcqRel, Ordering::Acquire);

            if published {
                debug!(chunk = top, blocks = self.blocks_per_chunk, "Pushed pool chunk");
                return Some(top);
            }
        }
    }
}

impl<T> GrowablePool<T> {
    fn chunk(&self, id: usize) -> Option<&Chunk<T>> {
        let raw = self.chunks.get(id)?.load(Ordering::Acquire);
        // SAFETY: non-null slots point at chunks that stay allocated until
        // `shrink` (`&mut self`) or drop.
        unsafe { raw.as_ref() }
    }

    fn try_chunk(&self, id: usize) -> Option<PoolHandle> {
        let block = self.chunk(id)?.pool.allocate()?;
        Some(PoolHandle::new(id as u16, block as u16))
    }

    fn live_chunks(&self) -> impl Iterator<Item = (usize, &Chunk<T>)> + '_ {
        let top = self.top.load(Ordering::Acquire);
        (0..top).filter_map(move |id| self.chunk(id).map(|chunk| (id, chunk)))
    }

    /// Return a block to its chunk
    pub fn deallocate(&self, handle: PoolHandle) -> Result<()> {
        let chunk = self
            .chunk(handle.chunk as usize)
            .ok_or_else(|| Error::NotOwned(format!("{} names no chunk of this pool", handle)))?;
        chunk.pool.deallocate(u32::from(handle.block))?;
        self.last_dealloc.store(handle.chunk as usize, Ordering::Relaxed);
        Ok(())
    }

    /// Return the block holding `value`, locating its chunk by address
    pub fn deallocate_ptr(&self, value: &T) -> Result<()> {
        let handle = self.handle_of(value).ok_or_else(|| {
            Error::NotOwned(format!("pointer {:p} is not a block of this pool", value))
        })?;
        self.deallocate(handle)
    }

    /// Find the handle of a value handed out by this pool
    pub fn handle_of(&self, value: &T) -> Option<PoolHandle> {
        let hint = self.last_dealloc.load(Ordering::Relaxed);
        if let Some(block) = self.chunk(hint).and_then(|chunk| chunk.pool.index_of(value)) {
            return Some(PoolHandle::new(hint as u16, block as u16));
        }

        self.live_chunks().find_map(|(id, chunk)| {
            chunk
                .pool
                .index_of(value)
                .map(|block| PoolHandle::new(id as u16, block as u16))
        })
    }

    /// Value behind a handle
    pub fn get(&self, handle: PoolHandle) -> Option<&T> {
        self.chunk(handle.chunk as usize)?
            .pool
            .get(u32::from(handle.block))
    }

    /// Whether `ptr` addresses a block of any chunk
    pub fn valid(&self, ptr: *const T) -> bool {
        self.live_chunks().any(|(_, chunk)| chunk.pool.valid(ptr))
    }

    /// Total blocks across all chunks
    pub fn capacity(&self) -> usize {
        self.chunk_count() * self.blocks_per_chunk
    }

    /// Free blocks across all chunks
    pub fn free_blocks(&self) -> usize {
        self.live_chunks().map(|(_, chunk)| chunk.pool.free_blocks()).sum()
    }

    /// Number of live chunks
    pub fn chunk_count(&self) -> usize {
        self.live_chunks().count()
    }

    pub fn blocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk
    }

    /// Release completely empty chunks until at most enough chunks for
    /// `capacity` blocks remain
    ///
    /// Chunks holding any allocated block are kept. Returns the number of
    /// chunks released.
    pub fn shrink(&mut self, capacity: usize) -> usize {
        let target = capacity.div_ceil(self.blocks_per_chunk);
        let mut live = self.chunk_count();
        let mut released = 0;

        for slot in self.chunks.iter_mut().rev() {
            if live <= target {
                break;
            }
            let raw = *slot.get_mut();
            if raw.is_null() {
                continue;
            }
            // SAFETY: `&mut self` excludes every other access to the chunk
            let empty = unsafe { (*raw).pool.is_empty() };
            if empty {
                *slot.get_mut() = ptr::null_mut();
                // SAFETY: the slot was the only owner of this allocation
                drop(unsafe { Box::from_raw(raw) });
                live -= 1;
                released += 1;
            }
        }

        let top = self.top.get_mut();
        while *top > 0 && self.chunks[*top - 1].get_mut().is_null() {
            *top -= 1;
        }
        *self.last_alloc.get_mut() = 0;
        *self.last_dealloc.get_mut() = 0;

        if released > 0 {
            debug!(released, remaining = live, "Shrank pool");
        }
        released
    }
}

impl<T> Drop for GrowablePool<T> {
    fn drop(&mut self) {
        for slot in self.chunks.iter_mut() {
            let raw = *slot.get_mut();
            if !raw.is_null() {
                // SAFETY: exclusive access during drop; each chunk is owned once
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

impl<T> std::fmt::Debug for GrowablePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowablePool")
            .field("blocks_per_chunk", &self.blocks_per_chunk)
            .field("chunks", &self.chunk_count())
            .field("free", &self.free_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_grows_by_chunks() {
        let pool: GrowablePool<u64> = GrowablePool::new(4, 8).unwrap();
        assert_eq!(pool.capacity(), 0);

        let handles: Vec<_> = (0..10).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.chunk_count(), 3);
        assert_eq!(pool.capacity(), 12);
        assert_eq!(pool.free_blocks(), 2);

        let unique: HashSet<_> = handles.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_chunk_limit_exhausts() {
        let pool: GrowablePool<u8> = GrowablePool::new(2, 2).unwrap();
        for _ in 0..4 {
            assert!(pool.allocate().is_some());
        }
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn test_deallocate_by_handle_and_pointer() {
        let pool: GrowablePool<u32> = GrowablePool::with_capacity(8, 4, 4).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        pool.deallocate(a).unwrap();

        let value = pool.get(b).unwrap();
        assert_eq!(pool.handle_of(value), Some(b));
        pool.deallocate_ptr(value).unwrap();

        assert_eq!(pool.free_blocks(), 8);
    }

    #[test]
    fn test_unowned_is_fatal() {
        let pool: GrowablePool<u32> = GrowablePool::with_capacity(4, 4, 4).unwrap();
        let other: GrowablePool<u32> = GrowablePool::with_capacity(4, 4, 4).unwrap();

        assert!(matches!(
            pool.deallocate(PoolHandle::new(3, 0)),
            Err(Error::NotOwned(_))
        ));

        let handle = other.allocate().unwrap();
        let foreign = other.get(handle).unwrap();
        assert!(!pool.valid(foreign));
        assert!(matches!(pool.deallocate_ptr(foreign), Err(Error::NotOwned(_))));
    }

    #[test]
    fn test_shrink_only_releases_empty_chunks() {
        let mut pool: GrowablePool<u64> = GrowablePool::with_capacity(16, 4, 8).unwrap();
        assert_eq!(pool.chunk_count(), 4);

        // Pin one block in the first chunk
        let pinned = pool.allocate().unwrap();

        assert_eq!(pool.shrink(0), 3);
        assert_eq!(pool.chunk_count(), 1);
        assert!(pool.get(pinned).is_some());

        pool.deallocate(pinned).unwrap();
        assert_eq!(pool.shrink(4), 0);
        assert_eq!(pool.shrink(0), 1);
        assert_eq!(pool.capacity(), 0);

        // The stack grows again after shrinking
        assert!(pool.allocate().is_some());
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_shrink_leaves_holes_that_refill() {
        let mut pool: GrowablePool<u64> = GrowablePool::with_capacity(12, 4, 8).unwrap();
        // Pin the last chunk so the middle ones become holes
        let handles: Vec<_> = (0..12).map(|_| pool.allocate().unwrap()).collect();
        for handle in &handles[..8] {
            pool.deallocate(*handle).unwrap();
        }

        assert_eq!(pool.shrink(0), 2);
        assert_eq!(pool.chunk_count(), 1);

        assert_eq!(pool.grow(12), 12);
        assert_eq!(pool.chunk_count(), 3);
    }

    #[test]
    fn test_concurrent_growth() {
        let pool: Arc<GrowablePool<u64>> = Arc::new(GrowablePool::new(16, 256).unwrap());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..200).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for thread in threads {
            for handle in thread.join().unwrap() {
                assert!(all.insert(handle), "duplicate handle {}", handle);
            }
        }
        assert_eq!(all.len(), 1600);
        assert_eq!(pool.capacity() - pool.free_blocks(), 1600);
    }
}
