//! Fixed block pool
//!
//! A single CAS-protected free list over an owned arena of equal-size
//! blocks. The free-list link is the header word of each block, so the pool
//! needs no side table.
//!
//! ## Invariants
//!
//! - Every block value is initialised once at construction and stays
//!   initialised for the lifetime of the pool (type-stable memory)
//! - A block is on the free list iff its `live` flag is clear
//! - The head's tag increments on every successful CAS, so a thread that
//!   read a stale head can never swing it back (ABA)

use crate::error::{Error, Result};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Largest number of blocks a single pool can hold
pub const MAX_BLOCKS: usize = 65534;

/// Index value reserved as "no block"
pub const INVALID_INDEX: u32 = 0xFFFF;

/// Free-list head: block index plus ABA tag, packed into one atomic word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeHead {
    index: u32,
    tag: u32,
}

impl FreeHead {
    fn pack(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.index)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            index: raw as u32,
            tag: (raw >> 32) as u32,
        }
    }
}

#[repr(C)]
struct Block<T> {
    /// Next free block while this one is on the free list
    next: AtomicU32,
    live: AtomicBool,
    value: T,
}

/// Fixed-capacity lock-free pool of `T` blocks
///
/// Blocks are addressed by index. `allocate` hands out an index whose value
/// may be used through shared references (interior mutability in `T`);
/// `deallocate` returns it. Exhaustion is a normal `None`, never a wait.
pub struct FixedPool<T> {
    blocks: Box<[Block<T>]>,
    head: AtomicU64,
    free: AtomicUsize,
}

impl<T: Default> FixedPool<T> {
    /// Create a pool of `num_blocks` default-initialised blocks
    pub fn new(num_blocks: usize) -> Result<Self> {
        if num_blocks > MAX_BLOCKS {
            return Err(Error::InvalidArgument(format!(
                "pool of {} blocks exceeds the maximum of {}",
                num_blocks, MAX_BLOCKS
            )));
        }

        let blocks: Box<[Block<T>]> = (0..num_blocks)
            .map(|i| {
                let next = if i + 1 < num_blocks {
                    (i + 1) as u32
                } else {
                    INVALID_INDEX
                };
                Block {
                    next: AtomicU32::new(next),
                    live: AtomicBool::new(false),
                    value: T::default(),
                }
            })
            .collect();

        let first = if num_blocks == 0 { INVALID_INDEX } else { 0 };

        Ok(Self {
            blocks,
            head: AtomicU64::new(FreeHead { index: first, tag: 0 }.pack()),
            free: AtomicUsize::new(num_blocks),
        })
    }
}

impl<T> FixedPool<T> {
    /// Size in bytes of one block, header included
    pub const fn block_size() -> usize {
        mem::size_of::<Block<T>>()
    }

    /// Total number of blocks
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free blocks (exact when no operation is in flight)
    pub fn free_blocks(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    /// Every block is free
    pub fn is_empty(&self) -> bool {
        self.free_blocks() == self.capacity()
    }

    /// No block is free
    pub fn is_full(&self) -> bool {
        FreeHead::unpack(self.head.load(Ordering::Acquire)).index == INVALID_INDEX
    }

    /// Pop a block off the free list
    pub fn allocate(&self) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);

        loop {
            let head = FreeHead::unpack(current);
            if head.index == INVALID_INDEX {
                return None;
            }

            // A stale head may name a block that was handed out meanwhile;
            // its `next` is then garbage but the tagged CAS below fails.
            let next = self.blocks[head.index as usize].next.load(Ordering::Acquire);
            let replacement = FreeHead {
                index: next,
                tag: head.tag.wrapping_add(1),
            };

            match self.head.compare_exchange_weak(
                current,
                replacement.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free.fetch_sub(1, Ordering::Relaxed);
                    self.blocks[head.index as usize]
                        .live
                        .store(true, Ordering::Release);
                    return Some(head.index);
                }
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Push a block back onto the free list
    pub fn deallocate(&self, index: u32) -> Result<()> {
        let block = self.blocks.get(index as usize).ok_or_else(|| {
            Error::NotOwned(format!(
                "block {} is outside a pool of {} blocks",
                index,
                self.capacity()
            ))
        })?;

        if !block.live.swap(false, Ordering::AcqRel) {
            return Err(Error::NotOwned(format!("block {} is already free", index)));
        }

        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let head = FreeHead::unpack(current);
            block.next.store(head.index, Ordering::Release);
            let replacement = FreeHead {
                index,
                tag: head.tag.wrapping_add(1),
            };

            match self.head.compare_exchange_weak(
                current,
                replacement.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Return the block holding `value` to the free list
    pub fn deallocate_ptr(&self, value: &T) -> Result<()> {
        let index = self.index_of(value).ok_or_else(|| {
            Error::NotOwned(format!("pointer {:p} is not a block of this pool", value))
        })?;
        self.deallocate(index)
    }

    /// Value stored in block `index`
    pub fn get(&self, index: u32) -> Option<&T> {
        self.blocks.get(index as usize).map(|block| &block.value)
    }

    /// Whether `ptr` addresses the value of one of this pool's blocks
    pub fn valid(&self, ptr: *const T) -> bool {
        self.index_of_ptr(ptr).is_some()
    }

    /// Block index of a value handed out by this pool
    pub fn index_of(&self, value: &T) -> Option<u32> {
        self.index_of_ptr(value as *const T)
    }

    fn index_of_ptr(&self, ptr: *const T) -> Option<u32> {
        let first = self.blocks.first()?;
        let base = &first.value as *const T as usize;
        let stride = Self::block_size();
        let offset = (ptr as usize).checked_sub(base)?;

        if offset % stride != 0 {
            return None;
        }
        let index = offset / stride;
        (index < self.blocks.len()).then_some(index as u32)
    }
}

impl<T> std::fmt::Debug for FixedPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_blocks())
            .finish()
    }
}
