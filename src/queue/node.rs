//! Queue nodes and tagged links

use crate::pool::PoolHandle;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Keeps a hot atomic on its own cache line
#[repr(align(64))]
pub(crate) struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// A node handle paired with an ABA tag, packed into one atomic word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub handle: PoolHandle,
    pub tag: u32,
}

impl Link {
    pub fn new(handle: PoolHandle, tag: u32) -> Self {
        Self { handle, tag }
    }

    pub fn null(tag: u32) -> Self {
        Self::new(PoolHandle::NULL, tag)
    }

    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }

    /// Same tag lineage, pointing somewhere else
    pub fn swing(&self, handle: PoolHandle) -> Self {
        Self::new(handle, self.tag.wrapping_add(1))
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.handle.to_bits())
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            handle: PoolHandle::from_bits(raw as u32),
            tag: (raw >> 32) as u32,
        }
    }
}

/// Queue node living in a growable pool
///
/// The node memory is type-stable: once a chunk exists, its nodes stay
/// initialised, so a racing thread holding a stale handle only ever reads
/// the atomic `next` word.
pub struct Node<T> {
    pub(crate) next: AtomicU64,
    /// Two-phase release: set once when the value is consumed and once when
    /// the node is unlinked as the old dummy. The second setter frees it.
    pub(crate) released: AtomicBool,
    pub(crate) value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(Link::null(0).pack()),
            released: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

// SAFETY: `value` is written only by the pusher that allocated the node,
// before the node is linked (Release), and read only by the single popper
// whose head CAS moved past the node's predecessor. All other shared state
// is atomic.
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> Node<T> {
    /// Prepare a freshly allocated node to carry `value`
    ///
    /// # Safety
    /// The caller must own the node exclusively (just allocated, not linked).
    pub(crate) unsafe fn prepare(&self, value: T) {
        (*self.value.get()).write(value);
        self.released.store(false, Ordering::Relaxed);
        let previous = Link::unpack(self.next.load(Ordering::Relaxed));
        self.next
            .store(Link::null(previous.tag.wrapping_add(1)).pack(), Ordering::Release);
    }

    /// Mark the node as the initial dummy, whose value phase is already done
    pub(crate) fn prepare_dummy(&self) {
        self.released.store(true, Ordering::Relaxed);
        let previous = Link::unpack(self.next.load(Ordering::Relaxed));
        self.next
            .store(Link::null(previous.tag.wrapping_add(1)).pack(), Ordering::Release);
    }

    /// Move the value out
    ///
    /// # Safety
    /// The caller must have won the head CAS that made this node the dummy,
    /// and may call this only once per `prepare`.
    pub(crate) unsafe fn take(&self) -> T {
        (*self.value.get()).assume_init_read()
    }

    /// Run one release phase; true when the caller must free the node
    pub(crate) fn release(&self) -> bool {
        self.released.swap(true, Ordering::AcqRel)
    }
}
