//! Lock-free block pools
//!
//! Two layers of fixed-size block allocation used by the queue and the
//! registry. Neither layer ever returns memory to the system while shared,
//! so a stale index read by a racing thread always points at live storage.
//!
//! # Architecture
//!
//! ```text
//! GrowablePool<T>
//!   ├─→ chunk 0: FixedPool<T>  head={index=3, tag=17} → 3 → 7 → 12 → ∅
//!   ├─→ chunk 1: FixedPool<T>  head={index=∅, tag=40}   (full)
//!   └─→ chunk 2: FixedPool<T>  head={index=0, tag=2}  → 0 → 1 → ...
//!
//! PoolHandle = (chunk: u16, block: u16) packed into a u32
//! ```
//!
//! Each `FixedPool` keeps its free list inside the blocks themselves and
//! guards the head with a tagged compare-and-swap. `GrowablePool` appends
//! whole chunks when every existing chunk is full.

pub mod fixed;
pub mod growable;
pub mod handle;

pub use fixed::{FixedPool, INVALID_INDEX, MAX_BLOCKS};
pub use growable::GrowablePool;
pub use handle::PoolHandle;
