//! Handles into a growable pool

use std::fmt;

/// Address of one block in a [`GrowablePool`](super::GrowablePool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolHandle {
    /// Chunk position in the pool's chunk stack
    pub chunk: u16,
    /// Block index within the chunk
    pub block: u16,
}

impl PoolHandle {
    /// Handle that addresses nothing
    pub const NULL: PoolHandle = PoolHandle {
        chunk: u16::MAX,
        block: u16::MAX,
    };

    /// Create a new handle
    pub fn new(chunk: u16, block: u16) -> Self {
        Self { chunk, block }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Pack into a single word
    pub fn to_bits(self) -> u32 {
        (u32::from(self.chunk) << 16) | u32::from(self.block)
    }

    /// Unpack from [`to_bits`](Self::to_bits)
    pub fn from_bits(bits: u32) -> Self {
        Self {
            chunk: (bits >> 16) as u16,
            block: bits as u16,
        }
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle(chunk={}, block={})", self.chunk, self.block)
        }
    }
}
