//! Block position type.

use std::fmt;

/// Byte offset of a block in an index file.
///
/// Block positions are stored on disk as absolute file offsets. Position 0 is
/// the header block, so it doubles as the null link in every chain and child
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockPos(pub u64);

impl BlockPos {
    /// Null link / header block
    pub const NULL: BlockPos = BlockPos(0);

    /// Create a new block position
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Get the raw file offset
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// True for the null link
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Position of the block that follows this one in the file
    pub const fn following(self, block_size: usize) -> Self {
        Self(self.0 + block_size as u64)
    }

    /// Hash bucket used by the block cache
    pub(crate) fn bucket(self, file: u32) -> usize {
        (file as u64).wrapping_add(self.0 >> 8) as u8 as usize
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

impl From<u64> for BlockPos {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}
