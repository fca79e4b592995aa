//! Per-file block geometry.

use crate::types::{max_position, position_width, Format};

/// Sizes derived from the key length, block size and entry format of a file.
///
/// Every block of a file shares one layout; it is fixed when the file is
/// opened and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Declared key length in bytes
    pub key_len: usize,
    /// Block size in bytes
    pub block_size: usize,
    /// Entry format
    pub format: Format,
}

impl Layout {
    /// Create a layout
    pub fn new(key_len: usize, block_size: usize, format: Format) -> Self {
        Self {
            key_len,
            block_size,
            format,
        }
    }

    /// Width of a record or block position field
    pub fn pos_width(&self) -> usize {
        position_width(self.format)
    }

    /// Size of an uncompressed key entry: key plus record position
    pub fn entry_size(&self) -> usize {
        self.key_len + self.pos_width()
    }

    /// Size of a branch entry: key, record position and child pointer
    pub fn branch_entry_size(&self) -> usize {
        self.entry_size() + self.pos_width()
    }

    /// End-of-entries sentinel
    pub fn sentinel(&self) -> u8 {
        self.format.sentinel()
    }

    /// Bytes a block must keep free for the sentinel when not completely full
    pub fn eor_size(&self) -> usize {
        match self.format {
            Format::Modern => 0,
            Format::Legacy => 1,
        }
    }

    /// Largest record position the format can store
    pub fn max_record(&self) -> u64 {
        max_position(self.format)
    }

    /// Offset of the first entry of a branch block
    pub fn branch_start(&self) -> usize {
        1 + self.pos_width()
    }

    /// True when a block body of `used` bytes (tag included) fits
    pub fn fits(&self, used: usize) -> bool {
        used + self.eor_size() <= self.block_size
    }

    /// Block size large enough to hold three full branch entries
    pub fn min_block_size(&self) -> usize {
        self.branch_start() + 3 * self.branch_entry_size() + 1
    }
}
