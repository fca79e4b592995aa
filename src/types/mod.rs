//! Common types used throughout the index engine.

mod block_pos;
mod position;

pub use block_pos::BlockPos;
pub use position::{
    decode_position, encode_position, max_position, parse_ascii_number, position_width,
    write_ascii_number, MAX_LEGACY_POSITION, MAX_MODERN_POSITION,
};

use serde::{Deserialize, Serialize};

/// Largest key length a file may declare
pub const MAX_KEY_SIZE: usize = 255;

/// Maximum depth of the descent path
pub const MAX_LEVEL: usize = 32;

/// Block size written when a file is created
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Default number of cached blocks in a buffer cache
pub const DEFAULT_MAX_BUFFERS: usize = 100;

/// Smallest readable header accepted when opening a file
pub const MIN_HEADER_READ: usize = 512;

/// Filler byte for unused block space; also the modern end-of-block sentinel
pub const DEL_BYTE: u8 = 0xFF;

/// End-of-record byte; the legacy end-of-block sentinel and header terminator
pub const EOR_BYTE: u8 = 0xFA;

/// Version number written into new modern files
pub const MODERN_VERSION: u8 = 10;

/// Version number written into new legacy files
pub const LEGACY_VERSION: u8 = 8;

/// On-disk entry format, chosen once from the header version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Format {
    /// Version 9 and later: binary positions, front-compressed leaves
    Modern,
    /// Versions before 9: ASCII positions, fixed-size entries
    Legacy,
}

impl Format {
    /// Format implied by a header version number
    pub fn from_version(version: u8) -> Self {
        if version >= 9 {
            Self::Modern
        } else {
            Self::Legacy
        }
    }

    /// Byte that ends the valid entries of a block
    pub fn sentinel(self) -> u8 {
        match self {
            Self::Modern => DEL_BYTE,
            Self::Legacy => EOR_BYTE,
        }
    }
}

/// Block kinds, identified by the first byte of the block
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    /// Header, block 0
    Header = b'I',
    /// Branch block with separator keys and child pointers
    Branch = b'U',
    /// Leaf block with key entries
    Leaf = b'V',
    /// Free record-slot list node
    Slots = b'F',
    /// Block on the free-block chain
    Deleted = b'D',
}

impl BlockKind {
    /// Convert from the tag byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(Self::Header),
            b'U' => Some(Self::Branch),
            b'V' => Some(Self::Leaf),
            b'F' => Some(Self::Slots),
            b'D' => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Tag byte
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Cursor state after a navigation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyState {
    /// Positioned on an entry
    OnKey = 1,
    /// Before the first entry in the file
    BeforeFirst = 2,
    /// Between two entries, not on either
    Between = 3,
    /// After the last entry in the file
    AfterLast = 4,
}

impl KeyState {
    /// Status code returned by the integer call surface
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Entry added
    Inserted,
    /// Key already present and the file forbids duplicates
    DuplicateKey,
    /// Same key with the same record position already present
    DuplicateExact,
}

impl InsertOutcome {
    /// Status code returned by the integer call surface
    pub fn code(self) -> i32 {
        match self {
            Self::Inserted => 0,
            Self::DuplicateKey => 1,
            Self::DuplicateExact => 2,
        }
    }
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Entry removed
    Deleted,
    /// No matching entry
    NotFound,
}

impl DeleteOutcome {
    /// Status code returned by the integer call surface
    pub fn code(self) -> i32 {
        match self {
            Self::Deleted => 0,
            Self::NotFound => 1,
        }
    }
}

/// Result of asking for a recycled record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A freed record position was taken off the slot list
    Reserved(u64),
    /// Nothing to reuse; the caller appends a new record
    NoFreeSlot,
}

impl ReserveOutcome {
    /// Status code returned by the integer call surface
    pub fn code(self) -> i32 {
        match self {
            Self::Reserved(_) => 0,
            Self::NoFreeSlot => 1,
        }
    }
}

/// Result of returning a record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Position pushed onto the slot list
    Released,
    /// The file does not keep a slot list
    NotFixed,
}

impl ReleaseOutcome {
    /// Status code returned by the integer call surface
    pub fn code(self) -> i32 {
        match self {
            Self::Released => 0,
            Self::NotFixed => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_kind_conversions() {
        assert_eq!(BlockKind::from_byte(b'V'), Some(BlockKind::Leaf));
        assert_eq!(BlockKind::from_byte(b'U'), Some(BlockKind::Branch));
        assert_eq!(BlockKind::from_byte(0xFF), None);
        assert_eq!(BlockKind::Deleted.as_byte(), b'D');
    }

    #[test]
    fn test_format_from_version() {
        assert_eq!(Format::from_version(10), Format::Modern);
        assert_eq!(Format::from_version(9), Format::Modern);
        assert_eq!(Format::from_version(8), Format::Legacy);
        assert_eq!(Format::Modern.sentinel(), 0xFF);
        assert_eq!(Format::Legacy.sentinel(), 0xFA);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(KeyState::Between.code(), 3);
        assert_eq!(InsertOutcome::DuplicateExact.code(), 2);
        assert_eq!(DeleteOutcome::NotFound.code(), 1);
        assert_eq!(ReserveOutcome::Reserved(7).code(), 0);
        assert_eq!(ReleaseOutcome::NotFixed.code(), 1);
    }
}
