//! Index file header.
//!
//! Block 0 of every index file holds the file's fixed parameters and the
//! heads of its block chains. Layout (modern, version 10):
//!
//! ```text
//! Offset  Size  Description
//! 0       1     'I'
//! 1       6     Free-block chain head
//! 7       6     Free record-slot chain head
//! 13      6     Root block
//! 19      6     High-water mark (last allocated block)
//! 41      5     Block size, ASCII, right aligned
//! 54      1     'L'
//! 55      1     'T' when the text name is relative to the index directory
//! 56      1     'D' when duplicate keys are allowed
//! 57      1     'S' for fixed-record files (versions 7 and 8: 'V' or 'S')
//! 58      2     Key length; a letter tens digit encodes 100 and up
//! 64      5     Fixed record length, ASCII
//! 98      2     Version number, ASCII
//! 100     1     0xFA
//! 101     ..    Text file name, terminated by 0xFA
//! ```
//!
//! Legacy headers keep the four pointers as 9-digit ASCII fields at offsets
//! 1, 10, 19 and 28 and pad the text name with blanks up to offset 165.

use crate::block::Layout;
use crate::error::{IndexError, Result};
use crate::types::{
    decode_position, encode_position, parse_ascii_number, position_width, write_ascii_number,
    BlockKind, BlockPos, Format, DEFAULT_BLOCK_SIZE, DEL_BYTE, EOR_BYTE, LEGACY_VERSION,
    MAX_KEY_SIZE, MIN_HEADER_READ, MODERN_VERSION,
};

const BLOCK_SIZE_FIELD: std::ops::Range<usize> = 41..46;
const RECORD_LENGTH_FIELD: std::ops::Range<usize> = 64..69;
const TEXT_NAME_START: usize = 101;
const LEGACY_TEXT_NAME_END: usize = 165;

/// Block sizes are kept below this so a cached block size fits in a byte of
/// 256-byte units.
pub const MAX_BLOCK_SIZE: usize = 0xFF00;

/// Fixed parameters of an index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Version number from offsets 98..100
    pub version: u8,
    /// Block size in bytes
    pub block_size: usize,
    /// Key length in bytes
    pub key_len: usize,
    /// Duplicate keys allowed
    pub duplicates: bool,
    /// Record length of a fixed-record file
    pub fixed_record_len: Option<usize>,
    /// Associated record file name as stored
    pub text_name: String,
    /// Text name is relative to the index file's directory
    pub text_relative: bool,
}

/// Chain heads and allocation mark stored in the header block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pointers {
    /// First block of the free-block chain
    pub free_head: BlockPos,
    /// First `F` block of the free record-slot list
    pub slot_head: BlockPos,
    /// Root block of the tree
    pub root: BlockPos,
    /// Last block ever allocated
    pub high_water: BlockPos,
}

impl FileHeader {
    /// Header for a new file with the default block size
    pub fn new(key_len: usize, format: Format) -> Self {
        Self {
            version: match format {
                Format::Modern => MODERN_VERSION,
                Format::Legacy => LEGACY_VERSION,
            },
            block_size: DEFAULT_BLOCK_SIZE,
            key_len,
            duplicates: false,
            fixed_record_len: None,
            text_name: String::new(),
            text_relative: false,
        }
    }

    /// Entry format implied by the version
    pub fn format(&self) -> Format {
        Format::from_version(self.version)
    }

    /// Block geometry of the file
    pub fn layout(&self) -> Layout {
        Layout::new(self.key_len, self.block_size, self.format())
    }

    /// Parse and validate a header read from block 0.
    ///
    /// `data` holds the bytes actually read; fewer than 512 is rejected.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_READ {
            return Err(IndexError::corrupt(format!(
                "header block is {} bytes, need at least {}",
                data.len(),
                MIN_HEADER_READ
            )));
        }

        let digit = |b: u8| b as i32 - b'0' as i32;
        let version = if data[99] != b' ' {
            let mut v = digit(data[99]);
            if data[98] != b' ' {
                v += digit(data[98]) * 10;
            }
            v
        } else {
            0
        };

        let flag = data[57];
        let flag_ok = match version {
            v if v > 10 => false,
            9 | 10 => flag == b' ' || flag == b'S',
            7 | 8 => flag == b'V' || flag == b'S',
            6 => flag == b'V' || flag == b'F',
            _ => flag == b'D',
        };
        if data[0] != BlockKind::Header.as_byte() || data[100] != EOR_BYTE || !flag_ok {
            return Err(IndexError::corrupt("not an index file header"));
        }
        let version = version.max(0) as u8;
        let format = Format::from_version(version);

        let fixed_record_len = if flag == b'F' || flag == b'S' {
            let len = parse_ascii_number(&data[RECORD_LENGTH_FIELD])
                .ok_or_else(|| IndexError::corrupt("unreadable fixed record length"))?;
            Some(len)
        } else {
            None
        };

        let block_size = parse_ascii_number(&data[BLOCK_SIZE_FIELD])
            .ok_or_else(|| IndexError::corrupt("unreadable block size"))?;

        let mut key_len = digit(data[59]);
        match data[58] {
            b' ' => {}
            c @ b'A'..=b'Z' => key_len += (c - b'A') as i32 * 10 + 100,
            c => key_len += digit(c) * 10,
        }
        if key_len < 1 || key_len > MAX_KEY_SIZE as i32 {
            return Err(IndexError::corrupt(format!(
                "header key length {} out of range",
                key_len
            )));
        }
        let key_len = key_len as usize;

        let layout = Layout::new(key_len, block_size, format);
        if block_size < MIN_HEADER_READ
            || block_size > MAX_BLOCK_SIZE
            || block_size < layout.min_block_size()
        {
            return Err(IndexError::corrupt(format!(
                "block size {} unusable for key length {}",
                block_size, key_len
            )));
        }

        let name = match format {
            Format::Modern => {
                let end = data.len().min(block_size);
                let len = data[TEXT_NAME_START..end]
                    .iter()
                    .position(|&b| b == EOR_BYTE)
                    .ok_or_else(|| IndexError::corrupt("text name is not terminated"))?;
                &data[TEXT_NAME_START..TEXT_NAME_START + len]
            }
            Format::Legacy => {
                let mut end = LEGACY_TEXT_NAME_END;
                while end > TEXT_NAME_START && data[end - 1] == b' ' {
                    end -= 1;
                }
                &data[TEXT_NAME_START..end]
            }
        };

        Ok(Self {
            version,
            block_size,
            key_len,
            duplicates: data[56] == b'D',
            fixed_record_len,
            text_name: String::from_utf8_lossy(name).into_owned(),
            text_relative: data[55] == b'T',
        })
    }

    /// Block image for a new file: this header with null chain pointers.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let format = self.format();
        if self.key_len == 0 || self.key_len > MAX_KEY_SIZE {
            return Err(IndexError::BadKeyLength {
                expected: MAX_KEY_SIZE,
                found: self.key_len,
            });
        }
        let name = self.text_name.as_bytes();
        let name_room = match format {
            Format::Modern => self.block_size.saturating_sub(TEXT_NAME_START + 1),
            Format::Legacy => LEGACY_TEXT_NAME_END - TEXT_NAME_START,
        };
        if name.len() > name_room || name.contains(&EOR_BYTE) {
            return Err(IndexError::InvalidName(self.text_name.clone()));
        }

        let mut blk = vec![DEL_BYTE; self.block_size];
        blk[0] = BlockKind::Header.as_byte();
        blk[1..25].fill(0);
        blk[25..100].fill(b' ');
        write_ascii_number(self.block_size, &mut blk[BLOCK_SIZE_FIELD]);
        blk[54] = b'L';
        if self.text_relative {
            blk[55] = b'T';
        }
        if self.duplicates {
            blk[56] = b'D';
        }
        blk[57] = match (format, self.fixed_record_len) {
            (_, Some(_)) => b'S',
            (Format::Modern, None) => b' ',
            (Format::Legacy, None) => b'V',
        };
        if self.key_len > 99 {
            blk[58] = b'A' + ((self.key_len - 100) / 10) as u8;
        } else if self.key_len > 9 {
            blk[58] = b'0' + (self.key_len / 10) as u8;
        }
        blk[59] = b'0' + (self.key_len % 10) as u8;
        if let Some(len) = self.fixed_record_len {
            write_ascii_number(len, &mut blk[RECORD_LENGTH_FIELD]);
        }
        write_ascii_number(self.version as usize, &mut blk[98..100]);
        blk[100] = EOR_BYTE;

        let end = TEXT_NAME_START + name.len();
        blk[TEXT_NAME_START..end].copy_from_slice(name);
        match format {
            Format::Modern => blk[end] = EOR_BYTE,
            Format::Legacy => blk[end..LEGACY_TEXT_NAME_END].fill(b' '),
        }

        Pointers::default().write(format, &mut blk)?;
        Ok(blk)
    }
}

impl Pointers {
    fn offsets(format: Format) -> [usize; 4] {
        match format {
            Format::Modern => [1, 7, 13, 19],
            Format::Legacy => [1, 10, 19, 28],
        }
    }

    /// Read the pointers from a header block
    pub fn read(format: Format, blk: &[u8]) -> Self {
        let [free, slot, root, high] = Self::offsets(format);
        let at = |off: usize| BlockPos::new(decode_position(format, &blk[off..]));
        Self {
            free_head: at(free),
            slot_head: at(slot),
            root: at(root),
            high_water: at(high),
        }
    }

    /// Write the pointers into a header block
    pub fn write(&self, format: Format, blk: &mut [u8]) -> Result<()> {
        let offsets = Self::offsets(format);
        let values = [self.free_head, self.slot_head, self.root, self.high_water];
        let width = position_width(format);
        for (off, pos) in offsets.iter().zip(values.iter()) {
            encode_position(format, pos.offset(), &mut blk[*off..*off + width])?;
        }
        Ok(())
    }
}
