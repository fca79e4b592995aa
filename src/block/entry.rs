//! Key entries and the front-compression codec.
//!
//! A key entry is a fixed-length key plus the record position it indexes.
//! In modern leaves every entry after the first is stored as:
//!
//! ```text
//! [shared: u8][key[shared..]][record position: 6 bytes]
//! ```
//!
//! where `shared` is the length of the prefix the key has in common with the
//! previous key of the block. Legacy blocks store every entry whole.

use crate::block::{Collation, Layout};
use crate::error::{IndexError, Result};
use crate::types::{decode_position, encode_position, Format};
use std::cmp::Ordering;

/// Largest shared-prefix count ever written. Keeps the count byte below the
/// modern sentinel even for 255-byte keys.
pub const MAX_SHARED: usize = 254;

/// A key with the record position it points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyEntry {
    /// Key bytes, always exactly the file's key length
    pub key: Vec<u8>,
    /// Record position
    pub record: u64,
}

impl KeyEntry {
    /// Create a new entry
    pub fn new(key: Vec<u8>, record: u64) -> Self {
        Self { key, record }
    }

    /// Order two entries. `exact` breaks ties between equal keys on the
    /// record position.
    pub fn compare(&self, other: &KeyEntry, collation: &Collation, exact: bool) -> Ordering {
        match collation.compare(&self.key, &other.key) {
            Ordering::Equal if exact => self.record.cmp(&other.record),
            ord => ord,
        }
    }
}

/// Length of the common prefix of two keys, capped at [`MAX_SHARED`].
pub fn shared_prefix(prev: &[u8], key: &[u8]) -> usize {
    prev.iter()
        .zip(key.iter())
        .take_while(|(a, b)| a == b)
        .count()
        .min(MAX_SHARED)
}

/// Encoded size of `entry` when it follows `prev` in a block.
pub fn encoded_len(layout: &Layout, prev: Option<&KeyEntry>, entry: &KeyEntry) -> usize {
    match prev {
        Some(prev) if layout.format == Format::Modern => {
            1 + layout.entry_size() - shared_prefix(&prev.key, &entry.key)
        }
        _ => layout.entry_size(),
    }
}

/// Append the encoding of `entry` to `out`.
pub fn encode_entry(
    layout: &Layout,
    prev: Option<&KeyEntry>,
    entry: &KeyEntry,
    out: &mut Vec<u8>,
) -> Result<()> {
    let shared = match prev {
        Some(prev) if layout.format == Format::Modern => {
            let shared = shared_prefix(&prev.key, &entry.key);
            out.push(shared as u8);
            shared
        }
        _ => 0,
    };
    out.extend_from_slice(&entry.key[shared..]);
    let start = out.len();
    out.resize(start + layout.pos_width(), 0);
    encode_position(layout.format, entry.record, &mut out[start..])
}

/// Decode one entry at the start of `bytes`, returning it with the number of
/// bytes consumed.
pub fn decode_entry(
    layout: &Layout,
    prev: Option<&KeyEntry>,
    bytes: &[u8],
) -> Result<(KeyEntry, usize)> {
    let key_len = layout.key_len;
    let (shared, body) = match prev {
        Some(prev) if layout.format == Format::Modern => {
            let shared = *bytes
                .first()
                .ok_or_else(|| IndexError::corrupt("entry runs past end of block"))?
                as usize;
            if shared > key_len {
                return Err(IndexError::corrupt(format!(
                    "shared prefix {} exceeds key length {}",
                    shared, key_len
                )));
            }
            (Some((shared, prev)), &bytes[1..])
        }
        _ => (None, bytes),
    };
    let suffix_len = key_len - shared.map_or(0, |(s, _)| s);
    let needed = suffix_len + layout.pos_width();
    if body.len() < needed {
        return Err(IndexError::corrupt("entry runs past end of block"));
    }

    let mut key = Vec::with_capacity(key_len);
    if let Some((shared, prev)) = shared {
        key.extend_from_slice(&prev.key[..shared]);
    }
    key.extend_from_slice(&body[..suffix_len]);
    let record = decode_position(layout.format, &body[suffix_len..needed]);
    let consumed = needed + (bytes.len() - body.len());
    Ok((KeyEntry { key, record }, consumed))
}

/// Bring a caller key to the file's key length.
///
/// Short keys are padded with `pad`. Long keys are truncated when
/// `truncate` is set; otherwise the excess must be blanks.
pub fn normalize_key(raw: &[u8], key_len: usize, pad: u8, truncate: bool) -> Result<Vec<u8>> {
    let mut key = if raw.len() > key_len {
        if !truncate && raw[key_len..].iter().any(|&b| b != b' ') {
            return Err(IndexError::invalid_key(format!(
                "key of {} bytes exceeds key length {}",
                raw.len(),
                key_len
            )));
        }
        raw[..key_len].to_vec()
    } else {
        raw.to_vec()
    };
    key.resize(key_len, pad);
    Ok(key)
}
