//! Record and block position encodings.
//!
//! Modern files store positions as 6-byte big-endian binary numbers. Legacy
//! files store them as 9 ASCII digits, right aligned and padded on the left
//! with blanks. Both encodings sort the same way as the numbers they hold.

use crate::error::{IndexError, Result};
use crate::types::Format;

/// Largest position representable in a 6-byte field (top bit reserved)
pub const MAX_MODERN_POSITION: u64 = 0x7FFF_FFFF_FFFF;

/// Largest position representable in a 9-digit field
pub const MAX_LEGACY_POSITION: u64 = 999_999_999;

/// Width in bytes of a position field
pub const fn position_width(format: Format) -> usize {
    match format {
        Format::Modern => 6,
        Format::Legacy => 9,
    }
}

/// Largest position the format can store
pub const fn max_position(format: Format) -> u64 {
    match format {
        Format::Modern => MAX_MODERN_POSITION,
        Format::Legacy => MAX_LEGACY_POSITION,
    }
}

/// Write `value` into `out`, which must be exactly one field wide.
pub fn encode_position(format: Format, value: u64, out: &mut [u8]) -> Result<()> {
    if value > max_position(format) {
        return Err(IndexError::invalid_key(format!(
            "position {} does not fit the {:?} format",
            value, format
        )));
    }
    match format {
        Format::Modern => {
            let bytes = value.to_be_bytes();
            out[..6].copy_from_slice(&bytes[2..8]);
        }
        Format::Legacy => {
            let mut rest = value;
            let mut i = 9;
            loop {
                i -= 1;
                out[i] = b'0' + (rest % 10) as u8;
                rest /= 10;
                if rest == 0 || i == 0 {
                    break;
                }
            }
            out[..i].fill(b' ');
        }
    }
    Ok(())
}

/// Read a position field. Legacy fields ignore every non-digit byte.
pub fn decode_position(format: Format, bytes: &[u8]) -> u64 {
    match format {
        Format::Modern => bytes[..6]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64),
        Format::Legacy => bytes[..9]
            .iter()
            .filter(|b| b.is_ascii_digit())
            .fold(0u64, |acc, &b| acc * 10 + (b - b'0') as u64),
    }
}

/// Parse a blank-padded ASCII decimal field such as the header block size.
pub fn parse_ascii_number(bytes: &[u8]) -> Option<usize> {
    let mut value: usize = 0;
    let mut seen = false;
    for &b in bytes {
        match b {
            b' ' if !seen => continue,
            b'0'..=b'9' => {
                seen = true;
                value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
            }
            _ => return None,
        }
    }
    seen.then_some(value)
}

/// Write `value` right aligned and blank padded into `out`.
pub fn write_ascii_number(value: usize, out: &mut [u8]) {
    let digits = value.to_string();
    let width = out.len();
    out.fill(b' ');
    let take = digits.len().min(width);
    out[width - take..].copy_from_slice(&digits.as_bytes()[digits.len() - take..]);
}
