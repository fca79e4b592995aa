//! Collation tables for key comparison.
//!
//! A collation maps every byte to a priority. Keys compare byte by byte on
//! those priorities; with no table the raw byte values are used.

use std::cmp::Ordering;
use std::fmt;

/// 256-entry byte priority table
#[derive(Clone, Default)]
pub struct Collation {
    priority: Option<Box<[u8; 256]>>,
}

impl Collation {
    /// Raw byte order
    pub fn binary() -> Self {
        Self { priority: None }
    }

    /// Order bytes by the given priority table
    pub fn from_table(table: [u8; 256]) -> Self {
        Self {
            priority: Some(Box::new(table)),
        }
    }

    /// ASCII order with lower-case letters sorting equal to upper-case ones
    pub fn case_insensitive() -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (i as u8).to_ascii_uppercase();
        }
        Self::from_table(table)
    }

    /// True when no table is installed
    pub fn is_binary(&self) -> bool {
        self.priority.is_none()
    }

    /// Priority of one byte
    pub fn weight(&self, b: u8) -> u8 {
        match &self.priority {
            Some(table) => table[b as usize],
            None => b,
        }
    }

    /// Compare two keys of equal length
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.priority {
            None => a.cmp(b),
            Some(table) => {
                for (&x, &y) in a.iter().zip(b.iter()) {
                    match table[x as usize].cmp(&table[y as usize]) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
        }
    }

    /// Byte with the highest priority (0xFF unless some byte ranks above it)
    pub fn highest(&self) -> u8 {
        let mut best = 0xFFu8;
        for b in 0..=255u8 {
            if self.weight(b) > self.weight(best) {
                best = b;
            }
        }
        best
    }

    /// Byte with the lowest priority (0x00 unless some byte ranks below it)
    pub fn lowest(&self) -> u8 {
        let mut best = 0x00u8;
        for b in 0..=255u8 {
            if self.weight(b) < self.weight(best) {
                best = b;
            }
        }
        best
    }

    /// Byte ranking just above `b`; the highest byte when nothing is between
    pub fn next_above(&self, b: u8) -> u8 {
        if self.is_binary() {
            return b.saturating_add(1);
        }
        let floor = self.weight(b);
        let mut best = self.highest();
        for c in 0..=255u8 {
            let w = self.weight(c);
            if w > floor && w < self.weight(best) {
                best = c;
            }
        }
        best
    }
}

impl fmt::Debug for Collation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_binary() {
            write!(f, "Collation(binary)")
        } else {
            write!(f, "Collation(table)")
        }
    }
}
