//! Decoded forms of the tree and slot-list blocks.
//!
//! Blocks are decoded into owned nodes, edited, and encoded back over the
//! whole block image. Layouts:
//!
//! ```text
//! V  [V][entry 0 whole][entry 1 compressed]...[sentinel][filler]
//! U  [U][child 0][key 0][rec 0][child 1][key 1][rec 1][child 2]...[sentinel]
//! F  [F][next F block][record][record]...[sentinel]
//! D  [D][next free block][filler]
//! ```
//!
//! Modern blocks may be filled to the last byte, in which case the sentinel
//! is omitted. Legacy blocks always end with one.

use crate::block::entry::{decode_entry, encode_entry, encoded_len};
use crate::block::{KeyEntry, Layout};
use crate::error::{IndexError, Result};
use crate::types::{decode_position, encode_position, BlockKind, BlockPos, Format, DEL_BYTE};

/// Leaf block: ordered key entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries in key order
    pub entries: Vec<KeyEntry>,
}

impl LeafNode {
    /// Create a leaf from ordered entries
    pub fn new(entries: Vec<KeyEntry>) -> Self {
        Self { entries }
    }

    /// Encoded size, tag included, sentinel excluded
    pub fn encoded_len(&self, layout: &Layout) -> usize {
        Self::prefix_lens(layout, &self.entries).last().copied().unwrap_or(1)
    }

    /// True when the leaf fits in one block
    pub fn fits(&self, layout: &Layout) -> bool {
        layout.fits(self.encoded_len(layout))
    }

    /// Number of leading entries of `entries` that fit in one block
    pub fn fitting_prefix(layout: &Layout, entries: &[KeyEntry]) -> usize {
        Self::prefix_lens(layout, entries)
            .iter()
            .take_while(|&&len| layout.fits(len))
            .count()
    }

    /// Running encoded length after each entry
    fn prefix_lens(layout: &Layout, entries: &[KeyEntry]) -> Vec<usize> {
        let mut total = 1;
        let mut prev: Option<&KeyEntry> = None;
        entries
            .iter()
            .map(|entry| {
                total += encoded_len(layout, prev, entry);
                prev = Some(entry);
                total
            })
            .collect()
    }

    /// Decode a `V` block
    pub fn decode(layout: &Layout, data: &[u8]) -> Result<Self> {
        expect_tag(data, BlockKind::Leaf)?;
        let end = data.len().min(layout.block_size);
        let sentinel = layout.sentinel();
        let mut entries: Vec<KeyEntry> = Vec::new();
        let mut off = 1;
        while off < end && data[off] != sentinel {
            let (entry, used) = decode_entry(layout, entries.last(), &data[off..end])?;
            entries.push(entry);
            off += used;
        }
        if off >= end && layout.format == Format::Legacy {
            return Err(IndexError::corrupt("leaf block has no end marker"));
        }
        Ok(Self { entries })
    }

    /// Encode over a whole block image
    pub fn encode(&self, layout: &Layout, out: &mut [u8]) -> Result<()> {
        let mut body = Vec::with_capacity(layout.block_size);
        body.push(BlockKind::Leaf.as_byte());
        let mut prev: Option<&KeyEntry> = None;
        for entry in &self.entries {
            encode_entry(layout, prev, entry, &mut body)?;
            prev = Some(entry);
        }
        finish_block(layout, body, out)
    }
}

/// Branch block: separator entries and child pointers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNode {
    /// Child holding keys below the first separator
    pub first: BlockPos,
    /// Separators, each with the child holding keys above it
    pub entries: Vec<(KeyEntry, BlockPos)>,
}

impl BranchNode {
    /// Create a branch
    pub fn new(first: BlockPos, entries: Vec<(KeyEntry, BlockPos)>) -> Self {
        Self { first, entries }
    }

    /// Child `i`, where child 0 is the leftmost pointer
    pub fn child(&self, i: usize) -> Option<BlockPos> {
        if i == 0 {
            Some(self.first)
        } else {
            self.entries.get(i - 1).map(|(_, child)| *child)
        }
    }

    /// Rightmost child
    pub fn last_child(&self) -> BlockPos {
        self.entries.last().map_or(self.first, |(_, child)| *child)
    }

    /// Encoded size, tag included, sentinel excluded
    pub fn encoded_len(&self, layout: &Layout) -> usize {
        layout.branch_start() + self.entries.len() * layout.branch_entry_size()
    }

    /// True when the branch fits in one block
    pub fn fits(&self, layout: &Layout) -> bool {
        layout.fits(self.encoded_len(layout))
    }

    /// Decode a `U` block
    pub fn decode(layout: &Layout, data: &[u8]) -> Result<Self> {
        expect_tag(data, BlockKind::Branch)?;
        let end = data.len().min(layout.block_size);
        let width = layout.pos_width();
        let key_len = layout.key_len;
        let step = layout.branch_entry_size();
        if end < layout.branch_start() {
            return Err(IndexError::corrupt("branch block too short"));
        }
        let first = BlockPos::new(decode_position(layout.format, &data[1..1 + width]));

        let sentinel = layout.sentinel();
        let mut entries = Vec::new();
        let mut off = layout.branch_start();
        while off < end && data[off] != sentinel {
            if off + step > end {
                return Err(IndexError::corrupt("branch entry runs past end of block"));
            }
            let key = data[off..off + key_len].to_vec();
            let record = decode_position(layout.format, &data[off + key_len..off + key_len + width]);
            let child = decode_position(layout.format, &data[off + key_len + width..off + step]);
            entries.push((KeyEntry::new(key, record), BlockPos::new(child)));
            off += step;
        }
        if off >= end && layout.format == Format::Legacy {
            return Err(IndexError::corrupt("branch block has no end marker"));
        }
        Ok(Self { first, entries })
    }

    /// Encode over a whole block image
    pub fn encode(&self, layout: &Layout, out: &mut [u8]) -> Result<()> {
        let width = layout.pos_width();
        let mut body = vec![0u8; self.encoded_len(layout)];
        body[0] = BlockKind::Branch.as_byte();
        encode_position(layout.format, self.first.offset(), &mut body[1..1 + width])?;
        let mut off = layout.branch_start();
        for (entry, child) in &self.entries {
            body[off..off + layout.key_len].copy_from_slice(&entry.key);
            off += layout.key_len;
            encode_position(layout.format, entry.record, &mut body[off..off + width])?;
            off += width;
            encode_position(layout.format, child.offset(), &mut body[off..off + width])?;
            off += width;
        }
        finish_block(layout, body, out)
    }
}

/// Node of the free record-slot list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotNode {
    /// Next `F` block in the chain
    pub next: BlockPos,
    /// Reusable record positions, oldest first
    pub records: Vec<u64>,
}

impl SlotNode {
    /// Encoded size, tag included, sentinel excluded
    pub fn encoded_len(&self, layout: &Layout) -> usize {
        1 + layout.pos_width() * (1 + self.records.len())
    }

    /// True when one more record fits
    pub fn has_room(&self, layout: &Layout) -> bool {
        layout.fits(self.encoded_len(layout) + layout.pos_width())
    }

    /// Decode an `F` block
    pub fn decode(layout: &Layout, data: &[u8]) -> Result<Self> {
        expect_tag(data, BlockKind::Slots)?;
        let end = data.len().min(layout.block_size);
        let width = layout.pos_width();
        let next = BlockPos::new(decode_position(layout.format, &data[1..1 + width]));
        let sentinel = layout.sentinel();
        let mut records = Vec::new();
        let mut off = 1 + width;
        while off < end && data[off] != sentinel {
            if off + width > end {
                return Err(IndexError::corrupt("slot entry runs past end of block"));
            }
            records.push(decode_position(layout.format, &data[off..off + width]));
            off += width;
        }
        Ok(Self { next, records })
    }

    /// Encode over a whole block image
    pub fn encode(&self, layout: &Layout, out: &mut [u8]) -> Result<()> {
        let width = layout.pos_width();
        let mut body = vec![0u8; self.encoded_len(layout)];
        body[0] = BlockKind::Slots.as_byte();
        encode_position(layout.format, self.next.offset(), &mut body[1..1 + width])?;
        for (i, record) in self.records.iter().enumerate() {
            let off = 1 + width * (i + 1);
            encode_position(layout.format, *record, &mut body[off..off + width])?;
        }
        finish_block(layout, body, out)
    }
}

/// A tree block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Branch(BranchNode),
}

impl Node {
    /// Decode a `U` or `V` block found at `at`
    pub fn decode(layout: &Layout, data: &[u8], at: BlockPos) -> Result<Self> {
        match data.first().copied().and_then(BlockKind::from_byte) {
            Some(BlockKind::Leaf) => Ok(Node::Leaf(LeafNode::decode(layout, data)?)),
            Some(BlockKind::Branch) => Ok(Node::Branch(BranchNode::decode(layout, data)?)),
            _ => Err(IndexError::corrupt(format!(
                "block {} is not a tree block (tag {:#04x})",
                at,
                data.first().copied().unwrap_or(0)
            ))),
        }
    }

    /// Encode over a whole block image
    pub fn encode(&self, layout: &Layout, out: &mut [u8]) -> Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.encode(layout, out),
            Node::Branch(branch) => branch.encode(layout, out),
        }
    }

    /// True when the node fits in one block
    pub fn fits(&self, layout: &Layout) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.fits(layout),
            Node::Branch(branch) => branch.fits(layout),
        }
    }

    /// Number of key entries
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Branch(branch) => branch.entries.len(),
        }
    }

    /// True when the node holds no key entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write a deleted-block image: tag plus the next free block.
pub fn encode_deleted(layout: &Layout, next: BlockPos, out: &mut [u8]) -> Result<()> {
    let width = layout.pos_width();
    out.fill(DEL_BYTE);
    out[0] = BlockKind::Deleted.as_byte();
    encode_position(layout.format, next.offset(), &mut out[1..1 + width])?;
    if layout.format == Format::Legacy {
        out[1 + width] = layout.sentinel();
    }
    Ok(())
}

/// Read the next link of a deleted block found at `at`.
pub fn decode_deleted(layout: &Layout, data: &[u8], at: BlockPos) -> Result<BlockPos> {
    if data.first() != Some(&BlockKind::Deleted.as_byte()) {
        return Err(IndexError::corrupt(format!(
            "free chain block {} is not a deleted block",
            at
        )));
    }
    let width = layout.pos_width();
    Ok(BlockPos::new(decode_position(layout.format, &data[1..1 + width])))
}

fn expect_tag(data: &[u8], kind: BlockKind) -> Result<()> {
    match data.first() {
        Some(&tag) if tag == kind.as_byte() => Ok(()),
        Some(&tag) => Err(IndexError::corrupt(format!(
            "expected {:?} block, found tag {:#04x}",
            kind, tag
        ))),
        None => Err(IndexError::corrupt("empty block image")),
    }
}

/// Copy `body` into the block image, pad with filler and place the sentinel.
fn finish_block(layout: &Layout, body: Vec<u8>, out: &mut [u8]) -> Result<()> {
    let len = body.len();
    if !layout.fits(len) || out.len() < len {
        return Err(IndexError::internal(format!(
            "encoded block of {} bytes does not fit {} byte blocks",
            len, layout.block_size
        )));
    }
    out[..len].copy_from_slice(&body);
    out[len..].fill(DEL_BYTE);
    if len < out.len() {
        out[len] = layout.sentinel();
    }
    Ok(())
}
