//! Read-only walks over a whole file: statistics, a JSON-friendly tree dump
//! and a structural check.

use crate::block::{decode_deleted, KeyEntry, Node};
use crate::btree::tree::TreeOp;
use crate::buffer::Role;
use crate::error::{IndexError, Result};
use crate::types::{BlockPos, MAX_LEVEL};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One tree block, for visualization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// File offset of the block
    pub block: u64,
    /// Whether this is a leaf block
    pub is_leaf: bool,
    /// Keys in block order
    pub keys: Vec<String>,
    /// Record position of each key
    pub records: Vec<u64>,
    /// Child blocks (branches only)
    pub children: Vec<TreeNode>,
}

/// Shape and occupancy of an index file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Levels in the tree, 0 when empty
    pub height: usize,
    /// Key entries in leaves and branches
    pub entries: u64,
    pub leaf_blocks: u64,
    pub branch_blocks: u64,
    /// Blocks on the deleted-block chain
    pub free_blocks: u64,
    /// Blocks on the record-slot chain
    pub slot_blocks: u64,
    /// Record positions waiting for reuse
    pub free_slots: u64,
    /// Blocks in the file, header included
    pub total_blocks: u64,
    pub block_size: usize,
    pub key_len: usize,
}

struct Bounds<'e> {
    lower: Option<&'e KeyEntry>,
    upper: Option<&'e KeyEntry>,
}

impl TreeOp<'_> {
    /// Count blocks and entries. With `check` set, every ordering and shape
    /// rule is verified on the way and the first violation is returned as
    /// [`IndexError::IndexCorrupt`].
    pub(crate) fn survey(&mut self, check: bool) -> Result<IndexStats> {
        let layout = self.session.layout;
        let pointers = self.session.pointers;
        let total_blocks = pointers.high_water.offset() / layout.block_size as u64 + 1;
        let mut stats = IndexStats {
            total_blocks,
            block_size: layout.block_size,
            key_len: layout.key_len,
            ..IndexStats::default()
        };

        let root = pointers.root;
        if !root.is_null() {
            let mut leaf_depth = None;
            let bounds = Bounds { lower: None, upper: None };
            self.survey_node(root, 1, &bounds, check, &mut leaf_depth, &mut stats)?;
            stats.height = leaf_depth.unwrap_or(0);
        }

        let mut pos = pointers.free_head;
        while !pos.is_null() {
            stats.free_blocks += 1;
            if stats.free_blocks > total_blocks {
                return Err(IndexError::corrupt("deleted-block chain loops"));
            }
            self.session.get(Role::Sibling, pos, true)?;
            pos = decode_deleted(&layout, self.session.block(Role::Sibling)?, pos)?;
        }

        let mut pos = pointers.slot_head;
        while !pos.is_null() {
            stats.slot_blocks += 1;
            if stats.slot_blocks > total_blocks {
                return Err(IndexError::corrupt("record slot chain loops"));
            }
            let node = self.session.read_slot_node(pos)?;
            if check && node.records.is_empty() {
                return Err(IndexError::corrupt(format!("record slot block {} is empty", pos)));
            }
            stats.free_slots += node.records.len() as u64;
            pos = node.next;
        }

        let accounted = 1 + stats.leaf_blocks + stats.branch_blocks + stats.free_blocks + stats.slot_blocks;
        if check && accounted != total_blocks {
            return Err(IndexError::corrupt(format!(
                "{} blocks in the file but {} reachable",
                total_blocks, accounted
            )));
        }
        Ok(stats)
    }

    fn survey_node(
        &mut self,
        pos: BlockPos,
        depth: usize,
        bounds: &Bounds<'_>,
        check: bool,
        leaf_depth: &mut Option<usize>,
        stats: &mut IndexStats,
    ) -> Result<()> {
        if depth > MAX_LEVEL + 1 {
            return Err(IndexError::corrupt(format!(
                "tree is deeper than {} levels",
                MAX_LEVEL
            )));
        }
        let node = self.session.read_node(Role::Current, pos)?;
        stats.entries += node.len() as u64;
        if check && node.is_empty() {
            return Err(IndexError::corrupt(format!("tree block {} holds no entries", pos)));
        }

        match node {
            Node::Leaf(leaf) => {
                stats.leaf_blocks += 1;
                if check {
                    if *leaf_depth.get_or_insert(depth) != depth {
                        return Err(IndexError::corrupt(format!(
                            "leaf {} sits at depth {}, others at {}",
                            pos,
                            depth,
                            leaf_depth.unwrap_or(0)
                        )));
                    }
                    self.check_order(pos, leaf.entries.iter(), bounds)?;
                } else {
                    leaf_depth.get_or_insert(depth);
                }
            }
            Node::Branch(branch) => {
                stats.branch_blocks += 1;
                if check {
                    self.check_order(pos, branch.entries.iter().map(|(e, _)| e), bounds)?;
                }
                for i in 0..=branch.entries.len() {
                    let child = branch.child(i).unwrap_or(BlockPos::NULL);
                    if child.is_null() {
                        return Err(IndexError::corrupt(format!(
                            "branch {} has a null child {}",
                            pos, i
                        )));
                    }
                    let inner = Bounds {
                        lower: if i == 0 { bounds.lower } else { Some(&branch.entries[i - 1].0) },
                        upper: branch.entries.get(i).map(|(e, _)| e).or(bounds.upper),
                    };
                    self.survey_node(child, depth + 1, &inner, check, leaf_depth, stats)?;
                }
            }
        }
        Ok(())
    }

    fn check_order<'e>(
        &self,
        pos: BlockPos,
        entries: impl Iterator<Item = &'e KeyEntry>,
        bounds: &Bounds<'e>,
    ) -> Result<()> {
        let mut prev = bounds.lower;
        for entry in entries.chain(bounds.upper) {
            if let Some(prev) = prev {
                let ord = prev.compare(entry, self.collation, true);
                let keys_equal = self.collation.compare(&prev.key, &entry.key) == Ordering::Equal;
                if ord != Ordering::Less || (keys_equal && !self.duplicates) {
                    return Err(IndexError::corrupt(format!(
                        "entries out of order in block {}",
                        pos
                    )));
                }
            }
            prev = Some(entry);
        }
        Ok(())
    }

    /// Tree below the root, or `None` for an empty file
    pub(crate) fn export(&mut self) -> Result<Option<TreeNode>> {
        let root = self.session.root();
        if root.is_null() {
            return Ok(None);
        }
        self.export_node(root, 1).map(Some)
    }

    fn export_node(&mut self, pos: BlockPos, depth: usize) -> Result<TreeNode> {
        if depth > MAX_LEVEL + 1 {
            return Err(IndexError::corrupt(format!(
                "tree is deeper than {} levels",
                MAX_LEVEL
            )));
        }
        match self.session.read_node(Role::Current, pos)? {
            Node::Leaf(leaf) => Ok(TreeNode {
                block: pos.offset(),
                is_leaf: true,
                keys: leaf.entries.iter().map(|e| display_key(&e.key)).collect(),
                records: leaf.entries.iter().map(|e| e.record).collect(),
                children: Vec::new(),
            }),
            Node::Branch(branch) => {
                let mut children = Vec::with_capacity(branch.entries.len() + 1);
                children.push(self.export_node(branch.first, depth + 1)?);
                for (_, child) in &branch.entries {
                    children.push(self.export_node(*child, depth + 1)?);
                }
                Ok(TreeNode {
                    block: pos.offset(),
                    is_leaf: false,
                    keys: branch.entries.iter().map(|(e, _)| display_key(&e.key)).collect(),
                    records: branch.entries.iter().map(|(e, _)| e.record).collect(),
                    children,
                })
            }
        }
    }
}

fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).trim_end().to_string()
}
