//! Tree descent.
//!
//! A [`TreeOp`] wraps the session of one call together with the file's
//! collation and duplicate policy. Searches produce a [`Descent`]: the branch
//! path from the root plus the position the search stopped at. Positions
//! are either an entry of a leaf or a separator of a branch, since branch
//! separators are real entries of the index.

use crate::block::{BranchNode, Collation, KeyEntry, LeafNode, Node};
use crate::buffer::{EndMode, Role, Session};
use crate::error::{IndexError, Result};
use crate::types::{BlockPos, KeyState, MAX_LEVEL};
use std::cmp::Ordering;

/// One branch level of a descent: the block and the separator index the
/// search went down in front of (`child(idx)` was followed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    pub block: BlockPos,
    pub idx: usize,
}

/// Where a search ended
#[derive(Debug, Clone)]
pub(crate) struct Descent {
    pub state: KeyState,
    /// Branch levels from the root down
    pub path: Vec<Step>,
    /// Block holding the position; a leaf unless `on_branch`
    pub block: BlockPos,
    pub idx: usize,
    pub on_branch: bool,
    /// Leaf the search ran off the end of before moving to the separator
    /// that follows it
    pub leaf_end: Option<BlockPos>,
    /// An entry with an equal key was compared on the way down
    pub dup: bool,
}

impl Descent {
    fn empty() -> Self {
        Self {
            state: KeyState::BeforeFirst,
            path: Vec::new(),
            block: BlockPos::NULL,
            idx: 0,
            on_branch: false,
            leaf_end: None,
            dup: false,
        }
    }
}

/// Result of scanning one block
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scan {
    /// First entry not less than the target
    pub idx: usize,
    pub found: bool,
    pub dup: bool,
    len: usize,
}

impl Scan {
    fn state(&self) -> KeyState {
        if self.found {
            KeyState::OnKey
        } else if self.idx == self.len {
            KeyState::AfterLast
        } else if self.idx == 0 {
            KeyState::BeforeFirst
        } else {
            KeyState::Between
        }
    }
}

/// Find the first entry of `entries` that is not less than `target`.
///
/// Without `exact` any entry with an equal key is a hit. With `exact` the
/// record position must match too, and equal keys are ordered by record.
pub(crate) fn scan<'e>(
    entries: impl ExactSizeIterator<Item = &'e KeyEntry>,
    target: &KeyEntry,
    collation: &Collation,
    exact: bool,
) -> Scan {
    let len = entries.len();
    let mut dup = false;
    for (idx, entry) in entries.enumerate() {
        match collation.compare(&target.key, &entry.key) {
            Ordering::Greater => continue,
            Ordering::Less => return Scan { idx, found: false, dup, len },
            Ordering::Equal => {
                dup = true;
                if !exact {
                    return Scan { idx, found: true, dup, len };
                }
                match target.record.cmp(&entry.record) {
                    Ordering::Greater => continue,
                    Ordering::Equal => return Scan { idx, found: true, dup, len },
                    Ordering::Less => return Scan { idx, found: false, dup, len },
                }
            }
        }
    }
    Scan { idx: len, found: false, dup, len }
}

/// One index call over the tree of a file
pub(crate) struct TreeOp<'a> {
    pub(crate) session: Session<'a>,
    pub(crate) collation: &'a Collation,
    pub(crate) duplicates: bool,
}

impl<'a> TreeOp<'a> {
    pub(crate) fn new(session: Session<'a>, collation: &'a Collation, duplicates: bool) -> Self {
        Self {
            session,
            collation,
            duplicates,
        }
    }

    /// End the call, writing back the header pointers
    pub(crate) fn finish(self, mode: EndMode) -> Result<()> {
        self.session.finish(mode)
    }

    pub(crate) fn read_leaf(&mut self, role: Role, pos: BlockPos) -> Result<LeafNode> {
        match self.session.read_node(role, pos)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Branch(_) => Err(IndexError::corrupt(format!(
                "expected a leaf at {}, found a branch",
                pos
            ))),
        }
    }

    pub(crate) fn read_branch(&mut self, role: Role, pos: BlockPos) -> Result<BranchNode> {
        match self.session.read_node(role, pos)? {
            Node::Branch(branch) => Ok(branch),
            Node::Leaf(_) => Err(IndexError::corrupt(format!(
                "expected a branch at {}, found a leaf",
                pos
            ))),
        }
    }

    /// Search for `target`.
    ///
    /// A hit on a branch separator stops the search there unless the file
    /// allows duplicates and the search is not exact, in which case it keeps
    /// going left to find the first equal key and falls back to the
    /// separator when the leaves hold none. A miss past the end of a leaf
    /// that is not the last one moves on to the separator that follows the
    /// leaf and reports [`KeyState::Between`].
    pub(crate) fn locate(&mut self, target: &KeyEntry, exact: bool) -> Result<Descent> {
        let root = self.session.root();
        if root.is_null() {
            return Ok(Descent::empty());
        }

        let mut d = Descent::empty();
        let mut first = true;
        let mut last = true;
        let mut dup_level = None;
        let mut pos = root;
        loop {
            match self.session.read_node(Role::Current, pos)? {
                Node::Branch(branch) => {
                    if d.path.len() == MAX_LEVEL {
                        return Err(IndexError::corrupt(format!(
                            "tree is deeper than {} levels",
                            MAX_LEVEL
                        )));
                    }
                    let s = scan(branch.entries.iter().map(|(e, _)| e), target, self.collation, exact);
                    d.dup |= s.dup;
                    d.path.push(Step { block: pos, idx: s.idx });
                    if s.found {
                        if exact || !self.duplicates {
                            d.state = KeyState::OnKey;
                            d.block = pos;
                            d.idx = s.idx;
                            d.on_branch = true;
                            return Ok(d);
                        }
                        dup_level = Some(d.path.len());
                    }
                    let state = s.state();
                    first &= state == KeyState::BeforeFirst;
                    last &= state == KeyState::AfterLast;
                    pos = branch.child(s.idx).ok_or_else(|| {
                        IndexError::corrupt(format!("branch {} has no child {}", pos, s.idx))
                    })?;
                }
                Node::Leaf(leaf) => {
                    let s = scan(leaf.entries.iter(), target, self.collation, exact);
                    d.dup |= s.dup;
                    d.block = pos;
                    d.idx = s.idx;
                    d.state = s.state();

                    if !s.found {
                        if let Some(level) = dup_level {
                            d.path.truncate(level);
                            let step = d.path[level - 1];
                            d.state = KeyState::OnKey;
                            d.block = step.block;
                            d.idx = step.idx;
                            d.on_branch = true;
                            return Ok(d);
                        }
                    }

                    match d.state {
                        KeyState::OnKey | KeyState::Between => {}
                        KeyState::BeforeFirst => {
                            if !first {
                                d.state = KeyState::Between;
                            }
                        }
                        KeyState::AfterLast => {
                            if !last {
                                d.leaf_end = Some(pos);
                                self.successor(&mut d)?;
                                d.state = KeyState::Between;
                            }
                        }
                    }
                    return Ok(d);
                }
            }
        }
    }

    /// Move `d` to the entry that follows its position
    pub(crate) fn successor(&mut self, d: &mut Descent) -> Result<()> {
        if d.on_branch {
            let branch = self.read_branch(Role::Current, d.block)?;
            let right = branch.child(d.idx + 1).ok_or_else(|| {
                IndexError::corrupt(format!("branch {} has no child {}", d.block, d.idx + 1))
            })?;
            d.block = self.leftmost_leaf(right)?;
            d.idx = 0;
            d.on_branch = false;
            d.state = KeyState::OnKey;
            return Ok(());
        }

        let leaf = self.read_leaf(Role::Current, d.block)?;
        if d.idx + 1 < leaf.entries.len() {
            d.idx += 1;
            d.state = KeyState::OnKey;
            return Ok(());
        }
        d.idx = leaf.entries.len();

        for step in d.path.iter().rev() {
            let branch = self.read_branch(Role::Parent, step.block)?;
            if step.idx < branch.entries.len() {
                d.block = step.block;
                d.idx = step.idx;
                d.on_branch = true;
                d.state = KeyState::OnKey;
                return Ok(());
            }
        }
        d.state = KeyState::AfterLast;
        Ok(())
    }

    /// Move `d` to the entry in front of its position
    pub(crate) fn predecessor(&mut self, d: &mut Descent) -> Result<()> {
        if d.on_branch {
            let branch = self.read_branch(Role::Current, d.block)?;
            let left = branch.child(d.idx).ok_or_else(|| {
                IndexError::corrupt(format!("branch {} has no child {}", d.block, d.idx))
            })?;
            let (leaf, len) = self.rightmost_leaf(left)?;
            d.block = leaf;
            d.idx = len - 1;
            d.on_branch = false;
            d.state = KeyState::OnKey;
            return Ok(());
        }

        if d.idx > 0 {
            d.idx -= 1;
            d.state = KeyState::OnKey;
            return Ok(());
        }

        if let Some(step) = d.path.iter().rev().find(|step| step.idx > 0) {
            d.block = step.block;
            d.idx = step.idx - 1;
            d.on_branch = true;
            d.state = KeyState::OnKey;
            return Ok(());
        }
        d.state = KeyState::BeforeFirst;
        Ok(())
    }

    /// Entry at the position of `d`
    pub(crate) fn entry_at(&mut self, d: &Descent) -> Result<KeyEntry> {
        let entry = match self.session.read_node(Role::Current, d.block)? {
            Node::Branch(mut branch) if d.on_branch && d.idx < branch.entries.len() => {
                branch.entries.swap_remove(d.idx).0
            }
            Node::Leaf(mut leaf) if !d.on_branch && d.idx < leaf.entries.len() => {
                leaf.entries.swap_remove(d.idx)
            }
            _ => {
                return Err(IndexError::internal(format!(
                    "no entry at index {} of {}",
                    d.idx, d.block
                )))
            }
        };
        Ok(entry)
    }

    /// First leaf under `pos`
    pub(crate) fn leftmost_leaf(&mut self, mut pos: BlockPos) -> Result<BlockPos> {
        for _ in 0..=MAX_LEVEL {
            match self.session.read_node(Role::Current, pos)? {
                Node::Branch(branch) => pos = branch.first,
                Node::Leaf(leaf) if leaf.entries.is_empty() => {
                    return Err(IndexError::corrupt(format!("leaf {} is empty", pos)))
                }
                Node::Leaf(_) => return Ok(pos),
            }
        }
        Err(IndexError::corrupt(format!(
            "tree is deeper than {} levels",
            MAX_LEVEL
        )))
    }

    /// Last leaf under `pos` and its entry count
    pub(crate) fn rightmost_leaf(&mut self, mut pos: BlockPos) -> Result<(BlockPos, usize)> {
        for _ in 0..=MAX_LEVEL {
            match self.session.read_node(Role::Current, pos)? {
                Node::Branch(branch) => pos = branch.last_child(),
                Node::Leaf(leaf) if leaf.entries.is_empty() => {
                    return Err(IndexError::corrupt(format!("leaf {} is empty", pos)))
                }
                Node::Leaf(leaf) => return Ok((pos, leaf.entries.len())),
            }
        }
        Err(IndexError::corrupt(format!(
            "tree is deeper than {} levels",
            MAX_LEVEL
        )))
    }
}
