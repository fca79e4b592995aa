//! Deletion with brother collapse.
//!
//! After an entry leaves a block the block is merged with a brother and the
//! separator between them whenever the result fits, working up the path.
//! When a merge does not fit the pair is left alone unless one side is
//! empty, in which case one entry is rotated through the separator.

use crate::block::{BranchNode, KeyEntry, LeafNode, Node};
use crate::btree::tree::{Step, TreeOp};
use crate::buffer::Role;
use crate::error::{IndexError, Result};
use crate::types::{BlockPos, KeyState, MAX_LEVEL};
use tracing::debug;

impl TreeOp<'_> {
    /// Remove the entry matching `target` and return it.
    ///
    /// With `exact` the record position must match as well; otherwise the
    /// first entry with an equal key goes.
    pub(crate) fn delete(&mut self, target: &KeyEntry, exact: bool) -> Result<Option<KeyEntry>> {
        let d = self.locate(target, exact)?;
        if d.state != KeyState::OnKey {
            return Ok(None);
        }
        let mut path = d.path;

        let (removed, leaf_pos, leaf) = if d.on_branch {
            // Replace the separator with the first entry of its right subtree
            let step = path
                .last_mut()
                .ok_or_else(|| IndexError::internal("separator hit without a path"))?;
            step.idx += 1;
            let mut branch = self.read_branch(Role::Parent, d.block)?;
            let mut pos = branch.child(d.idx + 1).ok_or_else(|| {
                IndexError::corrupt(format!("branch {} has no child {}", d.block, d.idx + 1))
            })?;
            let mut leaf = loop {
                match self.session.read_node(Role::Current, pos)? {
                    Node::Branch(b) => {
                        if path.len() >= MAX_LEVEL {
                            return Err(IndexError::corrupt(format!(
                                "tree is deeper than {} levels",
                                MAX_LEVEL
                            )));
                        }
                        path.push(Step { block: pos, idx: 0 });
                        pos = b.first;
                    }
                    Node::Leaf(leaf) => break leaf,
                }
            };
            if leaf.entries.is_empty() {
                return Err(IndexError::corrupt(format!("leaf {} is empty", pos)));
            }
            let successor = leaf.entries.remove(0);
            let removed = std::mem::replace(&mut branch.entries[d.idx].0, successor);
            self.session
                .write_node(Role::Parent, d.block, &Node::Branch(branch))?;
            (removed, pos, leaf)
        } else {
            let mut leaf = self.read_leaf(Role::Current, d.block)?;
            if path.is_empty() && leaf.entries.len() == 1 {
                let removed = leaf.entries.remove(0);
                self.session.set_root(BlockPos::NULL);
                self.session.free_block(Role::Current, d.block)?;
                debug!(block = d.block.offset(), "xio.tree.emptied");
                return Ok(Some(removed));
            }
            let removed = leaf.entries.remove(d.idx);
            (removed, d.block, leaf)
        };

        let leaf = Node::Leaf(leaf);
        self.session.write_node(Role::Current, leaf_pos, &leaf)?;
        self.collapse(&path, leaf_pos, leaf)?;
        Ok(Some(removed))
    }

    /// Merge `node` at `pos` with its brothers up the path
    fn collapse(&mut self, path: &[Step], pos: BlockPos, node: Node) -> Result<()> {
        let layout = self.session.layout;
        let mut cur_pos = pos;
        let mut cur = node;

        for step in path.iter().rev() {
            let mut parent = self.read_branch(Role::Parent, step.block)?;
            let (sep_idx, left_pos, left, right_pos, right) = if step.idx < parent.entries.len() {
                let right_pos = parent.entries[step.idx].1;
                let right = self.session.read_node(Role::Sibling, right_pos)?;
                (step.idx, cur_pos, cur, right_pos, right)
            } else if step.idx > 0 {
                let left_pos = parent.child(step.idx - 1).ok_or_else(|| {
                    IndexError::corrupt(format!("branch {} has no child {}", step.block, step.idx - 1))
                })?;
                let left = self.session.read_node(Role::Sibling, left_pos)?;
                (step.idx - 1, left_pos, left, cur_pos, cur)
            } else {
                return Err(IndexError::corrupt(format!(
                    "branch {} has no separators",
                    step.block
                )));
            };
            let sep = parent.entries[sep_idx].0.clone();

            let merged = merge(&left, sep.clone(), &right)?;
            if merged.fits(&layout) {
                parent.entries.remove(sep_idx);
                self.session.write_node(Role::Current, left_pos, &merged)?;
                self.session.free_block(Role::Sibling, right_pos)?;
                self.session
                    .write_node(Role::Parent, step.block, &Node::Branch(parent.clone()))?;
                debug!(
                    block = left_pos.offset(),
                    freed = right_pos.offset(),
                    "xio.collapse.merge"
                );
                cur_pos = step.block;
                cur = Node::Branch(parent);
                continue;
            }

            if let Some((left, sep, right)) = rotate(left, sep, right)? {
                parent.entries[sep_idx].0 = sep;
                self.session.write_node(Role::Current, left_pos, &left)?;
                self.session.write_node(Role::Sibling, right_pos, &right)?;
                self.session
                    .write_node(Role::Parent, step.block, &Node::Branch(parent))?;
                debug!(
                    block = left_pos.offset(),
                    brother = right_pos.offset(),
                    "xio.collapse.rotate"
                );
            }
            return Ok(());
        }

        if let Node::Branch(top) = &cur {
            if top.entries.is_empty() {
                self.session.free_block(Role::Parent, cur_pos)?;
                self.session.set_root(top.first);
                debug!(root = top.first.offset(), "xio.tree.shrink");
            }
        }
        Ok(())
    }
}

/// `left`, the separator and `right` as one block
fn merge(left: &Node, sep: KeyEntry, right: &Node) -> Result<Node> {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(r)) => {
            let mut entries = Vec::with_capacity(l.entries.len() + r.entries.len() + 1);
            entries.extend(l.entries.iter().cloned());
            entries.push(sep);
            entries.extend(r.entries.iter().cloned());
            Ok(Node::Leaf(LeafNode::new(entries)))
        }
        (Node::Branch(l), Node::Branch(r)) => {
            let mut entries = Vec::with_capacity(l.entries.len() + r.entries.len() + 1);
            entries.extend(l.entries.iter().cloned());
            entries.push((sep, r.first));
            entries.extend(r.entries.iter().cloned());
            Ok(Node::Branch(BranchNode::new(l.first, entries)))
        }
        _ => Err(IndexError::corrupt("brothers sit on different levels")),
    }
}

/// Move one entry through the separator into whichever side is empty.
/// Returns `None` unless exactly one side is empty.
fn rotate(left: Node, sep: KeyEntry, right: Node) -> Result<Option<(Node, KeyEntry, Node)>> {
    if left.is_empty() == right.is_empty() {
        return Ok(None);
    }
    let rotated = match (left, right) {
        (Node::Leaf(mut l), Node::Leaf(mut r)) => {
            let sep = if l.entries.is_empty() {
                l.entries.push(sep);
                r.entries.remove(0)
            } else {
                r.entries.push(sep);
                l.entries
                    .pop()
                    .ok_or_else(|| IndexError::internal("rotate from an empty leaf"))?
            };
            (Node::Leaf(l), sep, Node::Leaf(r))
        }
        (Node::Branch(mut l), Node::Branch(mut r)) => {
            let sep = if l.entries.is_empty() {
                l.entries.push((sep, r.first));
                let (key, child) = r.entries.remove(0);
                r.first = child;
                key
            } else {
                let (key, child) = l
                    .entries
                    .pop()
                    .ok_or_else(|| IndexError::internal("rotate from an empty branch"))?;
                r.entries.insert(0, (sep, r.first));
                r.first = child;
                key
            };
            (Node::Branch(l), sep, Node::Branch(r))
        }
        _ => return Err(IndexError::corrupt("brothers sit on different levels")),
    };
    Ok(Some(rotated))
}
