//! Insertion with offload and split.
//!
//! An entry goes into the leaf the exact search ended in. When the leaf
//! overflows, the entries past the fitting prefix are first offered to the
//! right brother through the parent separator; only if the brother cannot
//! take them is the leaf split and a separator promoted.

use crate::block::{BranchNode, KeyEntry, LeafNode, Node};
use crate::btree::tree::{Step, TreeOp};
use crate::buffer::Role;
use crate::error::{IndexError, Result};
use crate::types::{BlockPos, InsertOutcome, KeyState};
use tracing::debug;

impl TreeOp<'_> {
    /// Add `entry` to the tree
    pub(crate) fn insert(&mut self, entry: KeyEntry) -> Result<InsertOutcome> {
        let d = self.locate(&entry, true)?;
        if d.state == KeyState::OnKey {
            return Ok(InsertOutcome::DuplicateExact);
        }
        if d.dup && !self.duplicates {
            return Ok(InsertOutcome::DuplicateKey);
        }

        let layout = self.session.layout;
        if d.block.is_null() {
            let pos = self.session.allocate_block(Role::Current)?;
            self.session
                .write_node(Role::Current, pos, &Node::Leaf(LeafNode::new(vec![entry])))?;
            self.session.set_root(pos);
            debug!(block = pos.offset(), "xio.tree.first_leaf");
            return Ok(InsertOutcome::Inserted);
        }

        let (leaf_pos, at) = match d.leaf_end {
            Some(leaf) => (leaf, None),
            None if !d.on_branch => (d.block, Some(d.idx)),
            None => return Err(IndexError::internal("insert position is a separator")),
        };
        let mut leaf = self.read_leaf(Role::Current, leaf_pos)?;
        let at = at.unwrap_or(leaf.entries.len()).min(leaf.entries.len());
        leaf.entries.insert(at, entry);
        if leaf.fits(&layout) {
            self.session
                .write_node(Role::Current, leaf_pos, &Node::Leaf(leaf))?;
            return Ok(InsertOutcome::Inserted);
        }

        self.split_leaf(&d.path, leaf_pos, leaf.entries)?;
        Ok(InsertOutcome::Inserted)
    }

    fn split_leaf(&mut self, path: &[Step], pos: BlockPos, mut entries: Vec<KeyEntry>) -> Result<()> {
        let layout = self.session.layout;
        let fit = LeafNode::fitting_prefix(&layout, &entries);
        if fit < 2 || fit >= entries.len() {
            return Err(IndexError::internal(format!(
                "cannot split a leaf of {} entries at {}",
                entries.len(),
                fit
            )));
        }
        let overflow = entries.split_off(fit);

        if let Some(step) = path.last() {
            let mut parent = self.read_branch(Role::Parent, step.block)?;
            if let Some((sep, right_pos)) = parent.entries.get(step.idx).cloned() {
                let right = self.read_leaf(Role::Sibling, right_pos)?;
                let mut moved: Vec<KeyEntry> = overflow[1..].to_vec();
                moved.push(sep);
                moved.extend(right.entries);
                let right = LeafNode::new(moved);
                if right.fits(&layout) {
                    parent.entries[step.idx].0 = overflow[0].clone();
                    self.session
                        .write_node(Role::Current, pos, &Node::Leaf(LeafNode::new(entries)))?;
                    self.session
                        .write_node(Role::Sibling, right_pos, &Node::Leaf(right))?;
                    self.session
                        .write_node(Role::Parent, step.block, &Node::Branch(parent))?;
                    debug!(
                        block = pos.offset(),
                        brother = right_pos.offset(),
                        moved = overflow.len(),
                        "xio.split.offload"
                    );
                    return Ok(());
                }
            }
        }

        let promoted = entries
            .pop()
            .ok_or_else(|| IndexError::internal("leaf split left nothing to promote"))?;
        let new_pos = self.session.allocate_block(Role::Sibling)?;
        self.session
            .write_node(Role::Sibling, new_pos, &Node::Leaf(LeafNode::new(overflow)))?;
        self.session
            .write_node(Role::Current, pos, &Node::Leaf(LeafNode::new(entries)))?;
        debug!(block = pos.offset(), new = new_pos.offset(), "xio.split.leaf");
        self.promote(path, pos, promoted, new_pos)
    }

    /// Insert separator `entry` with right child `child` into the branches
    /// on `path`, splitting upwards as needed. `left` is the block the
    /// separator sits to the right of.
    fn promote(
        &mut self,
        path: &[Step],
        mut left: BlockPos,
        mut entry: KeyEntry,
        mut child: BlockPos,
    ) -> Result<()> {
        let layout = self.session.layout;
        for step in path.iter().rev() {
            let mut branch = self.read_branch(Role::Parent, step.block)?;
            let at = step.idx.min(branch.entries.len());
            branch.entries.insert(at, (entry, child));
            if branch.fits(&layout) {
                return self
                    .session
                    .write_node(Role::Parent, step.block, &Node::Branch(branch));
            }

            let (last, (mid_key, mid_child)) = match (branch.entries.pop(), branch.entries.pop()) {
                (Some(last), Some(mid)) => (last, mid),
                _ => return Err(IndexError::internal("branch split on fewer than two entries")),
            };
            self.session
                .write_node(Role::Parent, step.block, &Node::Branch(branch))?;
            let right_pos = self.session.allocate_block(Role::Sibling)?;
            self.session.write_node(
                Role::Sibling,
                right_pos,
                &Node::Branch(BranchNode::new(mid_child, vec![last])),
            )?;
            debug!(block = step.block.offset(), new = right_pos.offset(), "xio.split.branch");
            entry = mid_key;
            child = right_pos;
            left = step.block;
        }

        let root = self.session.allocate_block(Role::Parent)?;
        self.session.write_node(
            Role::Parent,
            root,
            &Node::Branch(BranchNode::new(left, vec![(entry, child)])),
        )?;
        self.session.set_root(root);
        debug!(root = root.offset(), "xio.split.root");
        Ok(())
    }
}
