//! Navigator state and the key-order moves.
//!
//! A file handle carries one [`Cursor`]. It remembers the state of the last
//! move and the entry it stands on; when it stands between entries the
//! remembered key is the search key padded out, with the largest record
//! position, so a later `next` lands on the first entry above it.

use crate::block::{KeyEntry, Node};
use crate::btree::tree::{scan, Descent, TreeOp};
use crate::buffer::Role;
use crate::error::Result;
use crate::types::{BlockKind, BlockPos, KeyState};
use std::cmp::Ordering;
use tracing::trace;

/// Position of a handle in key order
#[derive(Debug, Clone)]
pub(crate) struct Cursor {
    pub(crate) state: KeyState,
    /// Entry the cursor is on, or the key it stands next to
    pub(crate) current: Option<KeyEntry>,
    /// Block the cursor last landed in
    hint: Option<BlockPos>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            state: KeyState::BeforeFirst,
            current: None,
            hint: None,
        }
    }
}

impl Cursor {
    /// Stand on `entry`, found in `block`
    pub(crate) fn land(&mut self, entry: KeyEntry, block: BlockPos) {
        self.state = KeyState::OnKey;
        self.current = Some(entry);
        self.hint = Some(block);
    }

    /// Stand off the entries, next to `key`
    pub(crate) fn park(&mut self, state: KeyState, key: KeyEntry) {
        self.state = state;
        self.current = Some(key);
        self.hint = None;
    }

    /// Record number of the entry the cursor is on
    pub(crate) fn record(&self) -> Option<u64> {
        match (&self.current, self.state) {
            (Some(entry), KeyState::OnKey) => Some(entry.record),
            _ => None,
        }
    }

    fn settle(&mut self, op: &mut TreeOp<'_>, d: &Descent) -> Result<KeyState> {
        if d.state == KeyState::OnKey {
            let entry = op.entry_at(d)?;
            self.land(entry, d.block);
        } else {
            self.state = d.state;
            self.hint = None;
        }
        Ok(self.state)
    }
}

impl TreeOp<'_> {
    /// Position on the first entry whose key equals `key`, already padded
    /// to the key length.
    ///
    /// On a miss the cursor keeps the state the search reported and
    /// remembers the key.
    pub(crate) fn find(&mut self, cursor: &mut Cursor, key: Vec<u8>) -> Result<KeyState> {
        let target = KeyEntry::new(key, 0);
        let d = self.locate(&target, false)?;
        if d.state == KeyState::OnKey {
            return cursor.settle(self, &d);
        }
        let max_record = self.session.layout.max_record();
        cursor.park(d.state, KeyEntry::new(target.key, max_record));
        Ok(cursor.state)
    }

    /// Position on the last entry whose first `len` bytes match `padded`,
    /// a prefix padded out with the highest collating byte.
    ///
    /// On a miss the cursor stands between entries, remembering the padded
    /// prefix.
    pub(crate) fn find_last(
        &mut self,
        cursor: &mut Cursor,
        padded: Vec<u8>,
        len: usize,
    ) -> Result<KeyState> {
        let collation = self.collation;
        let highest = collation.highest();
        let len = len.min(padded.len());

        // Smallest key above every key with this prefix
        let mut key = padded.clone();
        let bumped = (0..len)
            .rev()
            .find(|&i| collation.weight(key[i]) != collation.weight(highest));
        if let Some(i) = bumped {
            key[i] = collation.next_above(key[i]);
            key[i + 1..].fill(collation.lowest());
        }

        let mut d = self.locate(&KeyEntry::new(key, 0), false)?;
        if !d.block.is_null() && d.state != KeyState::BeforeFirst {
            if d.state != KeyState::OnKey || bumped.is_some() {
                self.predecessor(&mut d)?;
            }
            if d.state == KeyState::OnKey {
                let entry = self.entry_at(&d)?;
                if collation.compare(&entry.key[..len], &padded[..len]) == Ordering::Equal {
                    cursor.land(entry, d.block);
                    return Ok(KeyState::OnKey);
                }
            }
        }
        let max_record = self.session.layout.max_record();
        cursor.park(KeyState::Between, KeyEntry::new(padded, max_record));
        Ok(KeyState::Between)
    }

    /// Step to the entry after the cursor
    pub(crate) fn next(&mut self, cursor: &mut Cursor) -> Result<KeyState> {
        let current = match (cursor.state, cursor.current.clone()) {
            (KeyState::AfterLast, _) => return Ok(KeyState::AfterLast),
            (KeyState::OnKey | KeyState::Between, Some(current)) => current,
            _ => return self.first(cursor),
        };

        if cursor.state == KeyState::OnKey {
            if let Some(hint) = cursor.hint {
                if let Some(d) = self.next_from_hint(hint, &current)? {
                    trace!(block = d.block.offset(), "xio.cursor.hint_hit");
                    return cursor.settle(self, &d);
                }
            }
        }

        let mut d = self.locate(&current, true)?;
        match d.state {
            KeyState::OnKey => self.successor(&mut d)?,
            KeyState::Between => d.state = KeyState::OnKey,
            KeyState::BeforeFirst if !d.block.is_null() => d.state = KeyState::OnKey,
            KeyState::BeforeFirst => d.state = KeyState::AfterLast,
            KeyState::AfterLast => {}
        }
        cursor.settle(self, &d)
    }

    /// Step to the entry in front of the cursor
    pub(crate) fn prev(&mut self, cursor: &mut Cursor) -> Result<KeyState> {
        let current = match (cursor.state, cursor.current.clone()) {
            (KeyState::BeforeFirst, _) => return Ok(KeyState::BeforeFirst),
            (KeyState::OnKey | KeyState::Between, Some(current)) => current,
            _ => return self.last(cursor),
        };

        let mut d = self.locate(&current, true)?;
        if d.state != KeyState::BeforeFirst {
            self.predecessor(&mut d)?;
        }
        cursor.settle(self, &d)
    }

    fn first(&mut self, cursor: &mut Cursor) -> Result<KeyState> {
        let root = self.session.root();
        if root.is_null() {
            cursor.state = KeyState::AfterLast;
            cursor.hint = None;
            return Ok(cursor.state);
        }
        let leaf = self.leftmost_leaf(root)?;
        let d = self.position(leaf, 0);
        cursor.settle(self, &d)
    }

    fn last(&mut self, cursor: &mut Cursor) -> Result<KeyState> {
        let root = self.session.root();
        if root.is_null() {
            cursor.state = KeyState::BeforeFirst;
            cursor.hint = None;
            return Ok(cursor.state);
        }
        let (leaf, len) = self.rightmost_leaf(root)?;
        let d = self.position(leaf, len - 1);
        cursor.settle(self, &d)
    }

    fn position(&self, block: BlockPos, idx: usize) -> Descent {
        Descent {
            state: KeyState::OnKey,
            path: Vec::new(),
            block,
            idx,
            on_branch: false,
            leaf_end: None,
            dup: false,
        }
    }

    /// Try to step forward inside the block the cursor last landed in.
    /// Gives up when the block no longer holds the current entry or the
    /// successor lies outside it.
    fn next_from_hint(&mut self, hint: BlockPos, current: &KeyEntry) -> Result<Option<Descent>> {
        if hint.is_null() || hint.offset() > self.session.pointers.high_water.offset() {
            return Ok(None);
        }
        self.session.get(Role::Current, hint, true)?;
        let tag = self.session.block(Role::Current)?.first().copied();
        if !matches!(
            tag.and_then(BlockKind::from_byte),
            Some(BlockKind::Leaf | BlockKind::Branch)
        ) {
            return Ok(None);
        }

        match self.session.read_node(Role::Current, hint)? {
            Node::Leaf(leaf) => {
                let s = scan(leaf.entries.iter(), current, self.collation, true);
                if s.found && s.idx + 1 < leaf.entries.len() {
                    return Ok(Some(self.position(hint, s.idx + 1)));
                }
            }
            Node::Branch(branch) => {
                let s = scan(branch.entries.iter().map(|(e, _)| e), current, self.collation, true);
                if s.found {
                    if let Some(right) = branch.child(s.idx + 1) {
                        let leaf = self.leftmost_leaf(right)?;
                        return Ok(Some(self.position(leaf, 0)));
                    }
                }
            }
        }
        Ok(None)
    }
}
