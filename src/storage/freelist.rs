//! Free-space management.
//!
//! Two chains hang off the header. Deleted blocks form a singly linked chain
//! of `D` blocks that new blocks are taken from before the file is extended.
//! Fixed-record files also keep a chain of `F` blocks listing record
//! positions that the record layer may reuse.

use crate::block::{decode_deleted, encode_deleted, SlotNode};
use crate::buffer::{Role, Session};
use crate::error::{IndexError, Result};
use crate::types::{BlockKind, BlockPos, DEL_BYTE};
use tracing::{debug, trace};

impl Session<'_> {
    /// Take a block off the free chain, or extend the file by one block.
    /// The block is loaded for `role` and filled with `0xFF`.
    pub(crate) fn allocate_block(&mut self, role: Role) -> Result<BlockPos> {
        let mut pointers = self.pointers;
        let pos = if !pointers.free_head.is_null() {
            let pos = pointers.free_head;
            self.get(role, pos, true)?;
            let layout = self.layout;
            pointers.free_head = decode_deleted(&layout, self.block(role)?, pos)?;
            trace!(block = pos.offset(), "xio.free.reuse");
            pos
        } else {
            let pos = pointers.high_water.following(self.layout.block_size);
            if pos.offset() > self.layout.max_record() {
                return Err(IndexError::internal("index file reached its size limit"));
            }
            self.get(role, pos, false)?;
            pointers.high_water = pos;
            trace!(block = pos.offset(), "xio.free.extend");
            pos
        };
        self.block_mut(role)?.fill(DEL_BYTE);
        self.set_pointers(pointers);
        Ok(pos)
    }

    /// Push the block at `pos` onto the free chain
    pub(crate) fn free_block(&mut self, role: Role, pos: BlockPos) -> Result<()> {
        if pos.is_null() {
            return Err(IndexError::internal("attempt to free the header block"));
        }
        let mut pointers = self.pointers;
        self.get(role, pos, true)?;
        let layout = self.layout;
        encode_deleted(&layout, pointers.free_head, self.block_mut(role)?)?;
        pointers.free_head = pos;
        self.set_pointers(pointers);
        trace!(block = pos.offset(), "xio.free.release");
        Ok(())
    }

    /// Pop the oldest record position off the free-slot list
    pub(crate) fn pop_record_slot(&mut self) -> Result<Option<u64>> {
        let head = self.pointers.slot_head;
        if head.is_null() {
            return Ok(None);
        }
        let mut node = self.read_slot_node(head)?;
        if node.records.is_empty() {
            return Err(IndexError::corrupt(format!("record slot block {} is empty", head)));
        }
        let record = node.records.remove(0);
        if node.records.is_empty() {
            let mut pointers = self.pointers;
            pointers.slot_head = node.next;
            self.set_pointers(pointers);
            self.free_block(Role::Current, head)?;
            debug!(block = head.offset(), "xio.slots.drained");
        } else {
            let layout = self.layout;
            node.encode(&layout, self.block_mut(Role::Current)?)?;
        }
        Ok(Some(record))
    }

    /// Push a record position onto the free-slot list
    pub(crate) fn push_record_slot(&mut self, record: u64) -> Result<()> {
        let head = self.pointers.slot_head;
        let layout = self.layout;
        if !head.is_null() {
            let mut node = self.read_slot_node(head)?;
            if node.has_room(&layout) {
                node.records.push(record);
                return node.encode(&layout, self.block_mut(Role::Current)?);
            }
        }

        let pos = self.allocate_block(Role::Current)?;
        let node = SlotNode {
            next: head,
            records: vec![record],
        };
        node.encode(&layout, self.block_mut(Role::Current)?)?;
        let mut pointers = self.pointers;
        pointers.slot_head = pos;
        self.set_pointers(pointers);
        Ok(())
    }

    pub(crate) fn read_slot_node(&mut self, pos: BlockPos) -> Result<SlotNode> {
        self.get(Role::Current, pos, true)?;
        let data = self.block(Role::Current)?;
        if data.first() != Some(&BlockKind::Slots.as_byte()) {
            return Err(IndexError::corrupt(format!(
                "record slot chain block {} has the wrong tag",
                pos
            )));
        }
        SlotNode::decode(&self.layout, data)
    }
}
