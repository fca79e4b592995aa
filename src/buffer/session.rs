//! Per-call working set over the block cache.
//!
//! Every index call runs inside one [`Session`]. The session holds the cache
//! lock for the whole call, keeps the header block pinned, and pins at most
//! one further block per [`Role`]. Ending the session writes the chain
//! pointers back into the header and either keeps the file's blocks cached
//! or flushes them.
//!
//! The first time a call changes a block, the session keeps the block's
//! previous image. A call that fails, or a session dropped without
//! [`Session::finish`], puts those images back, so half an update never
//! survives while changes committed by earlier calls stay cached.

use crate::block::{Layout, Node};
use crate::buffer::pool::{BlockCache, FileId, Release};
use crate::error::{IndexError, Result};
use crate::storage::{BlockStore, Pointers};
use crate::types::BlockPos;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::warn;

/// Working-set roles; each pins at most one block at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Block 0
    Header = 0,
    /// Block being searched or edited
    Current = 1,
    /// Parent of the current block
    Parent = 2,
    /// Brother of the current block, or a block being allocated or freed
    Sibling = 3,
}

/// How a session treats the file's blocks when it ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndMode {
    /// Leave blocks cached for later calls
    Keep,
    /// Write back and release every block of the file
    Flush,
}

pub(crate) struct Session<'a> {
    cache: MutexGuard<'a, BlockCache>,
    file: FileId,
    store: Arc<dyn BlockStore>,
    pub(crate) layout: Layout,
    working: [Option<usize>; 4],
    pub(crate) pointers: Pointers,
    pointers_dirty: bool,
    locked: bool,
    finished: bool,
    /// Images of the blocks this call changed, taken before the first change
    undo: Vec<Undo>,
    /// Blocks past this mark were allocated by this call
    high_water: BlockPos,
}

struct Undo {
    pos: BlockPos,
    /// `None` for a block the call itself added to the file
    image: Option<Vec<u8>>,
}

impl<'a> Session<'a> {
    /// Start a call on `file`.
    ///
    /// With `locked` set the store's lock is taken first and every cached
    /// block of the file is written back and dropped, so nothing read under
    /// an earlier lock is trusted.
    pub(crate) fn begin(
        mut cache: MutexGuard<'a, BlockCache>,
        file: FileId,
        layout: Layout,
        locked: bool,
    ) -> Result<Self> {
        if let Some(err) = cache.take_pending(file) {
            return Err(err);
        }
        let store = cache.store(file)?;
        if locked {
            store.lock()?;
        }
        let mut session = Self {
            cache,
            file,
            store,
            layout,
            working: [None; 4],
            pointers: Pointers::default(),
            pointers_dirty: false,
            locked,
            finished: false,
            undo: Vec::new(),
            high_water: BlockPos::NULL,
        };
        if locked {
            session.cache.release_file(file, Release::Flush)?;
        }
        let header = session.get(Role::Header, BlockPos::NULL, true)?;
        session.pointers = Pointers::read(layout.format, session.cache.data(header)?);
        session.high_water = session.pointers.high_water;
        Ok(session)
    }

    /// Load `pos` into the buffer for `role`, releasing the role's previous
    /// block.
    pub(crate) fn get(&mut self, role: Role, pos: BlockPos, read: bool) -> Result<usize> {
        let r = role as usize;
        if let Some(old) = self.working[r].take() {
            if !self.working.contains(&Some(old)) {
                self.cache.unpin(old);
            }
        }
        let index = self
            .cache
            .get(self.file, pos, self.layout.block_size, read)?;
        self.cache.pin(index);
        self.working[r] = Some(index);
        Ok(index)
    }

    /// Bytes of the block held for `role`
    pub(crate) fn block(&self, role: Role) -> Result<&[u8]> {
        let index = self.working[role as usize]
            .ok_or_else(|| IndexError::internal(format!("no block held for {:?}", role)))?;
        self.cache.data(index)
    }

    /// Mutable bytes of the block held for `role`; marks it dirty
    pub(crate) fn block_mut(&mut self, role: Role) -> Result<&mut [u8]> {
        let index = self.working[role as usize]
            .ok_or_else(|| IndexError::internal(format!("no block held for {:?}", role)))?;
        let pos = self.cache.position(index)?;
        if !self.undo.iter().any(|u| u.pos == pos) {
            let image = if !pos.is_null() && pos.offset() > self.high_water.offset() {
                None
            } else {
                Some(self.cache.data(index)?.to_vec())
            };
            self.undo.push(Undo { pos, image });
        }
        self.cache.data_mut(index)
    }

    /// Read and decode the tree block at `pos`
    pub(crate) fn read_node(&mut self, role: Role, pos: BlockPos) -> Result<Node> {
        if pos.is_null() {
            return Err(IndexError::corrupt("tree link points at the header block"));
        }
        self.get(role, pos, true)?;
        let layout = self.layout;
        Node::decode(&layout, self.block(role)?, pos)
    }

    /// Encode `node` over the whole block at `pos`
    pub(crate) fn write_node(&mut self, role: Role, pos: BlockPos, node: &Node) -> Result<()> {
        self.get(role, pos, true)?;
        let layout = self.layout;
        node.encode(&layout, self.block_mut(role)?)
    }

    /// Record a change to the chain pointers
    pub(crate) fn set_pointers(&mut self, pointers: Pointers) {
        if pointers != self.pointers {
            self.pointers = pointers;
            self.pointers_dirty = true;
        }
    }

    /// Root block of the tree
    pub(crate) fn root(&self) -> BlockPos {
        self.pointers.root
    }

    /// Point the header at a new root
    pub(crate) fn set_root(&mut self, root: BlockPos) {
        let mut pointers = self.pointers;
        pointers.root = root;
        self.set_pointers(pointers);
    }

    /// End the call successfully
    pub(crate) fn finish(mut self, mode: EndMode) -> Result<()> {
        self.finished = true;
        let result = self.complete(mode);
        if result.is_err() {
            self.roll_back();
        }
        let unlocked = self.unlock();
        result.and(unlocked)
    }

    fn complete(&mut self, mode: EndMode) -> Result<()> {
        if self.pointers_dirty {
            let format = self.layout.format;
            let pointers = self.pointers;
            pointers.write(format, self.block_mut(Role::Header)?)?;
            self.pointers_dirty = false;
        }
        self.unpin_all();
        if mode == EndMode::Flush {
            self.cache.release_file(self.file, Release::Flush)?;
        }
        self.undo.clear();
        Ok(())
    }

    /// Put back every block this call changed. Under the file lock the
    /// restored images are written out before the lock is given up; a write
    /// that fails leaves them dirty for the next call.
    fn roll_back(&mut self) {
        self.unpin_all();
        let file = self.file;
        for undo in std::mem::take(&mut self.undo) {
            match undo.image {
                Some(image) => {
                    if let Err(e) = self.cache.restore(file, undo.pos, image) {
                        warn!(file, block = undo.pos.offset(), error = %e, "xio.session.restore_failed");
                        self.cache.park(file, e);
                    }
                }
                None => self.cache.forget(file, undo.pos),
            }
        }
        if self.locked {
            if let Err(e) = self.cache.release_file(file, Release::Flush) {
                warn!(file, error = %e, "xio.session.rollback_flush_failed");
            }
        }
    }

    fn unpin_all(&mut self) {
        for index in self.working.iter_mut().filter_map(Option::take) {
            self.cache.unpin(index);
        }
    }

    fn unlock(&mut self) -> Result<()> {
        if std::mem::take(&mut self.locked) {
            self.store.unlock()?;
        }
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.roll_back();
        if let Err(e) = self.unlock() {
            warn!(error = %e, "xio.session.unlock_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCache;
    use crate::storage::{FileHeader, MemoryStore};
    use crate::types::Format;

    fn setup() -> Result<(BufferCache, FileId, Arc<MemoryStore>, Layout)> {
        let header = FileHeader::new(8, Format::Modern);
        let store = Arc::new(MemoryStore::new());
        store.write_at(0, &header.encode()?)?;
        let cache = BufferCache::new(8);
        let file = cache.lock().register(store.clone());
        Ok((cache, file, store, header.layout()))
    }

    #[test]
    fn test_finish_writes_pointers() -> Result<()> {
        let (cache, file, store, layout) = setup()?;
        let mut session = Session::begin(cache.lock(), file, layout, false)?;
        session.set_root(BlockPos::new(1024));
        session.finish(EndMode::Flush)?;

        let mut blk = vec![0u8; 1024];
        store.read_at(0, &mut blk)?;
        assert_eq!(Pointers::read(Format::Modern, &blk).root, BlockPos::new(1024));
        assert_eq!(cache.stats().in_use, 0);
        Ok(())
    }

    #[test]
    fn test_drop_restores_changes() -> Result<()> {
        let (cache, file, store, layout) = setup()?;
        {
            let mut session = Session::begin(cache.lock(), file, layout, true)?;
            session.set_root(BlockPos::new(1024));
            session.block_mut(Role::Header)?[54] = b'X';
        }
        assert_eq!(cache.stats().in_use, 0);

        let mut blk = vec![0u8; 1024];
        store.read_at(0, &mut blk)?;
        assert_eq!(blk[54], b'L');
        assert!(Pointers::read(Format::Modern, &blk).root.is_null());
        Ok(())
    }

    #[test]
    fn test_roles_share_pins() -> Result<()> {
        let (cache, file, store, layout) = setup()?;
        store.write_at(1024, &[0xFFu8; 1024])?;
        let mut session = Session::begin(cache.lock(), file, layout, false)?;
        let a = session.get(Role::Current, BlockPos::new(1024), true)?;
        let b = session.get(Role::Parent, BlockPos::new(1024), true)?;
        assert_eq!(a, b);
        // Moving one role off the block keeps it pinned for the other
        session.get(Role::Current, BlockPos::new(2048), false)?;
        assert_eq!(session.block(Role::Parent)?.len(), 1024);
        session.finish(EndMode::Keep)?;
        Ok(())
    }

    #[test]
    fn test_failed_call_keeps_earlier_changes() -> Result<()> {
        let (cache, file, store, layout) = setup()?;
        store.write_at(1024, &[0u8; 2048])?;
        let mut pointers = Pointers::default();
        pointers.high_water = BlockPos::new(2048);
        {
            let mut session = Session::begin(cache.lock(), file, layout, false)?;
            session.set_pointers(pointers);
            session.get(Role::Current, BlockPos::new(1024), true)?;
            session.block_mut(Role::Current)?[0] = b'A';
            session.finish(EndMode::Keep)?;
        }
        {
            let mut session = Session::begin(cache.lock(), file, layout, false)?;
            session.get(Role::Current, BlockPos::new(1024), true)?;
            session.block_mut(Role::Current)?[0] = b'B';
            session.get(Role::Sibling, BlockPos::new(2048), true)?;
            session.block_mut(Role::Sibling)?[0] = b'C';
            let fresh = session.allocate_block(Role::Parent)?;
            assert_eq!(fresh, BlockPos::new(3072));
            session.set_root(fresh);
        }

        let session = Session::begin(cache.lock(), file, layout, false)?;
        assert_eq!(session.pointers, pointers);
        session.finish(EndMode::Flush)?;
        let mut blk = vec![0u8; 1024];
        store.read_at(1024, &mut blk)?;
        assert_eq!(blk[0], b'A');
        store.read_at(2048, &mut blk)?;
        assert_eq!(blk[0], 0);
        assert_eq!(store.len(), 3072);
        Ok(())
    }
}
