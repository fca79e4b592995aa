//! Block buffer cache.
//!
//! The cache holds a bounded pool of block buffers shared by every index
//! file opened against it. Buffers are found through a 256-bucket hash of
//! (file, block position), handed out from an O(1) free list, and recycled
//! in least-recently-used order. A pinned buffer is never evicted.

use crate::buffer::lru::LruList;
use crate::error::{IndexError, Result};
use crate::storage::BlockStore;
use crate::types::{BlockPos, DEFAULT_MAX_BUFFERS, DEL_BYTE, MIN_HEADER_READ};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

/// Identifies one open index file inside a cache
pub(crate) type FileId = u32;

const BUCKETS: usize = 256;

/// Fewest buffers a cache may have: one per working role
pub const MIN_BUFFERS: usize = 4;

/// What to do with a file's buffers when an operation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Write dirty buffers back, then free them
    Flush,
    /// Free them without writing
    Discard,
}

/// Counters describing cache activity
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Maximum number of buffers
    pub capacity: usize,
    /// Buffers currently holding a block
    pub in_use: usize,
    /// Buffers holding unwritten changes
    pub dirty: usize,
    /// Lookups satisfied from memory
    pub hits: u64,
    /// Lookups that needed a buffer
    pub misses: u64,
    /// Buffers recycled to make room
    pub evictions: u64,
    /// Blocks written back to storage
    pub writes: u64,
}

/// One cached block
struct Slot {
    file: FileId,
    pos: BlockPos,
    data: Vec<u8>,
    dirty: bool,
    pinned: bool,
    /// Next slot in the same hash bucket
    next: Option<usize>,
}

/// An index file registered with the cache
struct FileEntry {
    store: Arc<dyn BlockStore>,
    /// Write failure from a memory purge, reported by the file's next call
    pending: Option<IndexError>,
}

/// Cache state, always reached through [`BufferCache`]'s mutex
pub(crate) struct BlockCache {
    slots: Vec<Option<Slot>>,
    buckets: [Option<usize>; BUCKETS],
    free: Vec<usize>,
    lru: LruList,
    files: HashMap<FileId, FileEntry>,
    next_file: FileId,
    stats: CacheStats,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUFFERS);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            buckets: [None; BUCKETS],
            free: (0..capacity).rev().collect(),
            lru: LruList::new(capacity),
            files: HashMap::new(),
            next_file: 1,
            stats: CacheStats {
                capacity,
                ..CacheStats::default()
            },
        }
    }

    /// Register a file and return its id
    pub(crate) fn register(&mut self, store: Arc<dyn BlockStore>) -> FileId {
        let mut id = self.next_file;
        while id == 0 || self.files.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_file = id.wrapping_add(1);
        self.files.insert(
            id,
            FileEntry {
                store,
                pending: None,
            },
        );
        id
    }

    /// Drop a file and every buffer it still holds
    pub(crate) fn unregister(&mut self, file: FileId) {
        self.release_file(file, Release::Discard).ok();
        self.files.remove(&file);
    }

    /// Store behind a registered file
    pub(crate) fn store(&self, file: FileId) -> Result<Arc<dyn BlockStore>> {
        self.files
            .get(&file)
            .map(|entry| Arc::clone(&entry.store))
            .ok_or(IndexError::InvalidHandle)
    }

    /// Take the error parked on a file by a memory purge
    pub(crate) fn take_pending(&mut self, file: FileId) -> Option<IndexError> {
        self.files.get_mut(&file).and_then(|entry| entry.pending.take())
    }

    fn lookup(&self, file: FileId, pos: BlockPos) -> Option<usize> {
        let mut cur = self.buckets[pos.bucket(file)];
        while let Some(i) = cur {
            let slot = self.slots[i].as_ref()?;
            if slot.file == file && slot.pos == pos {
                return Some(i);
            }
            cur = slot.next;
        }
        None
    }

    /// Return the buffer holding block `pos` of `file`, loading it into a free
    /// or recycled buffer on a miss. With `read` unset a missing block is not
    /// read and its buffer is filled with `0xFF`.
    pub(crate) fn get(
        &mut self,
        file: FileId,
        pos: BlockPos,
        block_size: usize,
        read: bool,
    ) -> Result<usize> {
        if let Some(i) = self.lookup(file, pos) {
            self.stats.hits += 1;
            self.lru.touch(i);
            return Ok(i);
        }
        self.stats.misses += 1;

        let store = self.store(file)?;
        let (index, recycled) = match self.free.pop() {
            Some(i) => (i, None),
            None => {
                let i = self.evict()?;
                (i, self.slots[i].take().map(|slot| slot.data))
            }
        };

        let mut data = match recycled {
            Some(buf) if buf.len() == block_size => buf,
            _ => {
                let mut buf = Vec::new();
                if buf.try_reserve_exact(block_size).is_err() {
                    self.free.push(index);
                    return Err(IndexError::NoMemory);
                }
                buf.resize(block_size, DEL_BYTE);
                buf
            }
        };

        if read {
            let loaded = store.read_at(pos.offset(), &mut data).and_then(|n| {
                if n == block_size {
                    Ok(())
                } else if pos.is_null() && n >= MIN_HEADER_READ {
                    data[n..].fill(DEL_BYTE);
                    Ok(())
                } else {
                    Err(IndexError::corrupt(format!(
                        "short read of block {}: {} of {} bytes",
                        pos, n, block_size
                    )))
                }
            });
            if let Err(e) = loaded {
                self.free.push(index);
                return Err(e);
            }
        } else {
            data.fill(DEL_BYTE);
        }

        let bucket = pos.bucket(file);
        self.slots[index] = Some(Slot {
            file,
            pos,
            data,
            dirty: false,
            pinned: false,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(index);
        self.lru.touch(index);
        trace!(file, block = pos.offset(), slot = index, read, "xio.cache.load");
        Ok(index)
    }

    /// Pick the least recently used unpinned buffer, write it back if dirty
    /// and unhook it from its bucket. The slot keeps its data for reuse.
    fn evict(&mut self) -> Result<usize> {
        let victim = self
            .lru
            .iter_oldest()
            .find(|&i| self.slots[i].as_ref().is_some_and(|slot| !slot.pinned))
            .ok_or_else(|| IndexError::internal("no unpinned buffer to evict"))?;
        self.write_back(victim)?;
        self.unhook(victim);
        self.stats.evictions += 1;
        debug!(slot = victim, "xio.cache.evict");
        Ok(victim)
    }

    fn unhook(&mut self, index: usize) {
        let Some(slot) = self.slots[index].as_ref() else {
            return;
        };
        let bucket = slot.pos.bucket(slot.file);
        let after = slot.next;
        if self.buckets[bucket] == Some(index) {
            self.buckets[bucket] = after;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(i) = cur {
                let Some(prev) = self.slots[i].as_mut() else {
                    break;
                };
                if prev.next == Some(index) {
                    prev.next = after;
                    break;
                }
                cur = prev.next;
            }
        }
        self.lru.remove(index);
    }

    /// Unhook a buffer and put it on the free list
    fn discard(&mut self, index: usize) {
        self.unhook(index);
        self.slots[index] = None;
        self.free.push(index);
    }

    fn write_back(&mut self, index: usize) -> Result<()> {
        let Some(slot) = self.slots[index].as_ref() else {
            return Ok(());
        };
        if !slot.dirty {
            return Ok(());
        }
        let entry = self
            .files
            .get(&slot.file)
            .ok_or_else(|| IndexError::internal("dirty buffer of an unregistered file"))?;
        entry.store.write_at(slot.pos.offset(), &slot.data)?;
        self.stats.writes += 1;
        if let Some(slot) = self.slots[index].as_mut() {
            slot.dirty = false;
        }
        Ok(())
    }

    pub(crate) fn pin(&mut self, index: usize) {
        if let Some(slot) = self.slots[index].as_mut() {
            slot.pinned = true;
        }
    }

    pub(crate) fn unpin(&mut self, index: usize) {
        if let Some(slot) = self.slots[index].as_mut() {
            slot.pinned = false;
        }
    }

    /// Contents of a loaded buffer
    pub(crate) fn data(&self, index: usize) -> Result<&[u8]> {
        self.slots[index]
            .as_ref()
            .map(|slot| slot.data.as_slice())
            .ok_or_else(|| IndexError::internal("buffer slot is empty"))
    }

    /// Block position held by a loaded buffer
    pub(crate) fn position(&self, index: usize) -> Result<BlockPos> {
        self.slots[index]
            .as_ref()
            .map(|slot| slot.pos)
            .ok_or_else(|| IndexError::internal("buffer slot is empty"))
    }

    /// Mutable contents of a loaded buffer; marks it dirty
    pub(crate) fn data_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let slot = self.slots[index]
            .as_mut()
            .ok_or_else(|| IndexError::internal("buffer slot is empty"))?;
        slot.dirty = true;
        Ok(slot.data.as_mut_slice())
    }

    /// Write back (or drop) and free every buffer of a file. A buffer whose
    /// write fails stays cached and dirty so a later flush can retry it; the
    /// first failure is returned.
    pub(crate) fn release_file(&mut self, file: FileId, mode: Release) -> Result<()> {
        let mut first_err = None;
        for index in 0..self.slots.len() {
            if !self.slots[index].as_ref().is_some_and(|slot| slot.file == file) {
                continue;
            }
            if mode == Release::Flush {
                if let Err(e) = self.write_back(index) {
                    warn!(file, slot = index, error = %e, "xio.cache.flush_failed");
                    first_err.get_or_insert(e);
                    continue;
                }
            }
            self.discard(index);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write back and free every unpinned buffer. A failed write keeps its
    /// buffer and parks the error on the owning file.
    pub(crate) fn purge(&mut self) -> usize {
        let mut released = 0;
        for index in 0..self.slots.len() {
            let Some(slot) = self.slots[index].as_ref() else {
                continue;
            };
            if slot.pinned {
                continue;
            }
            let file = slot.file;
            if let Err(e) = self.write_back(index) {
                warn!(file, slot = index, error = %e, "xio.cache.purge_failed");
                self.park(file, e);
                continue;
            }
            self.discard(index);
            released += 1;
        }
        released
    }

    /// Keep `err` for the file's next call
    pub(crate) fn park(&mut self, file: FileId, err: IndexError) {
        if let Some(entry) = self.files.get_mut(&file) {
            entry.pending.get_or_insert(err);
        }
    }

    /// Put `image` back as the cached contents of block `pos`, dirty, loading
    /// a buffer for it if the block has left the cache. When no buffer can be
    /// had the image is written straight to the store.
    pub(crate) fn restore(&mut self, file: FileId, pos: BlockPos, image: Vec<u8>) -> Result<()> {
        let index = match self.lookup(file, pos) {
            Some(index) => index,
            None => match self.get(file, pos, image.len(), false) {
                Ok(index) => index,
                Err(e) => {
                    debug!(file, block = pos.offset(), error = %e, "xio.cache.restore_direct");
                    return self.store(file)?.write_at(pos.offset(), &image);
                }
            },
        };
        if let Some(slot) = self.slots[index].as_mut() {
            slot.data = image;
            slot.dirty = true;
        }
        Ok(())
    }

    /// Drop block `pos` of `file` from the cache without writing it
    pub(crate) fn forget(&mut self, file: FileId, pos: BlockPos) {
        if let Some(index) = self.lookup(file, pos) {
            self.discard(index);
        }
    }

    fn snapshot(&self) -> CacheStats {
        let live = self.slots.iter().flatten();
        CacheStats {
            in_use: live.clone().count(),
            dirty: live.filter(|slot| slot.dirty).count(),
            ..self.stats
        }
    }
}

/// Handle to a block buffer cache
///
/// Cloning gives another handle to the same cache. Index files opened
/// without an explicit cache share [`BufferCache::shared`].
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<Mutex<BlockCache>>,
}

impl BufferCache {
    /// Create a cache of at most `max_buffers` blocks
    pub fn new(max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BlockCache::new(max_buffers))),
        }
    }

    /// The process-wide cache
    pub fn shared() -> Self {
        static SHARED: OnceLock<BufferCache> = OnceLock::new();
        SHARED
            .get_or_init(|| BufferCache::new(DEFAULT_MAX_BUFFERS))
            .clone()
    }

    /// Give memory back: write back and free every buffer that is not part of
    /// a running operation. Returns the number of buffers freed.
    pub fn release_memory(&self) -> usize {
        let released = self.inner.lock().purge();
        debug!(released, "xio.cache.release_memory");
        released
    }

    /// Activity counters
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().snapshot()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BlockCache> {
        self.inner.lock()
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS)
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BS: usize = 1024;

    /// Memory store that refuses writes while `broken` is set
    #[derive(Default)]
    struct BrokenStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl BlockStore for BrokenStore {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
            if self.broken.load(Ordering::Relaxed) {
                return Err(IndexError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "write refused",
                )));
            }
            self.inner.write_at(offset, data)
        }

        fn lock(&self) -> Result<()> {
            Ok(())
        }

        fn unlock(&self) -> Result<()> {
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn remove(&self) -> Result<()> {
            self.inner.remove()
        }
    }

    fn cache_with_file(capacity: usize) -> Result<(BufferCache, FileId, Arc<MemoryStore>)> {
        let store = Arc::new(MemoryStore::new());
        store.write_at(0, &vec![0u8; BS * 8])?;
        let cache = BufferCache::new(capacity);
        let file = cache.lock().register(store.clone());
        Ok((cache, file, store))
    }

    #[test]
    fn test_hit_and_miss() -> Result<()> {
        let (cache, file, _store) = cache_with_file(4)?;
        let mut inner = cache.lock();
        let a = inner.get(file, BlockPos::new(1024), BS, true)?;
        let b = inner.get(file, BlockPos::new(1024), BS, true)?;
        assert_eq!(a, b);
        assert_eq!(inner.stats.hits, 1);
        assert_eq!(inner.stats.misses, 1);
        Ok(())
    }

    #[test]
    fn test_eviction_writes_dirty_block() -> Result<()> {
        let (cache, file, store) = cache_with_file(4)?;
        let mut inner = cache.lock();
        let first = inner.get(file, BlockPos::new(1024), BS, true)?;
        inner.data_mut(first)?[0] = b'V';
        for i in 2..6 {
            inner.get(file, BlockPos::new(i * 1024), BS, true)?;
        }
        drop(inner);

        let mut buf = [0u8; 1];
        store.read_at(1024, &mut buf)?;
        assert_eq!(buf[0], b'V');
        assert_eq!(cache.stats().evictions, 1);
        Ok(())
    }

    #[test]
    fn test_all_pinned_is_internal_error() -> Result<()> {
        let (cache, file, _store) = cache_with_file(4)?;
        let mut inner = cache.lock();
        for i in 1..5 {
            let slot = inner.get(file, BlockPos::new(i * 1024), BS, true)?;
            inner.pin(slot);
        }
        let err = inner.get(file, BlockPos::new(5 * 1024), BS, true);
        assert!(matches!(err, Err(ref e) if e.is_internal()));
        Ok(())
    }

    #[test]
    fn test_short_read_is_corrupt() -> Result<()> {
        let (cache, file, _store) = cache_with_file(4)?;
        let mut inner = cache.lock();
        let err = inner.get(file, BlockPos::new(100 * 1024), BS, true);
        assert!(matches!(err, Err(IndexError::IndexCorrupt(_))));
        assert_eq!(inner.free.len(), 4);

        // An unread block is filled instead
        let slot = inner.get(file, BlockPos::new(100 * 1024), BS, false)?;
        assert!(inner.data(slot)?.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_release_file_discard_drops_changes() -> Result<()> {
        let (cache, file, store) = cache_with_file(8)?;
        let mut inner = cache.lock();
        let slot = inner.get(file, BlockPos::new(2048), BS, true)?;
        inner.data_mut(slot)?[0] = b'X';
        inner.release_file(file, Release::Discard)?;
        assert_eq!(inner.snapshot().in_use, 0);
        drop(inner);

        let mut buf = [0u8; 1];
        store.read_at(2048, &mut buf)?;
        assert_eq!(buf[0], 0);
        Ok(())
    }

    #[test]
    fn test_release_memory_keeps_pinned() -> Result<()> {
        let (cache, file, store) = cache_with_file(8)?;
        {
            let mut inner = cache.lock();
            let pinned = inner.get(file, BlockPos::new(1024), BS, true)?;
            inner.pin(pinned);
            let loose = inner.get(file, BlockPos::new(2048), BS, true)?;
            inner.data_mut(loose)?[0] = b'U';
        }
        assert_eq!(cache.release_memory(), 1);
        assert_eq!(cache.stats().in_use, 1);

        let mut buf = [0u8; 1];
        store.read_at(2048, &mut buf)?;
        assert_eq!(buf[0], b'U');
        Ok(())
    }

    #[test]
    fn test_bucket_chain_survives_removal() -> Result<()> {
        // Positions 256 bytes apart from one bucket stride share a chain
        let (cache, file, _store) = cache_with_file(8)?;
        let mut inner = cache.lock();
        let a = BlockPos::new(1024);
        let b = BlockPos::new(1024 + 256 * 256);
        assert_eq!(a.bucket(file), b.bucket(file));
        inner.store(file)?.write_at(b.offset(), &[0u8; BS])?;

        let sa = inner.get(file, a, BS, true)?;
        let sb = inner.get(file, b, BS, true)?;
        inner.discard(sb);
        assert_eq!(inner.lookup(file, a), Some(sa));
        assert_eq!(inner.lookup(file, b), None);
        Ok(())
    }

    #[test]
    fn test_failed_purge_keeps_block_and_parks_error() -> Result<()> {
        let store = Arc::new(BrokenStore::default());
        store.write_at(0, &vec![0u8; BS * 4])?;
        let cache = BufferCache::new(8);
        let file = cache.lock().register(store.clone());
        {
            let mut inner = cache.lock();
            let slot = inner.get(file, BlockPos::new(1024), BS, true)?;
            inner.data_mut(slot)?[0] = b'V';
        }

        store.broken.store(true, Ordering::Relaxed);
        assert_eq!(cache.release_memory(), 0);
        assert_eq!(cache.stats().dirty, 1);
        assert!(matches!(cache.lock().take_pending(file), Some(IndexError::Io(_))));
        assert!(cache.lock().take_pending(file).is_none());

        store.broken.store(false, Ordering::Relaxed);
        assert_eq!(cache.release_memory(), 1);
        let mut buf = [0u8; 1];
        store.read_at(1024, &mut buf)?;
        assert_eq!(buf[0], b'V');
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_dirty_block() -> Result<()> {
        let store = Arc::new(BrokenStore::default());
        store.write_at(0, &vec![0u8; BS * 4])?;
        let cache = BufferCache::new(8);
        let file = cache.lock().register(store.clone());
        let mut inner = cache.lock();
        let dirty = inner.get(file, BlockPos::new(1024), BS, true)?;
        inner.data_mut(dirty)?[0] = b'U';
        inner.get(file, BlockPos::new(2048), BS, true)?;

        store.broken.store(true, Ordering::Relaxed);
        assert!(inner.release_file(file, Release::Flush).is_err());
        assert_eq!(inner.snapshot().in_use, 1);
        assert_eq!(inner.snapshot().dirty, 1);

        store.broken.store(false, Ordering::Relaxed);
        inner.release_file(file, Release::Flush)?;
        assert_eq!(inner.snapshot().in_use, 0);
        let mut buf = [0u8; 1];
        store.read_at(1024, &mut buf)?;
        assert_eq!(buf[0], b'U');
        Ok(())
    }

    #[test]
    fn test_restore_and_forget_uncached_block() -> Result<()> {
        let (cache, file, store) = cache_with_file(4)?;
        let mut inner = cache.lock();
        inner.restore(file, BlockPos::new(3072), vec![b'R'; BS])?;
        let slot = inner.lookup(file, BlockPos::new(3072)).ok_or_else(|| IndexError::internal("not cached"))?;
        assert_eq!(inner.data(slot)?[0], b'R');
        assert_eq!(inner.snapshot().dirty, 1);

        inner.forget(file, BlockPos::new(3072));
        assert_eq!(inner.snapshot().in_use, 0);
        drop(inner);
        let mut buf = [0u8; 1];
        store.read_at(3072, &mut buf)?;
        assert_eq!(buf[0], 0);
        Ok(())
    }
}
