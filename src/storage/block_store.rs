//! Byte-addressed storage behind an index file.
//!
//! The engine never touches a file directly. Every read, write and lock goes
//! through a [`BlockStore`], which makes the file layer swappable and lets
//! tests run against memory or inject failures.

use crate::error::{IndexError, Result};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Trait for positioned I/O on an index file
///
/// This abstraction allows swapping the storage backend or mocking for tests.
pub trait BlockStore: Send + Sync {
    /// Read into `buf` at `offset`. Returns the number of bytes read, which is
    /// short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data` at `offset`, extending the file if needed
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Take the exclusive lock used around structural changes
    fn lock(&self) -> Result<()>;

    /// Release the lock taken by [`BlockStore::lock`]
    fn unlock(&self) -> Result<()>;

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()>;

    /// Delete the underlying file
    fn remove(&self) -> Result<()>;

    /// Path of the underlying file, if it has one
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// File-backed store
pub struct FileStore {
    /// The index file
    file: RwLock<File>,
    /// Path it was opened from
    path: PathBuf,
}

impl FileStore {
    /// Open an existing file
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Create a file, truncating any existing one
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
        })
    }
}

impl BlockStore for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn lock(&self) -> Result<()> {
        let file = self.file.read();
        file.lock_exclusive().map_err(IndexError::Lock)
    }

    fn unlock(&self) -> Result<()> {
        let file = self.file.read();
        file.unlock().map_err(IndexError::Lock)
    }

    fn sync(&self) -> Result<()> {
        let file = self.file.read();
        file.sync_all()?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// In-memory store, used for tests and scratch indexes
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True when nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
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
        self.data.lock().clear();
        Ok(())
    }
}
