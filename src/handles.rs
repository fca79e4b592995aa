//! Integer-handle call surface.
//!
//! Callers that speak in status codes open files through an [`IndexTable`]
//! and get back a small positive handle. Every call returns an `i32`: the
//! operation's own status on success (0, or a [`KeyState`] code for moves)
//! and a negative [`IndexError::code`] on failure.

use crate::error::{IndexError, Result};
use crate::types::KeyState;
use crate::{IndexFile, OpenOptions, RecordCell};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Open index files keyed by handle
#[derive(Debug, Default)]
pub struct IndexTable {
    files: HashMap<i32, IndexFile>,
    next: i32,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file; returns its handle or a negative error code
    pub fn open<P: AsRef<Path>>(&mut self, path: P, options: &OpenOptions, record: RecordCell) -> i32 {
        match IndexFile::open(path, options, record) {
            Ok(file) => {
                let handle = self.next_handle();
                self.files.insert(handle, file);
                handle
            }
            Err(e) => status::<()>(Err(e), |_| 0),
        }
    }

    /// The open file behind `handle`
    pub fn file(&mut self, handle: i32) -> Result<&mut IndexFile> {
        self.files.get_mut(&handle).ok_or(IndexError::InvalidHandle)
    }

    /// Record-file name of an open file
    pub fn text_name(&self, handle: i32) -> Result<String> {
        self.files
            .get(&handle)
            .map(IndexFile::text_name)
            .ok_or(IndexError::InvalidHandle)
    }

    pub fn close(&mut self, handle: i32) -> i32 {
        match self.files.remove(&handle) {
            Some(file) => status(file.close(), |_| 0),
            None => IndexError::InvalidHandle.code(),
        }
    }

    /// Close the file and delete it
    pub fn kill(&mut self, handle: i32) -> i32 {
        match self.files.remove(&handle) {
            Some(file) => status(file.kill(), |_| 0),
            None => IndexError::InvalidHandle.code(),
        }
    }

    pub fn find(&mut self, handle: i32, key: &[u8]) -> i32 {
        status(self.file(handle).and_then(|f| f.find(key)), KeyState::code)
    }

    pub fn find_last(&mut self, handle: i32, key: &[u8]) -> i32 {
        status(self.file(handle).and_then(|f| f.find_last(key)), KeyState::code)
    }

    pub fn next(&mut self, handle: i32) -> i32 {
        status(self.file(handle).and_then(IndexFile::next), KeyState::code)
    }

    pub fn prev(&mut self, handle: i32) -> i32 {
        status(self.file(handle).and_then(IndexFile::prev), KeyState::code)
    }

    /// 0 inserted, 1 duplicate key, 2 duplicate key and position
    pub fn insert(&mut self, handle: i32, key: &[u8]) -> i32 {
        status(self.file(handle).and_then(|f| f.insert(key)), |o| o.code())
    }

    /// 0 deleted, 1 not found
    pub fn delete(&mut self, handle: i32, key: &[u8], by_position: bool) -> i32 {
        status(
            self.file(handle).and_then(|f| f.delete(key, by_position)),
            |o| o.code(),
        )
    }

    /// 0 when a slot was reserved into the record cell, 1 when none is free
    pub fn reserve_record_slot(&mut self, handle: i32) -> i32 {
        status(
            self.file(handle).and_then(IndexFile::reserve_record_slot),
            |o| o.code(),
        )
    }

    /// 0 released, 1 when the file keeps no slot list
    pub fn release_record_slot(&mut self, handle: i32) -> i32 {
        status(
            self.file(handle).and_then(IndexFile::release_record_slot),
            |o| o.code(),
        )
    }

    pub fn flush(&mut self, handle: i32) -> i32 {
        status(self.file(handle).and_then(IndexFile::flush), |_| 0)
    }

    /// Number of open files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn next_handle(&mut self) -> i32 {
        loop {
            self.next = if self.next >= i32::MAX { 1 } else { self.next + 1 };
            if !self.files.contains_key(&self.next) {
                return self.next;
            }
        }
    }
}

fn status<T>(result: Result<T>, code: impl FnOnce(T) -> i32) -> i32 {
    match result {
        Ok(value) => code(value),
        Err(e) => {
            debug!(code = e.code(), error = %e, "xio.handle.failed");
            e.code()
        }
    }
}
