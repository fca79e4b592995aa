//! Storage layer: positioned file I/O, the header block and free space.
//!
//! This module provides the store abstraction every read and write goes
//! through, the index file header format, and the free-block and
//! free-record-slot chains.

mod block_store;
mod file_header;
mod freelist;

pub use block_store::{BlockStore, FileStore, MemoryStore};
pub use file_header::{FileHeader, Pointers, MAX_BLOCK_SIZE};
