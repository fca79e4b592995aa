//! Block buffer cache with LRU eviction.
//!
//! The cache keeps recently used blocks in memory across calls. Each call
//! borrows it through a session that pins its working blocks.

mod lru;
mod pool;
mod session;

pub use pool::{BufferCache, CacheStats, MIN_BUFFERS};
pub(crate) use pool::FileId;
pub(crate) use session::{EndMode, Role, Session};
