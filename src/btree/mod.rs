//! B-tree over index blocks.
//!
//! This module provides the tree operations of one index call:
//! - Search and in-order stepping (`tree`)
//! - The per-handle navigator (`cursor`)
//! - Insertion with offload and split (`insert`)
//! - Deletion with brother collapse (`delete`)
//! - Statistics, dumps and structural checks (`inspect`)

mod cursor;
mod delete;
mod insert;
mod inspect;
mod tree;

pub(crate) use cursor::Cursor;
pub use inspect::{IndexStats, TreeNode};
pub(crate) use tree::TreeOp;
