//! Block layer: geometry, collation, key entries and node codecs.

mod collate;
pub mod entry;
mod layout;
mod node;

pub use collate::Collation;
pub use entry::{normalize_key, KeyEntry};
pub use layout::Layout;
pub use node::{decode_deleted, encode_deleted, BranchNode, LeafNode, Node, SlotNode};
