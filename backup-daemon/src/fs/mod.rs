//! File system helpers: traversal, hashing and metadata-preserving copies.

pub mod hash;
pub mod metadata;
pub mod walker;
