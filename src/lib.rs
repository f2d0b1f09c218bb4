// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious RAM, heaps and maps with resizable capacity.
//!
//! The crate is built bottom-up:
//!
//! - [`store`]: fixed-size encrypted records in memory, in a file, or split between the two.
//! - [`crypto`]: AES-256-GCM sealing of every bucket before it reaches a store.
//! - [`path_oram::PathOram`]: a static Path ORAM over a power-of-two number of positions.
//! - [`path_oheap::PathOheap`]: a static oblivious min-heap using the same tree and stash mechanics.
//! - [`path_avl_omap::PathAvlOmap`]: a static oblivious map, an AVL tree whose nodes live in a Path ORAM.
//! - [`dynamic`]: resizable wrappers that pair two static structures of adjacent power-of-two capacities.
//!
//! Every operation takes the encryption key and a cryptographically secure RNG as parameters.
//! "Not found" results are reported as `Ok(None)`; store, crypto and capacity failures are errors.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::num::TryFromIntError;
use thiserror::Error;

pub(crate) mod bucket;
pub mod crypto;
pub mod dynamic;
pub mod path_avl_omap;
pub mod path_oheap;
pub mod path_oram;
pub(crate) mod stash;
pub mod store;
pub(crate) mod tree;

#[cfg(test)]
mod test_utils;

pub use bucket::Block;
pub use crypto::EncryptionKey;
pub use dynamic::{oheap::DynamicOheap, omap::DynamicOmap, oram::DynamicOram};
pub use path_avl_omap::PathAvlOmap;
pub use path_oheap::PathOheap;
pub use path_oram::{OramOptions, PathOram};
pub use store::StorageConfig;

/// A leaf identifier in `1..=capacity`. Zero marks a block with no position.
pub type Position = u32;

/// A caller-chosen identifier for a stored element. Zero is reserved.
pub type Key = u32;

/// The number of blocks in a bucket ("Z" in the Path ORAM literature).
pub type BucketSize = usize;

/// The cost and occupancy counters every structure in this crate exposes.
///
/// The counters are cumulative and never decrease. They are meant for reporting only.
pub trait Measured {
    /// The number of elements the structure can hold.
    fn capacity(&self) -> usize;
    /// The number of live elements.
    fn size(&self) -> usize;
    /// The number of path reads, path writes and single-bucket reads performed so far.
    fn memory_access_count(&self) -> u64;
    /// The number of encrypted bytes moved to or from the block store so far.
    fn memory_bytes_moved(&self) -> u64;
    /// Whether part of the structure lives in a file.
    fn is_on_disk(&self) -> bool;
}

/// Errors produced by this crate.
#[derive(Error, Debug)]
pub enum OramError {
    /// A block store read or write failed.
    #[error("Block store I/O failed")]
    IoError(#[from] std::io::Error),
    /// A block store was addressed outside of its entries.
    #[error("Block store index {index} is out of range for a store of {len} entries")]
    StoreIndexOutOfRangeError {
        /// The requested index.
        index: usize,
        /// The number of entries in the store.
        len: usize,
    },
    /// A record of the wrong size was written to a block store.
    #[error("Expected a record of {expected} bytes, got {actual}")]
    EntrySizeMismatchError {
        /// The configured record size.
        expected: usize,
        /// The size of the record that was written.
        actual: usize,
    },
    /// Sealing a bucket failed.
    #[error("Encryption failed")]
    EncryptionError,
    /// A stored bucket could not be authenticated with the given key.
    #[error("Decryption failed: corrupted storage or wrong key")]
    DecryptionError,
    /// Decrypted bytes did not have the layout of a bucket or map node.
    #[error("Malformed plaintext of {len} bytes")]
    MalformedPlaintextError {
        /// Length of the offending plaintext.
        len: usize,
    },
    /// A position outside `1..=capacity` was supplied.
    #[error("Position {position} is out of bounds for capacity {capacity}")]
    PositionOutOfBoundsError {
        /// The offending position.
        position: Position,
        /// The capacity of the structure.
        capacity: usize,
    },
    /// An insertion was attempted on a full structure.
    #[error("Capacity {capacity} exceeded")]
    CapacityExceededError {
        /// The capacity of the structure.
        capacity: usize,
    },
    /// `shrink` was called on a structure of capacity 0.
    #[error("Cannot shrink a structure of capacity 0")]
    NothingToShrinkError,
    /// `shrink` would leave fewer slots than live elements.
    #[error("Cannot shrink below the {size} live elements")]
    ShrinkBelowSizeError {
        /// The number of live elements.
        size: usize,
    },
    /// The reserved key 0 was used to name a real element.
    #[error("Key 0 is reserved")]
    ReservedKeyError,
    /// A value of the wrong length was supplied.
    #[error("Expected a value of {expected} bytes, got {actual}")]
    ValueLengthMismatchError {
        /// The configured value length.
        expected: usize,
        /// The length of the supplied value.
        actual: usize,
    },
    /// Key allocation was requested from an ORAM constructed without it.
    #[error("Key generation is not enabled for this ORAM")]
    KeyGenerationDisabledError,
    /// A map node expected in the operation cache was not there.
    #[error("Map node {key} is missing from the node cache")]
    MissingNodeError {
        /// The ORAM key of the missing node.
        key: Key,
    },
    /// The structure was configured with invalid parameters.
    #[error("Invalid configuration")]
    InvalidConfigurationError,
    /// An integer conversion failed.
    #[error("Arithmetic error encountered")]
    IntegerConversionError(#[from] TryFromIntError),
}
