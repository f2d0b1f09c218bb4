// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious min-heap built on the Path ORAM tree and stash.

use crate::{
    bucket::{Block, Bucket, HeapBucket, MAX_BLOCKS_PER_BUCKET},
    crypto::{self, EncryptionKey},
    path_oram::mark,
    stash::Stash,
    store::{BlockStore, StorageConfig},
    tree::{children, sibling, TreeIndex, TreeLayout},
    BucketSize, Key, Measured, OramError, Position,
};
use rand::{CryptoRng, RngCore};
use static_assertions::const_assert;
use std::collections::HashSet;
use subtle::{Choice, ConditionallySelectable, ConstantTimeLess};

/// The number of blocks per heap bucket, not counting the cached subtree minimum.
pub const HEAP_BLOCKS_PER_BUCKET: BucketSize = 3;

const_assert!(HEAP_BLOCKS_PER_BUCKET <= MAX_BLOCKS_PER_BUCKET);

type OheapBucket = HeapBucket<HEAP_BLOCKS_PER_BUCKET>;

/// A min-heap of `capacity` entries ordered by key, each carrying a value of `value_len` bytes.
///
/// Every bucket caches the minimum block of the subtree it roots, so the global minimum is
/// read from the root. Every insertion and extraction reads and rewrites one random path in
/// each half of the tree, so the pattern does not reveal where the element lives.
/// Keys may repeat.
#[derive(Debug)]
pub struct PathOheap<S: BlockStore = Box<dyn BlockStore>> {
    pub(crate) physical_memory: S,
    layout: TreeLayout,
    value_len: usize,
    size: usize,
    stash: Stash,
    written: HashSet<TreeIndex>,
    memory_access_count: u64,
    memory_bytes_moved: u64,
    plaintext: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl PathOheap {
    /// Returns an empty heap of `capacity` entries with values of `value_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `capacity` is not a power of two.
    pub fn new(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError> {
        let layout = TreeLayout::leaf_per_position(capacity)?;
        let store = storage.open_tree_store(
            layout.num_buckets(),
            Self::encrypted_bucket_len(value_len),
            layout.depth(),
        );
        Self::with_store(capacity, value_len, store)
    }
}

impl<S: BlockStore> PathOheap<S> {
    /// Returns an empty heap over a caller-provided store.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `capacity` is not a power of two or the store
    /// has the wrong shape.
    pub fn with_store(capacity: usize, value_len: usize, store: S) -> Result<Self, OramError> {
        log::debug!(
            "PathOheap::new(capacity = {}, value_len = {}, Z = {})",
            capacity,
            value_len,
            HEAP_BLOCKS_PER_BUCKET
        );

        let layout = TreeLayout::leaf_per_position(capacity)?;
        if store.len() != layout.num_buckets()
            || store.entry_size() != Self::encrypted_bucket_len(value_len)
        {
            return Err(OramError::InvalidConfigurationError);
        }

        Ok(Self {
            physical_memory: store,
            layout,
            value_len,
            size: 0,
            stash: Stash::default(),
            written: HashSet::new(),
            memory_access_count: 0,
            memory_bytes_moved: 0,
            plaintext: Vec::with_capacity(OheapBucket::encoded_len(value_len)),
            ciphertext: Vec::with_capacity(Self::encrypted_bucket_len(value_len)),
        })
    }

    /// The size of one encrypted bucket in the store.
    pub fn encrypted_bucket_len(value_len: usize) -> usize {
        crypto::ciphertext_len(OheapBucket::encoded_len(value_len))
    }

    /// Writes an encrypted empty bucket to every slot of the store.
    ///
    /// # Errors
    ///
    /// Propagates store and encryption failures.
    pub fn fill_with_dummies<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let num_buckets = self.layout.num_buckets();
        self.memory_access_count += 1;
        self.memory_bytes_moved +=
            (num_buckets * Self::encrypted_bucket_len(self.value_len)) as u64;

        self.plaintext.clear();
        OheapBucket::default().encode_into(self.value_len, &mut self.plaintext);
        for index in 0..num_buckets {
            crypto::encrypt_into(&self.plaintext, key, rng, &mut self.ciphertext)?;
            self.physical_memory.write(index, &self.ciphertext)?;
        }
        Ok(())
    }

    /// Returns the entry with the smallest key without removing it.
    ///
    /// With `pad`, also performs the path traffic of an insertion, so that the call cannot be
    /// told apart from one.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn find_min<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
        pad: bool,
    ) -> Result<Option<Block>, OramError> {
        self.memory_access_count += 1;
        self.memory_bytes_moved += Self::encrypted_bucket_len(self.value_len) as u64;

        let tree_min = if self.written.contains(&0) {
            self.read_bucket(0, key)?.subtree_min
        } else {
            None
        };
        // Blocks still waiting in the stash are not summarized by any bucket.
        let min = smaller(tree_min, smallest(self.stash.blocks()).cloned());

        if pad {
            self.dummy_access(key, rng, false)?;
        }
        Ok(min)
    }

    /// Removes and returns the entry with the smallest key.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn extract_min<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Block>, OramError> {
        let min = match self.find_min(key, rng, false)? {
            Some(min) => min,
            None => {
                self.dummy_access(key, rng, false)?;
                return Ok(None);
            }
        };

        let second_position = self.layout.random_position_in_other_half(min.position, rng);

        if !self.read_path(min.position, Some(&min), key)? {
            // The minimum had not been evicted from the stash yet.
            self.stash.take_exact(&min);
        }
        self.update_min_and_evict(min.position, key, rng)?;
        self.read_path(second_position, None, key)?;
        self.update_min_and_evict(second_position, key, rng)?;

        self.size -= 1;
        Ok(Some(min))
    }

    /// Inserts an entry with priority `block_key` and payload `value`.
    ///
    /// # Errors
    ///
    /// Returns a `CapacityExceededError` if the heap is full, a `ReservedKeyError` for priority 0
    /// and a `ValueLengthMismatchError` for a value of the wrong length.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        block_key: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if self.size >= self.layout.capacity() {
            return Err(OramError::CapacityExceededError {
                capacity: self.layout.capacity(),
            });
        }
        if block_key == 0 {
            return Err(OramError::ReservedKeyError);
        }
        if value.len() != self.value_len {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.value_len,
                actual: value.len(),
            });
        }

        self.find_min(key, rng, false)?;
        let position = self.layout.random_position(rng);
        let (first, second) = self.layout.random_path_pair(rng);
        self.stash.push(Block::new(position, block_key, value));

        self.read_path(first, None, key)?;
        self.update_min_and_evict(first, key, rng)?;
        self.read_path(second, None, key)?;
        self.update_min_and_evict(second, key, rng)?;

        self.size += 1;
        Ok(())
    }

    /// Performs the path traffic of an insertion, preceded by that of a `find_min` if
    /// `with_find_min` is set, without changing the heap.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn dummy_access<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
        with_find_min: bool,
    ) -> Result<(), OramError> {
        if with_find_min {
            self.find_min(key, rng, false)?;
        }
        let (first, second) = self.layout.random_path_pair(rng);
        self.read_path(first, None, key)?;
        self.update_min_and_evict(first, key, rng)?;
        self.read_path(second, None, key)?;
        self.update_min_and_evict(second, key, rng)
    }

    fn read_bucket(
        &mut self,
        index: TreeIndex,
        key: &EncryptionKey,
    ) -> Result<OheapBucket, OramError> {
        let ciphertext = self.physical_memory.read(index)?;
        crypto::decrypt_into(ciphertext, key, &mut self.plaintext)?;
        OheapBucket::decode(&self.plaintext, self.value_len)
    }

    /// Moves the blocks on the path of `position` into the stash, dropping the first block equal
    /// to `target`. Returns whether `target` was found.
    fn read_path(
        &mut self,
        position: Position,
        target: Option<&Block>,
        key: &EncryptionKey,
    ) -> Result<bool, OramError> {
        let bucket_len = Self::encrypted_bucket_len(self.value_len);
        self.memory_access_count += 1;
        self.memory_bytes_moved += ((self.layout.depth() as usize + 1) * bucket_len) as u64;

        let mut found = false;
        for level in 0..=self.layout.depth() {
            let index = self.layout.node_on_path(position, level);
            if !self.written.contains(&index) {
                break;
            }

            let bucket = self.read_bucket(index, key)?;
            let (left, right) = children(index);
            mark(&mut self.written, left, bucket.bucket.left_child_written);
            mark(&mut self.written, right, bucket.bucket.right_child_written);

            for block in bucket.bucket.blocks {
                if !found && target == Some(&block) {
                    found = true;
                } else {
                    self.stash.push(block);
                }
            }
        }
        Ok(found)
    }

    /// The cached minimum of the sibling of `index`, if the sibling has been written.
    fn sibling_min(
        &mut self,
        index: TreeIndex,
        key: &EncryptionKey,
    ) -> Result<Option<Block>, OramError> {
        match sibling(index) {
            Some(sibling_index) if self.written.contains(&sibling_index) => {
                self.memory_bytes_moved += Self::encrypted_bucket_len(self.value_len) as u64;
                Ok(self.read_bucket(sibling_index, key)?.subtree_min)
            }
            _ => Ok(None),
        }
    }

    /// Evicts the stash into the path of `position`, deepest bucket first, recomputing the
    /// cached subtree minimum of every bucket on the way up.
    fn update_min_and_evict<R: RngCore + CryptoRng>(
        &mut self,
        position: Position,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let bucket_len = Self::encrypted_bucket_len(self.value_len);
        self.memory_access_count += 1;
        self.memory_bytes_moved += ((self.layout.depth() as usize + 1) * bucket_len) as u64;

        // The minimum over the children of the bucket being written.
        let mut children_min: Option<Block> = None;
        for level in (0..=self.layout.depth()).rev() {
            let index = self.layout.node_on_path(position, level);
            let blocks =
                self.stash
                    .take_for_bucket(&self.layout, level, index, HEAP_BLOCKS_PER_BUCKET);
            self.written.insert(index);

            let subtree_min = smaller(smallest(&blocks).cloned(), children_min);
            let sibling_min = self.sibling_min(index, key)?;
            children_min = smaller(subtree_min.clone(), sibling_min);

            let (left, right) = children(index);
            let bucket = OheapBucket {
                bucket: Bucket {
                    blocks,
                    left_child_written: self.written.contains(&left),
                    right_child_written: self.written.contains(&right),
                },
                subtree_min,
            };

            self.plaintext.clear();
            bucket.encode_into(self.value_len, &mut self.plaintext);
            crypto::encrypt_into(&self.plaintext, key, rng, &mut self.ciphertext)?;
            self.physical_memory.write(index, &self.ciphertext)?;
        }

        self.written.clear();
        self.written.insert(0);
        Ok(())
    }
}

/// The first block with the smallest key.
fn smallest(blocks: &[Block]) -> Option<&Block> {
    let mut best_index = 0u64;
    let mut best_key = Key::MAX;
    for (i, block) in blocks.iter().enumerate() {
        // Ties go to the earlier block, and the first block always beats the initial sentinel.
        let is_better = block.key.ct_lt(&best_key) | Choice::from(u8::from(i == 0));
        best_key.conditional_assign(&block.key, is_better);
        best_index.conditional_assign(&(i as u64), is_better);
    }
    blocks.get(best_index as usize)
}

/// The block with the smaller key, preferring `a` on ties.
fn smaller(a: Option<Block>, b: Option<Block>) -> Option<Block> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.key < a.key { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

impl<S: BlockStore> Measured for PathOheap<S> {
    fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn memory_access_count(&self) -> u64 {
        self.memory_access_count
    }

    fn memory_bytes_moved(&self) -> u64 {
        self.memory_bytes_moved
    }

    fn is_on_disk(&self) -> bool {
        self.physical_memory.is_on_disk()
    }
}
