// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM over an encrypted block store.

use crate::{
    bucket::{Block, Bucket, MAX_BLOCKS_PER_BUCKET},
    crypto::{self, EncryptionKey},
    stash::Stash,
    store::{BlockStore, StorageConfig},
    tree::{children, TreeIndex, TreeLayout},
    BucketSize, Key, Measured, OramError, Position,
};
use rand::{CryptoRng, RngCore};
use static_assertions::const_assert;
use std::collections::{HashMap, HashSet};

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket.
/// Here we adopt the conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

const_assert!(DEFAULT_BLOCKS_PER_BUCKET <= MAX_BLOCKS_PER_BUCKET);

/// Optional bookkeeping a `PathOram` can do on behalf of its client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OramOptions {
    /// Keep a key-to-position map, so that clients address blocks by key alone.
    pub position_map: bool,
    /// Hand out fresh keys with [`PathOram::next_key`] and recycle them with
    /// [`PathOram::add_freed_key`].
    pub key_generation: bool,
}

/// A monotonic key allocator that reuses freed keys.
#[derive(Debug)]
struct KeyAllocator {
    next_key: Key,
    freed: Vec<Key>,
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self {
            next_key: 1,
            freed: Vec::new(),
        }
    }
}

impl KeyAllocator {
    fn next(&mut self) -> Key {
        match self.freed.pop() {
            Some(key) => key,
            None => {
                let key = self.next_key;
                self.next_key += 1;
                key
            }
        }
    }

    fn free(&mut self, key: Key) {
        if key + 1 == self.next_key {
            self.next_key -= 1;
        } else {
            self.freed.push(key);
        }
    }
}

/// A Path ORAM holding `capacity` blocks of `value_len` bytes each.
///
/// ## Layout
///
/// Blocks are mapped to positions `1..=capacity`. Two consecutive positions share a leaf
/// bucket, so the tree has `capacity - 1` buckets of `Z` = [`DEFAULT_BLOCKS_PER_BUCKET`] blocks.
/// Every bucket is encrypted with a fresh nonce each time it is written.
///
/// ## Security
///
/// Every public operation reads one path and writes one path, each chosen uniformly at random
/// from the point of view of the store, independently of the key or whether it is present.
/// The read skips buckets that have never been written, which depends only on the history of
/// paths, not on their contents. The stash is not bounded, so a pathological stash growth is
/// visible in memory use but never in the access pattern.
#[derive(Debug)]
pub struct PathOram<S: BlockStore = Box<dyn BlockStore>> {
    /// The untrusted memory holding the encrypted buckets.
    pub(crate) physical_memory: S,
    layout: TreeLayout,
    value_len: usize,
    size: usize,
    stash: Stash,
    position_map: Option<HashMap<Key, Position>>,
    key_allocator: Option<KeyAllocator>,
    /// Buckets known to have been written; anything else on a path is known to be empty.
    written: HashSet<TreeIndex>,
    memory_access_count: u64,
    memory_bytes_moved: u64,
    plaintext: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl PathOram {
    /// Returns an empty `PathOram` of `capacity` blocks of `value_len` bytes, stored as `storage` asks.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `capacity` is not a power of two.
    pub fn new(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
        options: OramOptions,
    ) -> Result<Self, OramError> {
        let layout = TreeLayout::shared_leaves(capacity)?;
        let store = storage.open_tree_store(
            layout.num_buckets(),
            Self::encrypted_bucket_len(value_len),
            layout.depth(),
        );
        Self::with_store(capacity, value_len, store, options)
    }
}

impl<S: BlockStore> PathOram<S> {
    /// Returns an empty `PathOram` over a caller-provided store.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `capacity` is not a power of two, or if the
    /// store does not have one record of [`PathOram::encrypted_bucket_len`] bytes per bucket.
    pub fn with_store(
        capacity: usize,
        value_len: usize,
        store: S,
        options: OramOptions,
    ) -> Result<Self, OramError> {
        log::debug!(
            "PathOram::new(capacity = {}, value_len = {}, Z = {})",
            capacity,
            value_len,
            DEFAULT_BLOCKS_PER_BUCKET
        );

        let layout = TreeLayout::shared_leaves(capacity)?;
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
            position_map: options.position_map.then(HashMap::new),
            key_allocator: options.key_generation.then(KeyAllocator::default),
            written: HashSet::new(),
            memory_access_count: 0,
            memory_bytes_moved: 0,
            plaintext: Vec::with_capacity(Bucket::<DEFAULT_BLOCKS_PER_BUCKET>::encoded_len(
                value_len,
            )),
            ciphertext: Vec::with_capacity(Self::encrypted_bucket_len(value_len)),
        })
    }

    /// The size of one encrypted bucket in the store.
    pub fn encrypted_bucket_len(value_len: usize) -> usize {
        crypto::ciphertext_len(Bucket::<DEFAULT_BLOCKS_PER_BUCKET>::encoded_len(value_len))
    }

    /// The length of the values held by this ORAM.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// The number of blocks currently held in the stash.
    pub fn stash_size(&self) -> usize {
        self.stash.len()
    }

    /// Samples a position uniformly from `1..=capacity`.
    pub fn random_position<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Position {
        self.layout.random_position(rng)
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
        Bucket::<DEFAULT_BLOCKS_PER_BUCKET>::default()
            .encode_into(self.value_len, &mut self.plaintext);
        for index in 0..num_buckets {
            crypto::encrypt_into(&self.plaintext, key, rng, &mut self.ciphertext)?;
            self.physical_memory.write(index, &self.ciphertext)?;
        }
        Ok(())
    }

    /// Reads the block with key `block_key`, assigning it a fresh random position.
    ///
    /// `position` is ignored when the ORAM keeps a position map. Returns `None` if the block is
    /// absent; the access pattern is the same either way.
    ///
    /// # Errors
    ///
    /// Returns a `PositionOutOfBoundsError` for a position outside `1..=capacity`, and
    /// propagates store and crypto failures.
    pub fn read<R: RngCore + CryptoRng>(
        &mut self,
        position: Position,
        block_key: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Block>, OramError> {
        let position = match self.current_position(position, block_key)? {
            Some(position) => position,
            None => {
                self.dummy_access(key, rng)?;
                return Ok(None);
            }
        };

        let new_position = self.layout.random_position(rng);
        let mut result = self.read_path(position, block_key, key)?;
        match result.as_mut() {
            Some(block) => {
                block.position = new_position;
                self.stash.push(block.clone());
            }
            None => result = self.stash.reposition(block_key, position, new_position),
        }
        if result.is_some() {
            if let Some(position_map) = self.position_map.as_mut() {
                position_map.insert(block_key, new_position);
            }
        }

        self.evict(position, key, rng)?;
        Ok(result)
    }

    /// Removes and returns the block with key `block_key`.
    ///
    /// `position` is ignored when the ORAM keeps a position map. Returns `None` if the block is
    /// absent; the access pattern is the same either way.
    ///
    /// # Errors
    ///
    /// See [`PathOram::read`].
    pub fn read_and_remove<R: RngCore + CryptoRng>(
        &mut self,
        position: Position,
        block_key: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Block>, OramError> {
        let position = match self.current_position(position, block_key)? {
            Some(position) => position,
            None => {
                self.dummy_access(key, rng)?;
                return Ok(None);
            }
        };

        let mut result = self.read_path(position, block_key, key)?;
        if result.is_none() {
            result = self.stash.take(block_key, position);
        }
        if let Some(position_map) = self.position_map.as_mut() {
            position_map.remove(&block_key);
        }

        self.evict(position, key, rng)?;
        if result.is_some() {
            self.size -= 1;
        }
        Ok(result)
    }

    /// Inserts `block`.
    ///
    /// With a position map, `block` is given a fresh random position; otherwise its position must
    /// already be in `1..=capacity`. The path read and the path evicted are one fresh random path,
    /// independent of the block's position.
    ///
    /// # Errors
    ///
    /// Returns a `CapacityExceededError` if the ORAM is full, a `ReservedKeyError` for key 0, and
    /// a `ValueLengthMismatchError` for a value of the wrong length.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        mut block: Block,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if self.size >= self.layout.capacity() {
            return Err(OramError::CapacityExceededError {
                capacity: self.layout.capacity(),
            });
        }
        if block.key == 0 {
            return Err(OramError::ReservedKeyError);
        }
        if block.value.len() != self.value_len {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.value_len,
                actual: block.value.len(),
            });
        }

        match self.position_map.as_mut() {
            Some(position_map) => {
                block.position = self.layout.random_position(rng);
                position_map.insert(block.key, block.position);
            }
            None => self.layout.check_position(block.position)?,
        }

        let write_position = self.layout.random_position(rng);
        self.read_path(write_position, 0, key)?;
        self.stash.push(block);
        self.evict(write_position, key, rng)?;
        self.size += 1;
        Ok(())
    }

    /// Reads and evicts a uniformly random path, touching no real block.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn dummy_access<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let position = self.layout.random_position(rng);
        self.read_path(position, 0, key)?;
        self.evict(position, key, rng)
    }

    /// Returns a key that no live block uses.
    ///
    /// # Errors
    ///
    /// Returns a `KeyGenerationDisabledError` unless the ORAM was built with key generation.
    pub fn next_key(&mut self) -> Result<Key, OramError> {
        self.key_allocator
            .as_mut()
            .map(KeyAllocator::next)
            .ok_or(OramError::KeyGenerationDisabledError)
    }

    /// Returns `key` to the pool handed out by [`PathOram::next_key`].
    ///
    /// # Errors
    ///
    /// Returns a `KeyGenerationDisabledError` unless the ORAM was built with key generation.
    pub fn add_freed_key(&mut self, key: Key) -> Result<(), OramError> {
        self.key_allocator
            .as_mut()
            .map(|allocator| allocator.free(key))
            .ok_or(OramError::KeyGenerationDisabledError)
    }

    /// Resolves the position to read for `block_key`; `None` means the block is known to be absent.
    fn current_position(
        &self,
        position: Position,
        block_key: Key,
    ) -> Result<Option<Position>, OramError> {
        match &self.position_map {
            Some(position_map) => Ok(position_map.get(&block_key).copied()),
            None => {
                self.layout.check_position(position)?;
                Ok(Some(position))
            }
        }
    }

    /// Moves every block on the path of `position` into the stash, except the one with key
    /// `block_key` (if nonzero), which is returned.
    fn read_path(
        &mut self,
        position: Position,
        block_key: Key,
        key: &EncryptionKey,
    ) -> Result<Option<Block>, OramError> {
        let bucket_len = Self::encrypted_bucket_len(self.value_len);
        self.memory_access_count += 1;
        self.memory_bytes_moved += ((self.layout.depth() as usize + 1) * bucket_len) as u64;

        let mut result = None;
        for index in self.layout.path(position) {
            if !self.written.contains(&index) {
                break;
            }

            let ciphertext = self.physical_memory.read(index)?;
            crypto::decrypt_into(ciphertext, key, &mut self.plaintext)?;
            let bucket =
                Bucket::<DEFAULT_BLOCKS_PER_BUCKET>::decode(&self.plaintext, self.value_len)?;

            let (left, right) = children(index);
            mark(&mut self.written, left, bucket.left_child_written);
            mark(&mut self.written, right, bucket.right_child_written);

            for block in bucket.blocks {
                if block_key != 0 && block.key == block_key {
                    result = Some(block);
                } else {
                    self.stash.push(block);
                }
            }
        }
        Ok(result)
    }

    /// Greedily packs stash blocks into the path of `position`, deepest bucket first, and
    /// writes the whole path back.
    fn evict<R: RngCore + CryptoRng>(
        &mut self,
        position: Position,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let bucket_len = Self::encrypted_bucket_len(self.value_len);
        self.memory_access_count += 1;
        self.memory_bytes_moved += ((self.layout.depth() as usize + 1) * bucket_len) as u64;

        for level in (0..=self.layout.depth()).rev() {
            let index = self.layout.node_on_path(position, level);
            let blocks = self.stash.take_for_bucket(
                &self.layout,
                level,
                index,
                DEFAULT_BLOCKS_PER_BUCKET,
            );
            self.written.insert(index);

            let (left, right) = children(index);
            let bucket = Bucket::<DEFAULT_BLOCKS_PER_BUCKET> {
                blocks,
                left_child_written: self.written.contains(&left),
                right_child_written: self.written.contains(&right),
            };

            self.plaintext.clear();
            bucket.encode_into(self.value_len, &mut self.plaintext);
            crypto::encrypt_into(&self.plaintext, key, rng, &mut self.ciphertext)?;
            self.physical_memory.write(index, &self.ciphertext)?;
        }

        // Only the root is known without reading; the rest is rediscovered from the flags.
        self.written.clear();
        self.written.insert(0);
        Ok(())
    }
}

pub(crate) fn mark(written: &mut HashSet<TreeIndex>, index: TreeIndex, is_written: bool) {
    if is_written {
        written.insert(index);
    } else {
        written.remove(&index);
    }
}

impl<S: BlockStore> Measured for PathOram<S> {
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
