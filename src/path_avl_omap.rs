// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious map: an AVL tree whose nodes are blocks of a Path ORAM.

use crate::{
    crypto::EncryptionKey,
    path_oram::{OramOptions, PathOram},
    store::{BlockStore, StorageConfig},
    Block, Key, Measured, OramError, Position,
};
use rand::{CryptoRng, RngCore};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The AVL height bound is `1.44 * log2(n)`.
const AVL_HEIGHT_FACTOR: f64 = 1.44;
/// An operation fetches at most about three nodes per level.
const FETCHES_PER_LEVEL: f64 = 3.0;

const POINTER_BYTES: usize = 8;
/// key, left pointer, right pointer, height
const NODE_HEADER_BYTES: usize = 4 + 2 * POINTER_BYTES + 1;

/// A reference to a node: its ORAM key and the position it was last written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct NodePointer {
    key: Key,
    position: Position,
}

impl NodePointer {
    const NULL: Self = Self {
        key: 0,
        position: 0,
    };

    fn is_null(&self) -> bool {
        self.key == 0
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            key: read_u32(&bytes[..4]),
            position: read_u32(&bytes[4..8]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Node {
    key: Key,
    left: NodePointer,
    right: NodePointer,
    height: u8,
    value: Vec<u8>,
}

impl Node {
    fn leaf(key: Key, value: Vec<u8>) -> Self {
        Self {
            key,
            left: NodePointer::NULL,
            right: NodePointer::NULL,
            height: 1,
            value,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NODE_HEADER_BYTES + self.value.len());
        out.extend_from_slice(&self.key.to_le_bytes());
        self.left.encode(&mut out);
        self.right.encode(&mut out);
        out.push(self.height);
        out.extend_from_slice(&self.value);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, OramError> {
        if bytes.len() < NODE_HEADER_BYTES {
            return Err(OramError::MalformedPlaintextError { len: bytes.len() });
        }
        Ok(Self {
            key: read_u32(&bytes[..4]),
            left: NodePointer::decode(&bytes[4..12]),
            right: NodePointer::decode(&bytes[12..20]),
            height: bytes[20],
            value: bytes[NODE_HEADER_BYTES..].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buffer = [0u8; 4];
    buffer.copy_from_slice(bytes);
    u32::from_le_bytes(buffer)
}

/// An oblivious map from nonzero keys to values of `value_len` bytes, holding at most
/// `capacity` entries.
///
/// Each AVL node is one block of an underlying [`PathOram`] addressed by a synthetic key.
/// An operation pulls the nodes it needs out of the ORAM into a cache, works on the cache, and
/// then finalizes: it pads the number of ORAM reads to a fixed budget, gives every cached node
/// a fresh random position, writes the nodes back, and pads the number of writes to the same
/// budget. The ORAM traffic of every operation is therefore the same.
#[derive(Debug)]
pub struct PathAvlOmap<S: BlockStore = Box<dyn BlockStore>> {
    pub(crate) oram: PathOram<S>,
    capacity: usize,
    value_len: usize,
    size: usize,
    /// The number of ORAM reads and writes each operation is padded to.
    pad_val: usize,
    root: NodePointer,
    fetches_before_finalize: usize,
    cache: BTreeMap<Key, Node>,
}

impl PathAvlOmap {
    /// Returns an empty map of at most `capacity` entries with values of `value_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `capacity` is not a power of two.
    pub fn new(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError> {
        let oram = PathOram::new(
            capacity,
            Self::node_len(value_len),
            storage,
            Self::ORAM_OPTIONS,
        )?;
        Ok(Self::with_oram(oram, capacity, value_len))
    }
}

impl<S: BlockStore> PathAvlOmap<S> {
    const ORAM_OPTIONS: OramOptions = OramOptions {
        position_map: false,
        key_generation: true,
    };

    /// Returns an empty map over a caller-provided store, which must be shaped for a
    /// [`PathOram`] of `capacity` blocks of [`PathAvlOmap::node_len`] bytes.
    ///
    /// # Errors
    ///
    /// See [`PathOram::with_store`].
    pub fn with_store(capacity: usize, value_len: usize, store: S) -> Result<Self, OramError> {
        let oram = PathOram::with_store(
            capacity,
            Self::node_len(value_len),
            store,
            Self::ORAM_OPTIONS,
        )?;
        Ok(Self::with_oram(oram, capacity, value_len))
    }

    fn with_oram(oram: PathOram<S>, capacity: usize, value_len: usize) -> Self {
        let log_capacity = (capacity as f64).log2();
        // At least one padded access, also at capacity 1.
        let pad_val =
            ((AVL_HEIGHT_FACTOR * FETCHES_PER_LEVEL * log_capacity).ceil() as usize).max(1);
        log::debug!(
            "PathAvlOmap::new(capacity = {}, value_len = {}, pad_val = {})",
            capacity,
            value_len,
            pad_val
        );

        Self {
            oram,
            capacity,
            value_len,
            size: 0,
            pad_val,
            root: NodePointer::NULL,
            fetches_before_finalize: 0,
            cache: BTreeMap::new(),
        }
    }

    /// The length of the ORAM blocks holding the nodes of a map with values of `value_len` bytes.
    pub fn node_len(value_len: usize) -> usize {
        NODE_HEADER_BYTES + value_len
    }

    /// Writes encrypted empty buckets to every slot of the underlying ORAM.
    ///
    /// # Errors
    ///
    /// Propagates store and encryption failures.
    pub fn fill_with_dummies<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.oram.fill_with_dummies(key, rng)
    }

    /// Maps `map_key` to `value`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a `ReservedKeyError` for key 0, a `ValueLengthMismatchError` for a value of the
    /// wrong length, and a `CapacityExceededError` when adding a new key to a full map.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        map_key: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if map_key == 0 {
            return Err(OramError::ReservedKeyError);
        }
        if value.len() != self.value_len {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.value_len,
                actual: value.len(),
            });
        }

        let root = self.root;
        let inserted = self.insert_at(root, map_key, value, key, rng);
        // The root must be settled before finalize assigns it a position. A failed insert leaves
        // the tree untouched, but its nodes still have to be written back.
        if let Ok(new_root) = &inserted {
            self.root = *new_root;
        }
        self.finalize(key, rng)?;
        inserted.map(|_| ())
    }

    /// Returns the value of `map_key`, if present.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn read<R: RngCore + CryptoRng>(
        &mut self,
        map_key: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        let root = self.root;
        let found = self.find(root, map_key, key, rng)?;
        let value = if found.is_null() {
            None
        } else {
            Some(self.cached(found)?.value.clone())
        };
        self.finalize(key, rng)?;
        Ok(value)
    }

    /// Removes `map_key` and returns its value, if present.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn read_and_remove<R: RngCore + CryptoRng>(
        &mut self,
        map_key: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        let mut removed = None;
        let root = self.root;
        self.root = self.delete_at(root, map_key, &mut removed, key, rng)?;
        if removed.is_some() {
            self.size -= 1;
        }
        self.finalize(key, rng)?;
        Ok(removed)
    }

    /// Removes and returns an arbitrary entry (the root of the tree).
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn take_one<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<(Key, Vec<u8>)>, OramError> {
        let root = self.root;
        let map_key = if root.is_null() {
            0
        } else {
            self.fetch(root, key, rng)?;
            self.cached(root)?.key
        };
        let value = self.read_and_remove(map_key, key, rng)?;
        Ok(value.map(|value| (map_key, value)))
    }

    fn cached(&self, pointer: NodePointer) -> Result<&Node, OramError> {
        self.cache
            .get(&pointer.key)
            .ok_or(OramError::MissingNodeError { key: pointer.key })
    }

    fn cached_mut(&mut self, pointer: NodePointer) -> Result<&mut Node, OramError> {
        self.cache
            .get_mut(&pointer.key)
            .ok_or(OramError::MissingNodeError { key: pointer.key })
    }

    /// Pulls the node behind `pointer` out of the ORAM into the cache, unless it is null or
    /// already cached.
    fn fetch<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if pointer.is_null() || self.cache.contains_key(&pointer.key) {
            return Ok(());
        }

        self.fetches_before_finalize += 1;
        let block = self
            .oram
            .read_and_remove(pointer.position, pointer.key, key, rng)?
            .ok_or(OramError::MissingNodeError { key: pointer.key })?;
        self.cache.insert(pointer.key, Node::decode(&block.value)?);
        Ok(())
    }

    fn height<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u8, OramError> {
        if pointer.is_null() {
            return Ok(0);
        }
        self.fetch(pointer, key, rng)?;
        Ok(self.cached(pointer)?.height)
    }

    /// Recomputes the height of a cached node from its children.
    fn update_height<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<u8, OramError> {
        let (left, right) = {
            let node = self.cached(pointer)?;
            (node.left, node.right)
        };
        let height = 1 + self
            .height(left, key, rng)?
            .max(self.height(right, key, rng)?);
        self.cached_mut(pointer)?.height = height;
        Ok(height)
    }

    /// The height of the right subtree minus the height of the left subtree.
    fn balance_factor<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<i32, OramError> {
        if pointer.is_null() {
            return Ok(0);
        }
        self.fetch(pointer, key, rng)?;
        let (left, right) = {
            let node = self.cached(pointer)?;
            (node.left, node.right)
        };
        Ok(i32::from(self.height(right, key, rng)?) - i32::from(self.height(left, key, rng)?))
    }

    fn find<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        map_key: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        let mut current = pointer;
        while !current.is_null() {
            self.fetch(current, key, rng)?;
            let node = self.cached(current)?;
            current = match map_key.cmp(&node.key) {
                Ordering::Equal => return Ok(current),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        Ok(NodePointer::NULL)
    }

    fn insert_at<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        map_key: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        if pointer.is_null() {
            if self.size >= self.capacity {
                return Err(OramError::CapacityExceededError {
                    capacity: self.capacity,
                });
            }
            let oram_key = self.oram.next_key()?;
            self.cache.insert(oram_key, Node::leaf(map_key, value));
            self.size += 1;
            // The position is assigned when the node is written back.
            return Ok(NodePointer {
                key: oram_key,
                position: 0,
            });
        }

        self.fetch(pointer, key, rng)?;
        let node = self.cached(pointer)?;
        match map_key.cmp(&node.key) {
            Ordering::Equal => {
                self.cached_mut(pointer)?.value = value;
                return Ok(pointer);
            }
            Ordering::Less => {
                let left = node.left;
                let left = self.insert_at(left, map_key, value, key, rng)?;
                self.cached_mut(pointer)?.left = left;
            }
            Ordering::Greater => {
                let right = node.right;
                let right = self.insert_at(right, map_key, value, key, rng)?;
                self.cached_mut(pointer)?.right = right;
            }
        }

        self.update_height(pointer, key, rng)?;
        self.balance(pointer, key, rng)
    }

    /// Deletes `map_key` from the subtree at `pointer`, returning the new subtree root. The
    /// value of the first node matched is moved into `removed`.
    fn delete_at<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        map_key: Key,
        removed: &mut Option<Vec<u8>>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        if pointer.is_null() {
            return Ok(pointer);
        }

        self.fetch(pointer, key, rng)?;
        let node = self.cached(pointer)?;
        let (left, right) = (node.left, node.right);
        match map_key.cmp(&node.key) {
            Ordering::Less => {
                let left = self.delete_at(left, map_key, removed, key, rng)?;
                self.cached_mut(pointer)?.left = left;
            }
            Ordering::Greater => {
                let right = self.delete_at(right, map_key, removed, key, rng)?;
                self.cached_mut(pointer)?.right = right;
            }
            Ordering::Equal => {
                if removed.is_none() {
                    *removed = Some(std::mem::take(&mut self.cached_mut(pointer)?.value));
                }

                if left.is_null() || right.is_null() {
                    self.cache.remove(&pointer.key);
                    self.oram.add_freed_key(pointer.key)?;
                    return Ok(if left.is_null() { right } else { left });
                }

                // Two children: take over the in-order successor and delete it from the right.
                let mut successor = right;
                loop {
                    self.fetch(successor, key, rng)?;
                    let next = self.cached(successor)?.left;
                    if next.is_null() {
                        break;
                    }
                    successor = next;
                }
                let (successor_key, successor_value) = {
                    let node = self.cached_mut(successor)?;
                    (node.key, std::mem::take(&mut node.value))
                };
                let node = self.cached_mut(pointer)?;
                node.key = successor_key;
                node.value = successor_value;

                let right = self.delete_at(right, successor_key, removed, key, rng)?;
                self.cached_mut(pointer)?.right = right;
            }
        }

        self.update_height(pointer, key, rng)?;
        self.balance(pointer, key, rng)
    }

    /// Restores the AVL invariant at `pointer` with at most two rotations.
    fn balance<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        let balance = self.balance_factor(pointer, key, rng)?;
        let (left, right) = {
            let node = self.cached(pointer)?;
            (node.left, node.right)
        };

        if balance < -1 {
            if self.balance_factor(left, key, rng)? > 0 {
                let left = self.rotate_left(left, key, rng)?;
                self.cached_mut(pointer)?.left = left;
            }
            return self.rotate_right(pointer, key, rng);
        }
        if balance > 1 {
            if self.balance_factor(right, key, rng)? < 0 {
                let right = self.rotate_right(right, key, rng)?;
                self.cached_mut(pointer)?.right = right;
            }
            return self.rotate_left(pointer, key, rng);
        }
        Ok(pointer)
    }

    fn rotate_left<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        self.fetch(pointer, key, rng)?;
        let right = self.cached(pointer)?.right;
        self.fetch(right, key, rng)?;
        let inner = self.cached(right)?.left;

        self.cached_mut(pointer)?.right = inner;
        self.update_height(pointer, key, rng)?;
        self.cached_mut(right)?.left = pointer;
        self.update_height(right, key, rng)?;
        Ok(right)
    }

    fn rotate_right<R: RngCore + CryptoRng>(
        &mut self,
        pointer: NodePointer,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<NodePointer, OramError> {
        self.fetch(pointer, key, rng)?;
        let left = self.cached(pointer)?.left;
        self.fetch(left, key, rng)?;
        let inner = self.cached(left)?.right;

        self.cached_mut(pointer)?.left = inner;
        self.update_height(pointer, key, rng)?;
        self.cached_mut(left)?.right = pointer;
        self.update_height(left, key, rng)?;
        Ok(left)
    }

    /// Pads the reads of this operation, writes every cached node back under a fresh position,
    /// and pads the writes.
    fn finalize<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        for _ in self.fetches_before_finalize..self.pad_val {
            self.oram.dummy_access(key, rng)?;
        }
        self.fetches_before_finalize = 0;

        let positions: BTreeMap<Key, Position> = self
            .cache
            .keys()
            .map(|oram_key| (*oram_key, self.oram.random_position(rng)))
            .collect();
        let relink = |pointer: &mut NodePointer| {
            if let Some(position) = positions.get(&pointer.key) {
                pointer.position = *position;
            }
        };

        relink(&mut self.root);
        let cache = std::mem::take(&mut self.cache);
        let writes = cache.len();
        for (oram_key, mut node) in cache {
            relink(&mut node.left);
            relink(&mut node.right);
            let block = Block::new(positions[&oram_key], oram_key, node.encode());
            self.oram.insert(block, key, rng)?;
        }

        for _ in writes..self.pad_val {
            self.oram.dummy_access(key, rng)?;
        }
        Ok(())
    }

    /// Checks the AVL invariants of the whole tree, returning the keys in order.
    #[cfg(test)]
    pub(crate) fn check_invariants<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Vec<Key> {
        fn walk<S: BlockStore, R: RngCore + CryptoRng>(
            map: &mut PathAvlOmap<S>,
            pointer: NodePointer,
            key: &EncryptionKey,
            rng: &mut R,
            keys: &mut Vec<Key>,
        ) -> u8 {
            if pointer.is_null() {
                return 0;
            }
            map.fetch(pointer, key, rng).unwrap();
            let node = map.cached(pointer).unwrap().clone();
            let left_height = walk(map, node.left, key, rng, keys);
            keys.push(node.key);
            let right_height = walk(map, node.right, key, rng, keys);
            assert!(
                (i32::from(left_height) - i32::from(right_height)).abs() <= 1,
                "unbalanced at {}",
                node.key
            );
            assert_eq!(node.height, 1 + left_height.max(right_height));
            node.height
        }

        let mut keys = Vec::new();
        let root = self.root;
        walk(self, root, key, rng, &mut keys);
        self.finalize(key, rng).unwrap();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(keys.len(), self.size);
        keys
    }
}

impl<S: BlockStore> Measured for PathAvlOmap<S> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn size(&self) -> usize {
        self.size
    }

    fn memory_access_count(&self) -> u64 {
        self.oram.memory_access_count()
    }

    fn memory_bytes_moved(&self) -> u64 {
        self.oram.memory_bytes_moved()
    }

    fn is_on_disk(&self) -> bool {
        self.oram.is_on_disk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use rand::{seq::SliceRandom, Rng};
    use std::collections::HashMap;

    fn omap(capacity: usize, value_len: usize) -> PathAvlOmap {
        PathAvlOmap::new(capacity, value_len, &StorageConfig::InMemory).unwrap()
    }

    #[test]
    fn node_encoding_round_trips() {
        let node = Node {
            key: 42,
            left: NodePointer {
                key: 1,
                position: 7,
            },
            right: NodePointer::NULL,
            height: 3,
            value: vec![9, 8, 7],
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), NODE_HEADER_BYTES + 3);
        assert_eq!(Node::decode(&bytes).unwrap(), node);
        assert!(Node::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn insert_read_remove() {
        init_logger();
        let (key, mut rng) = test_key_and_rng(0);
        let mut map = omap(8, 4);
        map.fill_with_dummies(&key, &mut rng).unwrap();

        map.insert(5, b"five".to_vec(), &key, &mut rng).unwrap();
        map.insert(2, b"two!".to_vec(), &key, &mut rng).unwrap();
        assert_eq!(map.read(5, &key, &mut rng).unwrap(), Some(b"five".to_vec()));
        assert_eq!(map.read(3, &key, &mut rng).unwrap(), None);

        map.insert(5, b"FIVE".to_vec(), &key, &mut rng).unwrap();
        assert_eq!(map.size(), 2);
        assert_eq!(
            map.read_and_remove(5, &key, &mut rng).unwrap(),
            Some(b"FIVE".to_vec())
        );
        assert_eq!(map.read(5, &key, &mut rng).unwrap(), None);
        assert_eq!(map.read_and_remove(5, &key, &mut rng).unwrap(), None);
        assert_eq!(map.size(), 1);
        assert_eq!(map.read(0, &key, &mut rng).unwrap(), None);
    }

    #[test]
    fn second_insert_finds_the_new_root() {
        let (key, mut rng) = test_key_and_rng(7);
        let mut map = omap(8, 2);
        map.insert(4, vec![4, 4], &key, &mut rng).unwrap();
        assert_ne!(map.root.position, 0);
        map.insert(6, vec![6, 6], &key, &mut rng).unwrap();
        assert_eq!(map.read(4, &key, &mut rng).unwrap(), Some(vec![4, 4]));
        assert_eq!(map.read(6, &key, &mut rng).unwrap(), Some(vec![6, 6]));
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn updates_then_deletes_down_to_empty() {
        let (key, mut rng) = test_key_and_rng(8);
        let mut map = omap(16, 1);
        let mut expected = Vec::new();
        for map_key in [8u32, 3, 12, 1, 5, 10, 14, 4] {
            map.insert(map_key, vec![map_key as u8], &key, &mut rng)
                .unwrap();
            expected.push(map_key);
            expected.sort_unstable();
            assert_eq!(map.check_invariants(&key, &mut rng), expected);
        }

        // Overwriting keeps the shape and the size.
        for map_key in [8u32, 4, 14] {
            map.insert(map_key, vec![100 + map_key as u8], &key, &mut rng)
                .unwrap();
            assert_eq!(map.check_invariants(&key, &mut rng), expected);
            assert_eq!(
                map.read(map_key, &key, &mut rng).unwrap(),
                Some(vec![100 + map_key as u8])
            );
        }

        // Inner nodes with two children first, then the rest.
        for map_key in [8u32, 3, 12, 1, 5, 10, 14, 4] {
            let value = if [8, 4, 14].contains(&map_key) {
                100 + map_key as u8
            } else {
                map_key as u8
            };
            assert_eq!(
                map.read_and_remove(map_key, &key, &mut rng).unwrap(),
                Some(vec![value])
            );
            expected.retain(|k| *k != map_key);
            assert_eq!(map.check_invariants(&key, &mut rng), expected);
        }
        assert_eq!(map.size(), 0);
        assert!(map.root.is_null());
        assert_eq!(map.read(8, &key, &mut rng).unwrap(), None);

        // The freed slots are reusable.
        map.insert(2, vec![2], &key, &mut rng).unwrap();
        assert_eq!(map.check_invariants(&key, &mut rng), vec![2]);
    }

    #[test]
    fn capacity_one_is_padded() {
        let map = omap(1, 1);
        assert_eq!(map.pad_val, 1);
    }

    #[test]
    fn rejects_invalid_inserts() {
        let (key, mut rng) = test_key_and_rng(1);
        let mut map = omap(2, 1);
        assert!(matches!(
            map.insert(0, vec![0], &key, &mut rng),
            Err(OramError::ReservedKeyError)
        ));
        assert!(matches!(
            map.insert(1, vec![0, 0], &key, &mut rng),
            Err(OramError::ValueLengthMismatchError { .. })
        ));
        map.insert(1, vec![1], &key, &mut rng).unwrap();
        map.insert(2, vec![2], &key, &mut rng).unwrap();
        // Replacing an existing key is allowed when full.
        map.insert(2, vec![3], &key, &mut rng).unwrap();
        assert!(matches!(
            map.insert(3, vec![3], &key, &mut rng),
            Err(OramError::CapacityExceededError { capacity: 2 })
        ));
    }

    #[test]
    fn stays_balanced_under_sequential_inserts_and_deletes() {
        let (key, mut rng) = test_key_and_rng(2);
        let mut map = omap(64, 2);
        for map_key in 1..=64u32 {
            map.insert(map_key, test_value(map_key, 2), &key, &mut rng)
                .unwrap();
        }
        assert_eq!(
            map.check_invariants(&key, &mut rng),
            (1..=64).collect::<Vec<_>>()
        );

        for map_key in (1..=64u32).filter(|k| k % 3 == 0) {
            assert_eq!(
                map.read_and_remove(map_key, &key, &mut rng).unwrap(),
                Some(test_value(map_key, 2))
            );
        }
        assert_eq!(
            map.check_invariants(&key, &mut rng),
            (1..=64).filter(|k| k % 3 != 0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn random_workload_matches_mirror() {
        let (key, mut rng) = test_key_and_rng(3);
        let mut map = omap(32, 3);
        let mut mirror = HashMap::new();
        for step in 0..600 {
            let map_key = rng.gen_range(1..=48u32);
            match rng.gen_range(0..3) {
                0 if mirror.len() < 32 || mirror.contains_key(&map_key) => {
                    let value = test_value(map_key + step, 3);
                    map.insert(map_key, value.clone(), &key, &mut rng).unwrap();
                    mirror.insert(map_key, value);
                }
                1 => assert_eq!(
                    map.read_and_remove(map_key, &key, &mut rng).unwrap(),
                    mirror.remove(&map_key)
                ),
                _ => assert_eq!(
                    map.read(map_key, &key, &mut rng).unwrap().as_ref(),
                    mirror.get(&map_key)
                ),
            }
            assert_eq!(map.size(), mirror.len());
        }
        let mut keys: Vec<Key> = mirror.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(map.check_invariants(&key, &mut rng), keys);
    }

    #[test]
    fn take_one_drains_the_map() {
        let (key, mut rng) = test_key_and_rng(4);
        let mut map = omap(16, 1);
        let mut inserted: Vec<Key> = (1..=16).collect();
        inserted.shuffle(&mut rng);
        for map_key in &inserted {
            map.insert(*map_key, vec![*map_key as u8], &key, &mut rng)
                .unwrap();
        }

        let mut taken = Vec::new();
        while let Some((map_key, value)) = map.take_one(&key, &mut rng).unwrap() {
            assert_eq!(value, vec![map_key as u8]);
            taken.push(map_key);
            map.check_invariants(&key, &mut rng);
        }
        taken.sort_unstable();
        assert_eq!(taken, (1..=16).collect::<Vec<_>>());
        assert_eq!(map.size(), 0);
        assert_eq!(map.take_one(&key, &mut rng).unwrap(), None);
    }

    #[test]
    fn every_operation_costs_the_same() {
        let (key, mut rng) = test_key_and_rng(5);
        let mut map = omap(64, 2);
        // Two ORAM accesses per padded read and per padded write.
        let expected = 4 * map.pad_val as u64;

        for map_key in [32u32, 1, 64, 17, 5, 50] {
            let before = map.memory_access_count();
            map.insert(map_key, vec![1, 2], &key, &mut rng).unwrap();
            assert_eq!(map.memory_access_count() - before, expected);
        }
        for map_key in [17u32, 99, 1] {
            let before = map.memory_access_count();
            map.read(map_key, &key, &mut rng).unwrap();
            assert_eq!(map.memory_access_count() - before, expected);

            let before = map.memory_access_count();
            map.read_and_remove(map_key, &key, &mut rng).unwrap();
            assert_eq!(map.memory_access_count() - before, expected);
        }
    }

    #[test]
    fn capacity_one_map() {
        let (key, mut rng) = test_key_and_rng(6);
        let mut map = omap(1, 2);
        map.insert(7, vec![7, 7], &key, &mut rng).unwrap();
        assert_eq!(map.read(7, &key, &mut rng).unwrap(), Some(vec![7, 7]));
        assert!(map.insert(8, vec![8, 8], &key, &mut rng).is_err());
        assert_eq!(map.take_one(&key, &mut rng).unwrap(), Some((7, vec![7, 7])));
        assert_eq!(map.size(), 0);
    }

    create_correctness_test!(PathAvlOmap, 1, 2, 20);
    create_correctness_test!(PathAvlOmap, 16, 4, 300);
    create_correctness_test!(PathAvlOmap, 64, 8, 500);
}
