// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! This module contains common test utilities for the structures of this crate.

use crate::{
    crypto::EncryptionKey,
    path_oram::{OramOptions, PathOram},
    Block, DynamicOheap, DynamicOmap, DynamicOram, Key, Measured, PathAvlOmap, PathOheap,
    StorageConfig,
};
use rand::{rngs::StdRng, CryptoRng, Rng, RngCore, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// A fresh key and an RNG, both determined by `seed`.
pub(crate) fn test_key_and_rng(seed: u64) -> (EncryptionKey, StdRng) {
    let mut rng = StdRng::seed_from_u64(seed);
    let key = EncryptionKey::generate(&mut rng);
    (key, rng)
}

/// A value of `len` bytes derived from `key`, so that values of different keys differ.
pub(crate) fn test_value(key: Key, len: usize) -> Vec<u8> {
    key.to_le_bytes().iter().copied().cycle().take(len).collect()
}

pub(crate) trait Testable {
    fn test_hook(&self) {}
}

/// The operations shared by every structure that maps keys `1..=capacity` to values.
pub(crate) trait KeyValueStructure: Measured + Testable + Sized {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self;

    fn put<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    );

    fn get<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>>;

    fn take<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>>;
}

impl Testable for PathOram {
    fn test_hook(&self) {
        assert!(self.stash_size() < 40, "stash size {}", self.stash_size());
    }
}

impl KeyValueStructure for PathOram {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        _key: &EncryptionKey,
        _rng: &mut R,
    ) -> Self {
        let options = OramOptions {
            position_map: true,
            key_generation: false,
        };
        PathOram::new(capacity, value_len, &StorageConfig::InMemory, options).unwrap()
    }

    fn put<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.read_and_remove(0, k, key, rng).unwrap();
        self.insert(Block::new(0, k, value), key, rng).unwrap();
    }

    fn get<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read(0, k, key, rng).unwrap().map(|block| block.value)
    }

    fn take<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read_and_remove(0, k, key, rng)
            .unwrap()
            .map(|block| block.value)
    }
}

impl Testable for PathAvlOmap {
    fn test_hook(&self) {
        assert!(self.oram.stash_size() < 40);
    }
}

impl KeyValueStructure for PathAvlOmap {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self {
        let mut map = PathAvlOmap::new(capacity, value_len, &StorageConfig::InMemory).unwrap();
        map.fill_with_dummies(key, rng).unwrap();
        map
    }

    fn put<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.insert(k, value, key, rng).unwrap();
    }

    fn get<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read(k, key, rng).unwrap()
    }

    fn take<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read_and_remove(k, key, rng).unwrap()
    }
}

impl Testable for DynamicOram {}

impl KeyValueStructure for DynamicOram {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self {
        let mut oram = DynamicOram::new(value_len, StorageConfig::InMemory);
        for _ in 0..capacity {
            oram.grow(key, rng).unwrap();
        }
        oram
    }

    fn put<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.insert(k, value, key, rng).unwrap();
    }

    fn get<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read(k, key, rng).unwrap()
    }

    fn take<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read_and_remove(k, key, rng).unwrap()
    }
}

impl Testable for DynamicOmap {}

impl KeyValueStructure for DynamicOmap {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self {
        let mut map = DynamicOmap::new(value_len, StorageConfig::InMemory);
        for _ in 0..capacity {
            map.grow(key, rng).unwrap();
        }
        map
    }

    fn put<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.insert(k, value, key, rng).unwrap();
    }

    fn get<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read(k, key, rng).unwrap()
    }

    fn take<R: RngCore + CryptoRng>(
        &mut self,
        k: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        self.read_and_remove(k, key, rng).unwrap()
    }
}

/// Tests the correctness of a `KeyValueStructure` T on a workload of random writes, reads and
/// removals of the keys `1..=capacity`.
pub(crate) fn test_correctness_random_workload<T: KeyValueStructure>(
    capacity: usize,
    value_len: usize,
    num_operations: u32,
) {
    init_logger();
    let (key, mut rng) = test_key_and_rng(0);

    let mut structure = T::create(capacity, value_len, &key, &mut rng);
    let mut mirror: HashMap<Key, Vec<u8>> = HashMap::new();
    let max_key = Key::try_from(capacity).unwrap();

    for _ in 0..num_operations {
        let random_key = rng.gen_range(1..=max_key);
        match rng.gen_range(0..3) {
            0 => {
                let value = test_value(rng.gen(), value_len);
                structure.put(random_key, value.clone(), &key, &mut rng);
                mirror.insert(random_key, value);
            }
            1 => assert_eq!(
                structure.take(random_key, &key, &mut rng),
                mirror.remove(&random_key)
            ),
            _ => assert_eq!(
                structure.get(random_key, &key, &mut rng).as_ref(),
                mirror.get(&random_key)
            ),
        }
        assert_eq!(structure.size(), mirror.len());
    }

    for k in 1..=max_key {
        assert_eq!(
            structure.get(k, &key, &mut rng).as_ref(),
            mirror.get(&k),
            "{k}"
        );
    }

    structure.test_hook();
}

macro_rules! create_correctness_test {
    ($structure_type: ident, $capacity: expr, $value_len: expr, $num_operations: expr) => {
        paste::paste! {
            #[test]
            fn [<random_workload_ $structure_type:snake _ $capacity _ $value_len _ $num_operations>]() {
                crate::test_utils::test_correctness_random_workload::<$structure_type>(
                    $capacity,
                    $value_len,
                    $num_operations,
                );
            }
        }
    };
}

pub(crate) use create_correctness_test;

/// The operations shared by the min-heaps of this crate.
pub(crate) trait PriorityQueue: Measured + Sized {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self;

    fn push<R: RngCore + CryptoRng>(
        &mut self,
        priority: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    );

    fn peek<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block>;

    fn pop<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block>;

    /// Adds (`grow`) or removes one slot of capacity. Static heaps keep their capacity.
    fn resize<R: RngCore + CryptoRng>(
        &mut self,
        _grow: bool,
        _key: &EncryptionKey,
        _rng: &mut R,
    ) {
    }
}

impl PriorityQueue for PathOheap {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self {
        let mut heap = PathOheap::new(capacity, value_len, &StorageConfig::InMemory).unwrap();
        heap.fill_with_dummies(key, rng).unwrap();
        heap
    }

    fn push<R: RngCore + CryptoRng>(
        &mut self,
        priority: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.insert(priority, value, key, rng).unwrap();
    }

    fn peek<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block> {
        self.find_min(key, rng, false).unwrap()
    }

    fn pop<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block> {
        self.extract_min(key, rng).unwrap()
    }
}

impl PriorityQueue for DynamicOheap {
    fn create<R: RngCore + CryptoRng>(
        capacity: usize,
        value_len: usize,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Self {
        let mut heap = DynamicOheap::new(value_len, StorageConfig::InMemory);
        for _ in 0..capacity {
            heap.grow(key, rng).unwrap();
        }
        heap
    }

    fn push<R: RngCore + CryptoRng>(
        &mut self,
        priority: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) {
        self.insert(priority, value, key, rng).unwrap();
    }

    fn peek<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block> {
        self.find_min(key, rng).unwrap()
    }

    fn pop<R: RngCore + CryptoRng>(&mut self, key: &EncryptionKey, rng: &mut R) -> Option<Block> {
        self.extract_min(key, rng).unwrap()
    }

    fn resize<R: RngCore + CryptoRng>(&mut self, grow: bool, key: &EncryptionKey, rng: &mut R) {
        if grow {
            self.grow(key, rng).unwrap();
        } else if self.size() < self.capacity() {
            self.shrink(key, rng).unwrap();
        }
    }
}

/// Tests a `PriorityQueue` T on a workload of random insertions, extractions, peeks and (for
/// resizable heaps) capacity changes, against a `BinaryHeap` holding the same priorities.
///
/// Every value is derived from its priority, so an entry is checked in full even when several
/// entries share a priority.
pub(crate) fn test_heap_random_workload<T: PriorityQueue>(
    capacity: usize,
    value_len: usize,
    num_operations: u32,
) {
    init_logger();
    let (key, mut rng) = test_key_and_rng(0);

    let mut heap = T::create(capacity, value_len, &key, &mut rng);
    let mut mirror: BinaryHeap<Reverse<Key>> = BinaryHeap::new();

    for _ in 0..num_operations {
        match rng.gen_range(0..8) {
            0..=2 if heap.size() < heap.capacity() => {
                let priority = rng.gen_range(1..=4 * capacity as Key);
                heap.push(priority, test_value(priority, value_len), &key, &mut rng);
                mirror.push(Reverse(priority));
            }
            3 | 4 => {
                let min = heap.pop(&key, &mut rng);
                assert_eq!(
                    min.as_ref().map(|block| block.key),
                    mirror.pop().map(|Reverse(priority)| priority)
                );
                if let Some(block) = min {
                    assert_eq!(block.value, test_value(block.key, value_len));
                }
            }
            5 => heap.resize(true, &key, &mut rng),
            6 => heap.resize(false, &key, &mut rng),
            _ => assert_eq!(
                heap.peek(&key, &mut rng).map(|block| block.key),
                mirror.peek().map(|Reverse(priority)| *priority)
            ),
        }
        assert_eq!(heap.size(), mirror.len());
    }

    while let Some(Reverse(expected)) = mirror.pop() {
        assert_eq!(heap.pop(&key, &mut rng).map(|block| block.key), Some(expected));
    }
    assert_eq!(heap.pop(&key, &mut rng), None);
}

macro_rules! create_heap_correctness_test {
    ($heap_type: ident, $capacity: expr, $value_len: expr, $num_operations: expr) => {
        paste::paste! {
            #[test]
            fn [<heap_workload_ $heap_type:snake _ $capacity _ $value_len _ $num_operations>]() {
                crate::test_utils::test_heap_random_workload::<$heap_type>(
                    $capacity,
                    $value_len,
                    $num_operations,
                );
            }
        }
    };
}

pub(crate) use create_heap_correctness_test;
