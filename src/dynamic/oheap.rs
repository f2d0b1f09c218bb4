// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A resizable oblivious min-heap.

use super::{occupancy_bounds, SteppingPair, SubStructure, SubStructures};
use crate::{
    crypto::EncryptionKey, path_oheap::PathOheap, store::StorageConfig, Block, Key, Measured,
    OramError,
};
use rand::{CryptoRng, RngCore};

impl SubStructure for PathOheap {
    fn with_capacity(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError> {
        PathOheap::new(capacity, value_len, storage)
    }
}

/// An oblivious min-heap whose capacity can change one slot at a time.
#[derive(Debug)]
pub struct DynamicOheap {
    pub(crate) pair: SteppingPair<PathOheap>,
}

impl DynamicOheap {
    /// Returns an empty heap of capacity 0 with values of `value_len` bytes.
    pub fn new(value_len: usize, storage: StorageConfig) -> Self {
        Self {
            pair: SteppingPair::new(value_len, storage),
        }
    }

    /// Returns an empty heap of capacity `2^k`.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `2^k` does not fit in a `usize`.
    pub fn with_capacity_power_of_two(
        k: u32,
        value_len: usize,
        storage: StorageConfig,
    ) -> Result<Self, OramError> {
        Ok(Self {
            pair: SteppingPair::with_capacity_power_of_two(k, value_len, storage)?,
        })
    }

    /// Inserts an entry with priority `block_key`. Priorities may repeat.
    ///
    /// # Errors
    ///
    /// Returns a `ReservedKeyError` for priority 0, a `ValueLengthMismatchError` for a value of
    /// the wrong length and a `CapacityExceededError` when the heap is full.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        block_key: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if block_key == 0 {
            return Err(OramError::ReservedKeyError);
        }
        if value.len() != self.pair.value_len() {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.pair.value_len(),
                actual: value.len(),
            });
        }

        let capacity = self.pair.capacity;
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Err(OramError::CapacityExceededError { capacity }),
            SubStructures::Single(heap) => heap.insert(block_key, value, key, rng),
            SubStructures::Pair { smaller, larger } => {
                let (smaller_bound, larger_bound) = occupancy_bounds(capacity, smaller.capacity());
                if smaller.size() < smaller_bound {
                    smaller.insert(block_key, value, key, rng)?;
                    larger.dummy_access(key, rng, true)
                } else if larger.size() < larger_bound {
                    smaller.dummy_access(key, rng, true)?;
                    larger.insert(block_key, value, key, rng)
                } else {
                    Err(OramError::CapacityExceededError { capacity })
                }
            }
        })
    }

    /// Returns the entry with the smallest priority without removing it.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn find_min<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Block>, OramError> {
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Ok(None),
            SubStructures::Single(heap) => heap.find_min(key, rng, false),
            SubStructures::Pair { smaller, larger } => {
                let smaller_min = smaller.find_min(key, rng, false)?;
                let larger_min = larger.find_min(key, rng, false)?;
                Ok(match (smaller_min, larger_min) {
                    (Some(a), Some(b)) => Some(if b.key < a.key { b } else { a }),
                    (a, None) => a,
                    (None, b) => b,
                })
            }
        })
    }

    /// Removes and returns the entry with the smallest priority.
    ///
    /// # Errors
    ///
    /// Propagates store and crypto failures.
    pub fn extract_min<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Block>, OramError> {
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Ok(None),
            SubStructures::Single(heap) => heap.extract_min(key, rng),
            SubStructures::Pair { smaller, larger } => {
                let smaller_min = smaller.find_min(key, rng, false)?;
                let larger_min = larger.find_min(key, rng, false)?;
                let from_smaller = match (&smaller_min, &larger_min) {
                    (Some(a), Some(b)) => a.key <= b.key,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if from_smaller {
                    let min = smaller.extract_min(key, rng)?;
                    larger.dummy_access(key, rng, true)?;
                    Ok(min)
                } else {
                    smaller.dummy_access(key, rng, true)?;
                    larger.extract_min(key, rng)
                }
            }
        })
    }

    /// Adds one slot of capacity.
    ///
    /// # Errors
    ///
    /// Propagates allocation, store and crypto failures.
    pub fn grow<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.pair.promote_if_full()?;
        self.pair.metered(|subs| match subs {
            SubStructures::Pair { smaller, larger } => move_min(smaller, larger, key, rng),
            _ => Ok(()),
        })?;
        self.pair.capacity += 1;
        Ok(())
    }

    /// Removes one slot of capacity.
    ///
    /// # Errors
    ///
    /// Returns a `NothingToShrinkError` at capacity 0 and a `ShrinkBelowSizeError` when the heap
    /// is full.
    pub fn shrink<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let capacity = self.pair.capacity;
        if capacity == 0 {
            return Err(OramError::NothingToShrinkError);
        }
        if self.size() >= capacity {
            return Err(OramError::ShrinkBelowSizeError { size: self.size() });
        }

        self.pair.metered(|subs| {
            if let SubStructures::Pair { smaller, larger } = subs {
                let (_, larger_bound) = occupancy_bounds(capacity - 1, smaller.capacity());
                for _ in 0..2 {
                    if larger.size() > larger_bound {
                        move_min(larger, smaller, key, rng)?;
                    } else {
                        larger.dummy_access(key, rng, true)?;
                        smaller.dummy_access(key, rng, true)?;
                    }
                }
            }
            Ok(())
        })?;
        self.pair.capacity -= 1;
        self.pair.demote_if_needed()
    }
}

/// Moves the minimum of `from` to `to`, or makes the same accesses if `from` is empty.
fn move_min<R: RngCore + CryptoRng>(
    from: &mut PathOheap,
    to: &mut PathOheap,
    key: &EncryptionKey,
    rng: &mut R,
) -> Result<(), OramError> {
    match from.extract_min(key, rng)? {
        Some(min) => to.insert(min.key, min.value, key, rng),
        None => to.dummy_access(key, rng, true),
    }
}
