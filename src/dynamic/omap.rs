// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A resizable oblivious map.

use super::{occupancy_bounds, SteppingPair, SubStructure, SubStructures};
use crate::{
    crypto::EncryptionKey, path_avl_omap::PathAvlOmap, store::StorageConfig, Key, Measured,
    OramError,
};
use rand::{CryptoRng, RngCore};

impl SubStructure for PathAvlOmap {
    fn with_capacity(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError> {
        PathAvlOmap::new(capacity, value_len, storage)
    }
}

/// An oblivious map whose capacity can change one slot at a time.
///
/// Every operation performs the same number of accesses on both of its [`PathAvlOmap`]s.
#[derive(Debug)]
pub struct DynamicOmap {
    pub(crate) pair: SteppingPair<PathAvlOmap>,
}

impl DynamicOmap {
    /// Returns an empty map of capacity 0 with values of `value_len` bytes.
    pub fn new(value_len: usize, storage: StorageConfig) -> Self {
        Self {
            pair: SteppingPair::new(value_len, storage),
        }
    }

    /// Returns an empty map of capacity `2^k`.
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

    /// Maps `map_key` to `value`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a `ReservedKeyError` for key 0, a `ValueLengthMismatchError` for a value of the
    /// wrong length and a `CapacityExceededError` when adding a new key to a full map.
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
        if value.len() != self.pair.value_len() {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.pair.value_len(),
                actual: value.len(),
            });
        }

        let capacity = self.pair.capacity;
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Err(OramError::CapacityExceededError { capacity }),
            SubStructures::Single(map) => map.insert(map_key, value, key, rng),
            SubStructures::Pair { smaller, larger } => {
                // The key may be in either map; after this it is in neither.
                smaller.read_and_remove(map_key, key, rng)?;
                larger.read_and_remove(map_key, key, rng)?;

                let (smaller_bound, larger_bound) = occupancy_bounds(capacity, smaller.capacity());
                if smaller.size() < smaller_bound {
                    smaller.insert(map_key, value, key, rng)?;
                    larger.read(0, key, rng)?;
                    Ok(())
                } else if larger.size() < larger_bound {
                    smaller.read(0, key, rng)?;
                    larger.insert(map_key, value, key, rng)
                } else {
                    Err(OramError::CapacityExceededError { capacity })
                }
            }
        })
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
        let capacity = self.pair.capacity;
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Ok(None),
            SubStructures::Single(map) => map.read(map_key, key, rng),
            // At a power of two everything lives in the larger map.
            SubStructures::Pair { larger, .. } if capacity == larger.capacity() => {
                larger.read(map_key, key, rng)
            }
            SubStructures::Pair { smaller, larger } => {
                let from_smaller = smaller.read(map_key, key, rng)?;
                let from_larger = larger.read(map_key, key, rng)?;
                Ok(from_smaller.or(from_larger))
            }
        })
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
        self.pair.metered(|subs| match subs {
            SubStructures::Empty => Ok(None),
            SubStructures::Single(map) => map.read_and_remove(map_key, key, rng),
            SubStructures::Pair { smaller, larger } => {
                let from_smaller = smaller.read_and_remove(map_key, key, rng)?;
                let from_larger = larger.read_and_remove(map_key, key, rng)?;
                Ok(from_smaller.or(from_larger))
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
            SubStructures::Pair { smaller, larger } => move_one(smaller, larger, key, rng),
            _ => Ok(()),
        })?;
        self.pair.capacity += 1;
        Ok(())
    }

    /// Removes one slot of capacity.
    ///
    /// # Errors
    ///
    /// Returns a `NothingToShrinkError` at capacity 0 and a `ShrinkBelowSizeError` when the map
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
                        move_one(larger, smaller, key, rng)?;
                    } else {
                        larger.read(0, key, rng)?;
                        smaller.read(0, key, rng)?;
                    }
                }
            }
            Ok(())
        })?;
        self.pair.capacity -= 1;
        self.pair.demote_if_needed()
    }
}

/// Moves an arbitrary entry from `from` to `to`, or makes the same accesses if `from` is empty.
fn move_one<R: RngCore + CryptoRng>(
    from: &mut PathAvlOmap,
    to: &mut PathAvlOmap,
    key: &EncryptionKey,
    rng: &mut R,
) -> Result<(), OramError> {
    match from.take_one(key, rng)? {
        Some((map_key, value)) => to.insert(map_key, value, key, rng),
        None => to.read(0, key, rng).map(|_| ()),
    }
}
