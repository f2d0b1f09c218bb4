// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A resizable ORAM over the addresses `1..=capacity`.

use super::{SteppingPair, SubStructure, SubStructures};
use crate::{
    crypto::EncryptionKey,
    path_oram::{OramOptions, PathOram},
    store::StorageConfig,
    Block, Key, Measured, OramError, Position,
};
use rand::{CryptoRng, RngCore};

impl SubStructure for PathOram {
    fn with_capacity(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError> {
        let options = OramOptions {
            position_map: true,
            key_generation: false,
        };
        PathOram::new(capacity, value_len, storage, options)
    }
}

/// An ORAM of `capacity` addresses, `1..=capacity`, whose capacity can change one address at a
/// time.
///
/// With `s` the capacity of the smaller sub-ORAM, the addresses `capacity - s + 1..=s` live in
/// the smaller sub-ORAM and all others in the larger one. Growing moves the address
/// `capacity - s + 1` into the larger sub-ORAM; shrinking drops the address `capacity` and moves
/// the address `capacity - s` back.
#[derive(Debug)]
pub struct DynamicOram {
    pub(crate) pair: SteppingPair<PathOram>,
}

impl DynamicOram {
    /// Returns an empty ORAM of capacity 0 with values of `value_len` bytes.
    pub fn new(value_len: usize, storage: StorageConfig) -> Self {
        Self {
            pair: SteppingPair::new(value_len, storage),
        }
    }

    /// Returns an empty ORAM of capacity `2^k`.
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

    /// Whether `address` lives in the larger sub-ORAM (or the only one).
    fn in_larger_now(&self, address: Key) -> Result<bool, OramError> {
        match &self.pair.subs {
            SubStructures::Pair { smaller, .. } => self.in_larger(address, smaller.capacity()),
            _ => self.in_larger(address, 0),
        }
    }

    fn in_larger(&self, address: Key, smaller_capacity: usize) -> Result<bool, OramError> {
        let capacity = self.pair.capacity;
        let address = usize::try_from(address)?;
        if address == 0 || address > capacity {
            return Err(OramError::PositionOutOfBoundsError {
                position: Position::try_from(address)?,
                capacity,
            });
        }
        Ok(address > smaller_capacity || address <= capacity - smaller_capacity)
    }

    /// Writes `value` at `address`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a `PositionOutOfBoundsError` for an address outside `1..=capacity` and a
    /// `ValueLengthMismatchError` for a value of the wrong length.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        address: Key,
        value: Vec<u8>,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let in_larger = self.in_larger_now(address)?;
        if value.len() != self.pair.value_len() {
            return Err(OramError::ValueLengthMismatchError {
                expected: self.pair.value_len(),
                actual: value.len(),
            });
        }

        self.pair.metered(|subs| {
            let (home, other) = match split(subs, in_larger) {
                Some(pair) => pair,
                None => return Ok(()),
            };
            home.read_and_remove(0, address, key, rng)?;
            home.insert(Block::new(0, address, value), key, rng)?;
            if let Some(other) = other {
                other.dummy_access(key, rng)?;
                other.dummy_access(key, rng)?;
            }
            Ok(())
        })
    }

    /// Returns the value at `address`, if one was written.
    ///
    /// # Errors
    ///
    /// Returns a `PositionOutOfBoundsError` for an address outside `1..=capacity`.
    pub fn read<R: RngCore + CryptoRng>(
        &mut self,
        address: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        let in_larger = self.in_larger_now(address)?;
        self.pair.metered(|subs| {
            let (home, other) = match split(subs, in_larger) {
                Some(pair) => pair,
                None => return Ok(None),
            };
            let block = home.read(0, address, key, rng)?;
            if let Some(other) = other {
                other.dummy_access(key, rng)?;
            }
            Ok(block.map(|block| block.value))
        })
    }

    /// Clears `address` and returns its previous value, if any.
    ///
    /// # Errors
    ///
    /// Returns a `PositionOutOfBoundsError` for an address outside `1..=capacity`.
    pub fn read_and_remove<R: RngCore + CryptoRng>(
        &mut self,
        address: Key,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        let in_larger = self.in_larger_now(address)?;
        self.pair.metered(|subs| {
            let (home, other) = match split(subs, in_larger) {
                Some(pair) => pair,
                None => return Ok(None),
            };
            let block = home.read_and_remove(0, address, key, rng)?;
            if let Some(other) = other {
                other.dummy_access(key, rng)?;
            }
            Ok(block.map(|block| block.value))
        })
    }

    /// Adds the address `capacity + 1`, initially empty.
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
        let capacity = self.pair.capacity;
        self.pair.metered(|subs| match subs {
            SubStructures::Pair { smaller, larger } => {
                let moved = address_of(capacity % smaller.capacity() + 1)?;
                move_address(moved, smaller, larger, key, rng)
            }
            _ => Ok(()),
        })?;
        self.pair.capacity += 1;
        Ok(())
    }

    /// Removes the address `capacity`, returning the value it held.
    ///
    /// # Errors
    ///
    /// Returns a `NothingToShrinkError` at capacity 0.
    pub fn shrink<R: RngCore + CryptoRng>(
        &mut self,
        key: &EncryptionKey,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        let capacity = self.pair.capacity;
        if capacity == 0 {
            return Err(OramError::NothingToShrinkError);
        }

        let last = address_of(capacity)?;
        let dropped = self.pair.metered(|subs| match subs {
            SubStructures::Empty => Ok(None),
            SubStructures::Single(oram) => oram.read_and_remove(0, last, key, rng),
            SubStructures::Pair { smaller, larger } => {
                // The last address is always above the smaller capacity.
                let dropped = larger.read_and_remove(0, last, key, rng)?;
                smaller.dummy_access(key, rng)?;
                let moved = address_of((capacity - 1) % smaller.capacity() + 1)?;
                move_address(moved, larger, smaller, key, rng)?;
                Ok(dropped)
            }
        })?;
        self.pair.capacity -= 1;
        self.pair.demote_if_needed()?;
        Ok(dropped.map(|block| block.value))
    }
}

/// The sub-ORAM holding the address and, for a pair, the other one.
fn split(
    subs: &mut SubStructures<PathOram>,
    in_larger: bool,
) -> Option<(&mut PathOram, Option<&mut PathOram>)> {
    match subs {
        SubStructures::Empty => None,
        SubStructures::Single(oram) => Some((oram, None)),
        SubStructures::Pair { smaller, larger } => {
            if in_larger {
                Some((larger, Some(smaller)))
            } else {
                Some((smaller, Some(larger)))
            }
        }
    }
}

fn address_of(address: usize) -> Result<Key, OramError> {
    Ok(Key::try_from(address)?)
}

/// Moves `address` from `from` to `to`, with the same accesses whether or not it holds a value.
fn move_address<R: RngCore + CryptoRng>(
    address: Key,
    from: &mut PathOram,
    to: &mut PathOram,
    key: &EncryptionKey,
    rng: &mut R,
) -> Result<(), OramError> {
    match from.read_and_remove(0, address, key, rng)? {
        Some(block) => to.insert(Block::new(0, address, block.value), key, rng),
        None => to.dummy_access(key, rng),
    }
}
