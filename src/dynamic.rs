// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Resizable oblivious structures.
//!
//! A resizable structure of capacity `c` holds two static structures of adjacent power-of-two
//! capacities `s` and `2s`, with `s < c <= 2s`. Growing by one moves one element from the
//! smaller structure to the larger one; once the capacity reaches `2s` the smaller structure is
//! empty, the larger one takes its place and a new one of twice the capacity is allocated.
//! Shrinking is the mirror image. Every operation touches both static structures with the same
//! number of accesses, so the split of the elements between them stays hidden.

use crate::{store::StorageConfig, Measured, OramError};
use duplicate::duplicate_item;

pub mod oheap;
pub mod omap;
pub mod oram;

use oheap::DynamicOheap;
use omap::DynamicOmap;
use oram::DynamicOram;

/// A static structure that a resizable structure can be assembled from.
pub(crate) trait SubStructure: Measured + Sized {
    /// Returns an empty structure of the given power-of-two capacity.
    fn with_capacity(
        capacity: usize,
        value_len: usize,
        storage: &StorageConfig,
    ) -> Result<Self, OramError>;
}

#[derive(Debug)]
pub(crate) enum SubStructures<T> {
    Empty,
    /// The capacity-1 structure, before there is anything to pair it with.
    Single(T),
    Pair {
        smaller: T,
        larger: T,
    },
}

impl<T: Measured> SubStructures<T> {
    fn totals(&self) -> (u64, u64) {
        match self {
            Self::Empty => (0, 0),
            Self::Single(single) => (single.memory_access_count(), single.memory_bytes_moved()),
            Self::Pair { smaller, larger } => (
                smaller.memory_access_count() + larger.memory_access_count(),
                smaller.memory_bytes_moved() + larger.memory_bytes_moved(),
            ),
        }
    }
}

/// The two sub-structures of a resizable structure, its logical capacity and its running cost
/// counters.
#[derive(Debug)]
pub(crate) struct SteppingPair<T> {
    pub subs: SubStructures<T>,
    pub capacity: usize,
    value_len: usize,
    storage: StorageConfig,
    memory_access_count: u64,
    memory_bytes_moved: u64,
}

impl<T: SubStructure> SteppingPair<T> {
    pub fn new(value_len: usize, storage: StorageConfig) -> Self {
        Self {
            subs: SubStructures::Empty,
            capacity: 0,
            value_len,
            storage,
            memory_access_count: 0,
            memory_bytes_moved: 0,
        }
    }

    /// Returns an empty pair of capacity `2^k`.
    pub fn with_capacity_power_of_two(
        k: u32,
        value_len: usize,
        storage: StorageConfig,
    ) -> Result<Self, OramError> {
        let capacity = 1usize
            .checked_shl(k)
            .ok_or(OramError::InvalidConfigurationError)?;
        let mut pair = Self::new(value_len, storage);
        pair.subs = if capacity == 1 {
            SubStructures::Single(pair.allocate(1)?)
        } else {
            SubStructures::Pair {
                smaller: pair.allocate(capacity / 2)?,
                larger: pair.allocate(capacity)?,
            }
        };
        pair.capacity = capacity;
        Ok(pair)
    }

    pub fn value_len(&self) -> usize {
        self.value_len
    }

    fn allocate(&self, capacity: usize) -> Result<T, OramError> {
        T::with_capacity(
            capacity,
            self.value_len,
            &self.storage.for_sub_structure(capacity),
        )
    }

    /// Runs `step` on the sub-structures, adding the accesses it makes to the running totals.
    pub fn metered<U, F>(&mut self, step: F) -> Result<U, OramError>
    where
        F: FnOnce(&mut SubStructures<T>) -> Result<U, OramError>,
    {
        let (accesses_before, bytes_before) = self.subs.totals();
        let result = step(&mut self.subs);
        let (accesses_after, bytes_after) = self.subs.totals();
        self.memory_access_count += accesses_after - accesses_before;
        self.memory_bytes_moved += bytes_after - bytes_before;
        result
    }

    /// The first half of a grow: makes room for one more element, promoting the larger
    /// sub-structure when the capacity has reached it.
    pub fn promote_if_full(&mut self) -> Result<(), OramError> {
        let full_capacity = match &self.subs {
            SubStructures::Empty => 0,
            SubStructures::Single(single) => single.capacity(),
            SubStructures::Pair { larger, .. } => larger.capacity(),
        };
        if self.capacity < full_capacity {
            return Ok(());
        }

        let fresh_capacity = if full_capacity == 0 { 1 } else { 2 * full_capacity };
        let fresh = self.allocate(fresh_capacity)?;
        self.subs = match std::mem::replace(&mut self.subs, SubStructures::Empty) {
            SubStructures::Empty => SubStructures::Single(fresh),
            SubStructures::Single(single) => SubStructures::Pair {
                smaller: single,
                larger: fresh,
            },
            SubStructures::Pair { larger, .. } => SubStructures::Pair {
                smaller: larger,
                larger: fresh,
            },
        };
        log::info!(
            "Promoted at capacity {}; new sub-structure of capacity {}",
            self.capacity,
            fresh_capacity
        );
        Ok(())
    }

    /// The last half of a shrink: once the capacity is back down to the smaller sub-structure's,
    /// the (now empty) larger one is dropped and a new smaller one of half the capacity is
    /// allocated.
    pub fn demote_if_needed(&mut self) -> Result<(), OramError> {
        let demote = match &self.subs {
            SubStructures::Empty => false,
            SubStructures::Single(_) => self.capacity == 0,
            SubStructures::Pair { smaller, .. } => self.capacity == smaller.capacity(),
        };
        if !demote {
            return Ok(());
        }

        let fresh = match self.capacity {
            0 | 1 => None,
            capacity => Some(self.allocate(capacity / 2)?),
        };
        self.subs = match (std::mem::replace(&mut self.subs, SubStructures::Empty), fresh) {
            (SubStructures::Pair { smaller, .. }, Some(fresh)) => SubStructures::Pair {
                smaller: fresh,
                larger: smaller,
            },
            (SubStructures::Pair { smaller, .. }, None) => SubStructures::Single(smaller),
            _ => SubStructures::Empty,
        };
        log::info!("Demoted at capacity {}", self.capacity);
        Ok(())
    }
}

impl<T: Measured> Measured for SteppingPair<T> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn size(&self) -> usize {
        match &self.subs {
            SubStructures::Empty => 0,
            SubStructures::Single(single) => single.size(),
            SubStructures::Pair { smaller, larger } => smaller.size() + larger.size(),
        }
    }

    fn memory_access_count(&self) -> u64 {
        self.memory_access_count
    }

    fn memory_bytes_moved(&self) -> u64 {
        self.memory_bytes_moved
    }

    fn is_on_disk(&self) -> bool {
        match &self.subs {
            SubStructures::Empty => false,
            SubStructures::Single(single) => single.is_on_disk(),
            SubStructures::Pair { smaller, larger } => smaller.is_on_disk() || larger.is_on_disk(),
        }
    }
}

#[duplicate_item(
    dynamic_type;
    [DynamicOram];
    [DynamicOmap];
    [DynamicOheap];
)]
impl Measured for dynamic_type {
    fn capacity(&self) -> usize {
        self.pair.capacity()
    }

    fn size(&self) -> usize {
        self.pair.size()
    }

    fn memory_access_count(&self) -> u64 {
        self.pair.memory_access_count()
    }

    fn memory_bytes_moved(&self) -> u64 {
        self.pair.memory_bytes_moved()
    }

    fn is_on_disk(&self) -> bool {
        self.pair.is_on_disk()
    }
}

/// The most elements the smaller sub-structure of capacity `smaller_capacity` may hold in a
/// structure of total capacity `capacity`, and the most the larger one may hold.
///
/// Both bounds are met after every operation. They add up to `capacity`, leave the smaller
/// sub-structure empty when `capacity` reaches twice its capacity and leave the larger one empty
/// when `capacity` is down to the smaller capacity.
pub(crate) fn occupancy_bounds(capacity: usize, smaller_capacity: usize) -> (usize, usize) {
    (
        2 * smaller_capacity - capacity,
        2 * (capacity - smaller_capacity),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_span_the_capacity() {
        for smaller_capacity in [1usize, 2, 8] {
            for capacity in smaller_capacity..=2 * smaller_capacity {
                let (smaller, larger) = occupancy_bounds(capacity, smaller_capacity);
                assert_eq!(smaller + larger, capacity);
                assert!(smaller <= smaller_capacity);
                assert!(larger <= 2 * smaller_capacity);
            }
        }
        assert_eq!(occupancy_bounds(8, 4), (0, 8));
        assert_eq!(occupancy_bounds(4, 4), (4, 0));
    }
}
