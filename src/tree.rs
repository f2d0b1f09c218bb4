// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Geometry of the complete binary trees of buckets.

use crate::{OramError, Position};
use rand::{CryptoRng, Rng, RngCore};

/// A 0-based bucket index; the root is 0 and the children of `i` are `2i + 1` and `2i + 2`.
pub(crate) type TreeIndex = usize;
/// The level of a bucket; the root is at level 0.
pub(crate) type TreeHeight = u32;

/// Maps positions `1..=capacity` to root-to-leaf paths of bucket indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TreeLayout {
    capacity: usize,
    depth: TreeHeight,
    num_buckets: usize,
    leaf_shift: u32,
}

impl TreeLayout {
    /// The Path ORAM layout: two consecutive positions share each leaf bucket, so the tree has
    /// `capacity - 1` buckets (one bucket when `capacity` is 1).
    pub fn shared_leaves(capacity: usize) -> Result<Self, OramError> {
        check_capacity(capacity)?;
        let log_capacity = capacity.ilog2();
        Ok(Self {
            capacity,
            depth: log_capacity.saturating_sub(1),
            num_buckets: (capacity - 1).max(1),
            leaf_shift: u32::from(capacity > 1),
        })
    }

    /// The heap layout: one leaf bucket per position, `2 * capacity - 1` buckets in total.
    pub fn leaf_per_position(capacity: usize) -> Result<Self, OramError> {
        check_capacity(capacity)?;
        Ok(Self {
            capacity,
            depth: capacity.ilog2(),
            num_buckets: 2 * capacity - 1,
            leaf_shift: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The level of the leaves.
    pub fn depth(&self) -> TreeHeight {
        self.depth
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Returns an error unless `position` is in `1..=capacity`.
    pub fn check_position(&self, position: Position) -> Result<(), OramError> {
        if position == 0 || usize::try_from(position)? > self.capacity {
            return Err(OramError::PositionOutOfBoundsError {
                position,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// The bucket at `level` on the path of `position`.
    pub fn node_on_path(&self, position: Position, level: TreeHeight) -> TreeIndex {
        debug_assert!(position >= 1 && position as usize <= self.capacity);
        debug_assert!(level <= self.depth);
        // One-based heap numbering of the leaf, so that ancestors are found by shifting.
        let leaf = (self.capacity - 1 + position as usize) >> self.leaf_shift;
        (leaf >> (self.depth - level)) - 1
    }

    /// The buckets on the path of `position`, root first.
    pub fn path(&self, position: Position) -> impl DoubleEndedIterator<Item = TreeIndex> + '_ {
        (0..=self.depth).map(move |level| self.node_on_path(position, level))
    }

    /// Samples a position uniformly from `1..=capacity`.
    pub fn random_position<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Position {
        // `capacity` fits in a `Position`; this is checked on construction.
        rng.gen_range(1..=self.capacity as Position)
    }

    /// Samples one position from each half of the leaves.
    pub fn random_path_pair<R: RngCore + CryptoRng>(&self, rng: &mut R) -> (Position, Position) {
        let offset = (self.random_position(rng) - 1) >> 1;
        let half = (self.capacity as Position) >> 1;
        (1 + offset, 1 + (offset | half))
    }

    /// Samples a position from the half of the leaves that does not contain `position`.
    pub fn random_position_in_other_half<R: RngCore + CryptoRng>(
        &self,
        position: Position,
        rng: &mut R,
    ) -> Position {
        let half = (self.capacity as Position) >> 1;
        let other_half = (half & (position - 1)) ^ half;
        (other_half | ((self.random_position(rng) - 1) >> 1)) + 1
    }
}

fn check_capacity(capacity: usize) -> Result<(), OramError> {
    if !capacity.is_power_of_two() || Position::try_from(capacity).is_err() {
        return Err(OramError::InvalidConfigurationError);
    }
    Ok(())
}

/// The index of the other child of the parent of `index`, or `None` for the root.
pub(crate) fn sibling(index: TreeIndex) -> Option<TreeIndex> {
    match index {
        0 => None,
        i if i % 2 == 1 => Some(i + 1),
        i => Some(i - 1),
    }
}

/// The indices of the left and right children of `index`.
pub(crate) fn children(index: TreeIndex) -> (TreeIndex, TreeIndex) {
    (2 * index + 1, 2 * index + 2)
}
