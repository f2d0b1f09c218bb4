// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A block store splitting its index range across several stores.

use super::{check_index, BlockStore};
use crate::OramError;

/// A `BlockStore` that concatenates the index ranges of its tiers.
///
/// Index `i` is served by the first tier whose cumulative length exceeds `i`. Tree stores put a
/// small in-memory tier first so that the upper, most frequently read levels never hit the disk.
#[derive(Debug)]
pub struct HybridStore {
    tiers: Vec<Box<dyn BlockStore>>,
    upper_bounds: Vec<usize>,
    entry_size: usize,
}

impl HybridStore {
    /// Concatenates `tiers` in order. All tiers must share one record size.
    pub fn new(tiers: Vec<Box<dyn BlockStore>>) -> Self {
        let entry_size = tiers.first().map_or(0, |tier| tier.entry_size());
        debug_assert!(tiers.iter().all(|tier| tier.entry_size() == entry_size));

        let mut upper_bounds = Vec::with_capacity(tiers.len());
        let mut bound = 0;
        for tier in &tiers {
            bound += tier.len();
            upper_bounds.push(bound);
        }
        Self {
            tiers,
            upper_bounds,
            entry_size,
        }
    }

    fn locate(&self, index: usize) -> Result<(usize, usize), OramError> {
        check_index(index, self.len())?;
        let tier = self.upper_bounds.partition_point(|bound| *bound <= index);
        let start = if tier == 0 {
            0
        } else {
            self.upper_bounds[tier - 1]
        };
        Ok((tier, index - start))
    }
}

impl BlockStore for HybridStore {
    fn len(&self) -> usize {
        self.upper_bounds.last().copied().unwrap_or(0)
    }

    fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn read(&mut self, index: usize) -> Result<&[u8], OramError> {
        let (tier, local) = self.locate(index)?;
        self.tiers[tier].read(local)
    }

    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError> {
        let (tier, local) = self.locate(index)?;
        self.tiers[tier].write(local, entry)
    }

    fn is_on_disk(&self) -> bool {
        self.tiers.iter().any(|tier| tier.is_on_disk())
    }
}
