// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM stash.

use crate::{
    bucket::Block,
    tree::{TreeHeight, TreeIndex, TreeLayout},
    Key, Position,
};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// Blocks read off a path that have not been evicted back into the tree yet.
#[derive(Debug, Default)]
pub(crate) struct Stash {
    blocks: Vec<Block>,
}

impl Stash {
    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Scans the whole stash for a block satisfying `is_match`, returning the index of the last one.
    fn scan<F: Fn(&Block) -> Choice>(&self, is_match: F) -> Option<usize> {
        let mut found = Choice::from(0);
        let mut found_index = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            let block_matches = is_match(block);
            found_index.conditional_assign(&(i as u64), block_matches);
            found |= block_matches;
        }
        bool::from(found).then_some(found_index as usize)
    }

    fn find(&self, key: Key, position: Position) -> Option<usize> {
        self.scan(|block| block.key.ct_eq(&key) & block.position.ct_eq(&position))
    }

    /// Removes and returns the block with the given key and position.
    pub fn take(&mut self, key: Key, position: Position) -> Option<Block> {
        self.find(key, position).map(|i| self.blocks.remove(i))
    }

    /// Moves the block with the given key and position to `new_position`, returning a copy of it.
    pub fn reposition(
        &mut self,
        key: Key,
        position: Position,
        new_position: Position,
    ) -> Option<Block> {
        let i = self.find(key, position)?;
        self.blocks[i].position = new_position;
        Some(self.blocks[i].clone())
    }

    /// Removes and returns a block equal to `target` in position, key and value.
    pub fn take_exact(&mut self, target: &Block) -> Option<Block> {
        self.scan(|block| {
            block.key.ct_eq(&target.key)
                & block.position.ct_eq(&target.position)
                & block.value.as_slice().ct_eq(target.value.as_slice())
        })
        .map(|i| self.blocks.remove(i))
    }

    /// Removes up to `limit` blocks that may live in bucket `index` at `level`, in stash order.
    pub fn take_for_bucket(
        &mut self,
        layout: &TreeLayout,
        level: TreeHeight,
        index: TreeIndex,
        limit: usize,
    ) -> Vec<Block> {
        let mut taken = Vec::with_capacity(limit);
        let mut kept = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            if taken.len() < limit && layout.node_on_path(block.position, level) == index {
                taken.push(block);
            } else {
                kept.push(block);
            }
        }
        self.blocks = kept;
        taken
    }
}
