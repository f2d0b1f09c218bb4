// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block and bucket structures, and their plaintext encodings.

use crate::{BucketSize, Key, OramError, Position};

const POSITION_BYTES: usize = std::mem::size_of::<Position>();
const KEY_BYTES: usize = std::mem::size_of::<Key>();
pub(crate) const BLOCK_HEADER_BYTES: usize = POSITION_BYTES + KEY_BYTES;

const LEFT_CHILD_WRITTEN: u8 = 0b01;
const RIGHT_CHILD_WRITTEN: u8 = 0b10;
const FIRST_SLOT_OCCUPIED: u8 = 0b100;

/// The largest bucket whose occupancy bits fit in the metadata byte next to the child bits.
pub(crate) const MAX_BLOCKS_PER_BUCKET: BucketSize = 6;

/// A Path ORAM block: a fixed-length value together with its key and its current position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    /// The leaf the block is currently mapped to.
    pub position: Position,
    /// The identifier of the block.
    pub key: Key,
    /// The payload, of a length fixed per structure.
    pub value: Vec<u8>,
}

impl Block {
    /// Returns a block holding `value` under `key` at `position`.
    pub fn new(position: Position, key: Key, value: Vec<u8>) -> Self {
        Self {
            position,
            key,
            value,
        }
    }

    pub(crate) fn encoded_len(value_len: usize) -> usize {
        BLOCK_HEADER_BYTES + value_len
    }

    /// Writes the block into `out`, which must hold exactly `encoded_len(value_len)` bytes.
    fn encode(&self, value_len: usize, out: &mut [u8]) {
        debug_assert_eq!(out.len(), Self::encoded_len(value_len));
        debug_assert_eq!(self.value.len(), value_len);
        out[..POSITION_BYTES].copy_from_slice(&self.position.to_le_bytes());
        out[POSITION_BYTES..BLOCK_HEADER_BYTES].copy_from_slice(&self.key.to_le_bytes());
        out[BLOCK_HEADER_BYTES..].copy_from_slice(&self.value);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut position = [0u8; POSITION_BYTES];
        let mut key = [0u8; KEY_BYTES];
        position.copy_from_slice(&bytes[..POSITION_BYTES]);
        key.copy_from_slice(&bytes[POSITION_BYTES..BLOCK_HEADER_BYTES]);
        Self {
            position: Position::from_le_bytes(position),
            key: Key::from_le_bytes(key),
            value: bytes[BLOCK_HEADER_BYTES..].to_vec(),
        }
    }
}

/// The occupied slots of one tree node, plus which of its children have ever been written.
///
/// Unoccupied slots are encoded as zero bytes, so every encoding of a `Bucket<Z>` has the same
/// length and is indistinguishable after encryption.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Bucket<const Z: BucketSize> {
    pub blocks: Vec<Block>,
    pub left_child_written: bool,
    pub right_child_written: bool,
}

impl<const Z: BucketSize> Bucket<Z> {
    pub fn encoded_len(value_len: usize) -> usize {
        1 + Z * Block::encoded_len(value_len)
    }

    /// Appends the encoding of the bucket to `out`.
    pub fn encode_into(&self, value_len: usize, out: &mut Vec<u8>) {
        debug_assert!(Z <= MAX_BLOCKS_PER_BUCKET);
        debug_assert!(self.blocks.len() <= Z);

        let mut flags = 0u8;
        if self.left_child_written {
            flags |= LEFT_CHILD_WRITTEN;
        }
        if self.right_child_written {
            flags |= RIGHT_CHILD_WRITTEN;
        }
        for slot in 0..self.blocks.len() {
            flags |= FIRST_SLOT_OCCUPIED << slot;
        }
        out.push(flags);

        let block_len = Block::encoded_len(value_len);
        let start = out.len();
        out.resize(start + Z * block_len, 0);
        for (slot, block) in self.blocks.iter().enumerate() {
            let offset = start + slot * block_len;
            block.encode(value_len, &mut out[offset..offset + block_len]);
        }
    }

    /// Decodes a bucket from the first `encoded_len(value_len)` bytes of `bytes`.
    pub fn decode(bytes: &[u8], value_len: usize) -> Result<Self, OramError> {
        if bytes.len() < Self::encoded_len(value_len) {
            return Err(OramError::MalformedPlaintextError { len: bytes.len() });
        }
        let flags = bytes[0];
        let block_len = Block::encoded_len(value_len);
        let blocks = (0..Z)
            .filter(|slot| flags & (FIRST_SLOT_OCCUPIED << slot) != 0)
            .map(|slot| {
                let offset = 1 + slot * block_len;
                Block::decode(&bytes[offset..offset + block_len])
            })
            .collect();

        Ok(Self {
            blocks,
            left_child_written: flags & LEFT_CHILD_WRITTEN != 0,
            right_child_written: flags & RIGHT_CHILD_WRITTEN != 0,
        })
    }
}

/// A heap bucket: a `Bucket<Z>` followed by the minimum block of the subtree it roots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct HeapBucket<const Z: BucketSize> {
    pub bucket: Bucket<Z>,
    pub subtree_min: Option<Block>,
}

impl<const Z: BucketSize> HeapBucket<Z> {
    pub fn encoded_len(value_len: usize) -> usize {
        Bucket::<Z>::encoded_len(value_len) + Block::encoded_len(value_len)
    }

    pub fn encode_into(&self, value_len: usize, out: &mut Vec<u8>) {
        self.bucket.encode_into(value_len, out);
        let block_len = Block::encoded_len(value_len);
        let start = out.len();
        out.resize(start + block_len, 0);
        if let Some(min) = &self.subtree_min {
            min.encode(value_len, &mut out[start..]);
        }
    }

    pub fn decode(bytes: &[u8], value_len: usize) -> Result<Self, OramError> {
        if bytes.len() < Self::encoded_len(value_len) {
            return Err(OramError::MalformedPlaintextError { len: bytes.len() });
        }
        let bucket = Bucket::<Z>::decode(bytes, value_len)?;
        let start = Bucket::<Z>::encoded_len(value_len);
        let min = Block::decode(&bytes[start..start + Block::encoded_len(value_len)]);
        // Heap blocks always carry a position, so a zero position marks an empty summary.
        let subtree_min = (min.position != 0).then_some(min);
        Ok(Self {
            bucket,
            subtree_min,
        })
    }
}
