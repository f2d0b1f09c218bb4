// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Storage abstractions for the untrusted memory holding encrypted buckets.

use crate::OramError;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

mod file_store;
mod hybrid_store;

pub use file_store::FileStore;
pub use hybrid_store::HybridStore;

/// An array of fixed-size records that the oblivious structures read and write by index.
pub trait BlockStore: Debug {
    /// The number of records.
    fn len(&self) -> usize;
    /// Returns true if the store holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The size of every record in bytes.
    fn entry_size(&self) -> usize;
    /// Reads the record stored at `index`.
    ///
    /// The returned slice is valid until the next call on `self`.
    fn read(&mut self, index: usize) -> Result<&[u8], OramError>;
    /// Overwrites the record stored at `index`.
    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError>;
    /// Whether any record lives in a file.
    fn is_on_disk(&self) -> bool {
        false
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Box<S> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn entry_size(&self) -> usize {
        (**self).entry_size()
    }

    fn read(&mut self, index: usize) -> Result<&[u8], OramError> {
        (**self).read(index)
    }

    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError> {
        (**self).write(index, entry)
    }

    fn is_on_disk(&self) -> bool {
        (**self).is_on_disk()
    }
}

pub(crate) fn check_index(index: usize, len: usize) -> Result<(), OramError> {
    if index >= len {
        return Err(OramError::StoreIndexOutOfRangeError { index, len });
    }
    Ok(())
}

pub(crate) fn check_entry(entry: &[u8], entry_size: usize) -> Result<(), OramError> {
    if entry.len() != entry_size {
        return Err(OramError::EntrySizeMismatchError {
            expected: entry_size,
            actual: entry.len(),
        });
    }
    Ok(())
}

/// A `BlockStore` backed by one contiguous in-memory buffer.
#[derive(Debug)]
pub struct RamStore {
    data: Vec<u8>,
    entry_size: usize,
    len: usize,
}

impl RamStore {
    /// Returns a store of `len` zeroed records of `entry_size` bytes each.
    pub fn new(len: usize, entry_size: usize) -> Self {
        Self {
            data: vec![0u8; len * entry_size],
            entry_size,
            len,
        }
    }
}

impl BlockStore for RamStore {
    fn len(&self) -> usize {
        self.len
    }

    fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn read(&mut self, index: usize) -> Result<&[u8], OramError> {
        check_index(index, self.len)?;
        let start = index * self.entry_size;
        Ok(&self.data[start..start + self.entry_size])
    }

    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError> {
        check_index(index, self.len)?;
        check_entry(entry, self.entry_size)?;
        let start = index * self.entry_size;
        self.data[start..start + self.entry_size].copy_from_slice(entry);
        Ok(())
    }
}

/// A `BlockStore` that counts reads and writes per index.
#[derive(Debug)]
pub struct CountAccessesStore<S> {
    inner: S,
    /// `reads[i]` tracks the total number of reads made to index `i`.
    pub reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to index `i`.
    pub writes: Vec<u64>,
}

impl<S: BlockStore> CountAccessesStore<S> {
    /// Wraps `inner`, starting all counters at zero.
    pub fn new(inner: S) -> Self {
        let len = inner.len();
        Self {
            inner,
            reads: vec![0; len],
            writes: vec![0; len],
        }
    }

    /// Returns the total number of reads to the store.
    pub fn get_read_count(&self) -> u64 {
        self.reads.iter().sum()
    }

    /// Returns the total number of writes to the store.
    pub fn get_write_count(&self) -> u64 {
        self.writes.iter().sum()
    }
}

impl<S: BlockStore> BlockStore for CountAccessesStore<S> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn entry_size(&self) -> usize {
        self.inner.entry_size()
    }

    fn read(&mut self, index: usize) -> Result<&[u8], OramError> {
        log::debug!("Physical read -- {}", index);

        check_index(index, self.reads.len())?;
        self.reads[index] += 1;
        self.inner.read(index)
    }

    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError> {
        log::debug!("Physical write -- {}", index);

        check_index(index, self.writes.len())?;
        self.writes[index] += 1;
        self.inner.write(index, entry)
    }

    fn is_on_disk(&self) -> bool {
        self.inner.is_on_disk()
    }
}

/// Where a structure keeps its encrypted buckets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// Every bucket is held in memory.
    #[default]
    InMemory,
    /// Buckets on tree levels `0..=max_levels_in_memory` are held in memory and the rest in
    /// a single file at `path`.
    ///
    /// The resizable structures treat `path` as a directory and keep one file per
    /// sub-structure in it.
    OnDisk {
        /// The backing file, or directory for the resizable structures.
        path: PathBuf,
        /// The deepest tree level kept in memory.
        max_levels_in_memory: u32,
    },
}

impl StorageConfig {
    /// Returns a configuration storing everything in a file at `path`, except the root bucket.
    pub fn on_disk<P: AsRef<Path>>(path: P) -> Self {
        Self::OnDisk {
            path: path.as_ref().to_path_buf(),
            max_levels_in_memory: 0,
        }
    }

    /// The configuration for the sub-structure of the given capacity inside a resizable structure.
    pub(crate) fn for_sub_structure(&self, capacity: usize) -> Self {
        match self {
            Self::InMemory => Self::InMemory,
            Self::OnDisk {
                path,
                max_levels_in_memory,
            } => Self::OnDisk {
                path: path.join(format!("{capacity}.bin")),
                max_levels_in_memory: *max_levels_in_memory,
            },
        }
    }

    /// Opens a store of `num_buckets` records for a tree of the given `depth`.
    ///
    /// Falls back to memory when every level fits in memory, or when the file cannot be created.
    pub(crate) fn open_tree_store(
        &self,
        num_buckets: usize,
        entry_size: usize,
        depth: u32,
    ) -> Box<dyn BlockStore> {
        let (path, max_levels_in_memory) = match self {
            Self::InMemory => return Box::new(RamStore::new(num_buckets, entry_size)),
            Self::OnDisk {
                path,
                max_levels_in_memory,
            } => (path, *max_levels_in_memory),
        };

        if max_levels_in_memory >= depth {
            return Box::new(RamStore::new(num_buckets, entry_size));
        }

        let in_memory = ((2usize << max_levels_in_memory) - 1).min(num_buckets);
        match FileStore::open(path, num_buckets - in_memory, entry_size, true) {
            Ok(file_store) => Box::new(HybridStore::new(vec![
                Box::new(RamStore::new(in_memory, entry_size)),
                Box::new(file_store),
            ])),
            Err(e) => {
                log::warn!(
                    "Could not open {} ({}); keeping all {} buckets in memory",
                    path.display(),
                    e,
                    num_buckets
                );
                Box::new(RamStore::new(num_buckets, entry_size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_store_reads_back_writes() {
        let mut store = RamStore::new(4, 3);
        assert_eq!(store.read(2).unwrap(), &[0, 0, 0]);
        store.write(2, &[1, 2, 3]).unwrap();
        assert_eq!(store.read(2).unwrap(), &[1, 2, 3]);
        assert_eq!(store.read(1).unwrap(), &[0, 0, 0]);
    }

    #[test]
    fn ram_store_rejects_bad_requests() {
        let mut store = RamStore::new(2, 3);
        assert!(matches!(
            store.read(2),
            Err(OramError::StoreIndexOutOfRangeError { index: 2, len: 2 })
        ));
        assert!(store.write(5, &[0, 0, 0]).is_err());
        assert!(matches!(
            store.write(0, &[0, 0]),
            Err(OramError::EntrySizeMismatchError {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn count_accesses_store_counts_per_index() {
        let mut store = CountAccessesStore::new(RamStore::new(3, 1));
        store.write(0, &[1]).unwrap();
        store.write(0, &[2]).unwrap();
        store.read(2).unwrap();
        assert_eq!(store.writes, vec![2, 0, 0]);
        assert_eq!(store.reads, vec![0, 0, 1]);
        assert_eq!(store.get_read_count(), 1);
        assert_eq!(store.get_write_count(), 2);
    }

    #[test]
    fn tree_store_stays_in_memory_when_all_levels_fit() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::OnDisk {
            path: dir.path().join("tree.bin"),
            max_levels_in_memory: 3,
        };
        let store = config.open_tree_store(15, 8, 3);
        assert!(!store.is_on_disk());
        assert_eq!(store.len(), 15);
    }

    #[test]
    fn tree_store_spills_deep_levels_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tree.bin");
        let config = StorageConfig::OnDisk {
            path: path.clone(),
            max_levels_in_memory: 1,
        };
        let mut store = config.open_tree_store(15, 8, 3);
        assert!(store.is_on_disk());
        assert_eq!(store.len(), 15);
        // Levels 0 and 1 (three buckets) stay in memory.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12 * 8);

        store.write(14, &[9u8; 8]).unwrap();
        store.write(1, &[4u8; 8]).unwrap();
        assert_eq!(store.read(14).unwrap(), &[9u8; 8]);
        assert_eq!(store.read(1).unwrap(), &[4u8; 8]);
    }

    #[test]
    fn sub_structure_files_are_named_by_capacity() {
        let config = StorageConfig::on_disk("/tmp/omap");
        assert_eq!(
            config.for_sub_structure(8),
            StorageConfig::OnDisk {
                path: PathBuf::from("/tmp/omap/8.bin"),
                max_levels_in_memory: 0
            }
        );
        assert_eq!(
            StorageConfig::InMemory.for_sub_structure(8),
            StorageConfig::InMemory
        );
    }
}
