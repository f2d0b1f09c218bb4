// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A block store held in a single pre-sized file.

use super::{check_entry, check_index, BlockStore};
use crate::OramError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A `BlockStore` keeping record `i` at byte offset `i * entry_size` of one file.
///
/// The file has no header. Its shape is implied by the number of records and the record size
/// supplied when it is opened.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    entry_size: usize,
    len: usize,
    reused: bool,
    buffer: Vec<u8>,
}

impl FileStore {
    /// Opens (creating it and its parent directories if needed) a file of `len` records of
    /// `entry_size` bytes each.
    ///
    /// An existing file is kept as is if it has exactly the expected size and `truncate` is false.
    /// Otherwise it is truncated and re-sized, which zeroes every record.
    ///
    /// # Errors
    ///
    /// Returns an `IoError` if the file cannot be created or re-sized.
    pub fn open<P: AsRef<Path>>(
        path: P,
        len: usize,
        entry_size: usize,
        truncate: bool,
    ) -> Result<Self, OramError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        let expected_bytes = u64::try_from(len * entry_size)?;
        let reused = !truncate && file.metadata()?.len() == expected_bytes;
        if !reused {
            file.set_len(0)?;
            file.set_len(expected_bytes)?;
        }
        log::debug!(
            "FileStore::open({}, len = {}, entry_size = {}, reused = {})",
            path.display(),
            len,
            entry_size,
            reused
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            entry_size,
            len,
            reused,
            buffer: vec![0u8; entry_size],
        })
    }

    /// Whether `open` found a file of the right size and kept its contents.
    pub fn reused(&self) -> bool {
        self.reused
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, index: usize) -> Result<u64, OramError> {
        Ok(u64::try_from(index * self.entry_size)?)
    }
}

impl BlockStore for FileStore {
    fn len(&self) -> usize {
        self.len
    }

    fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn read(&mut self, index: usize) -> Result<&[u8], OramError> {
        check_index(index, self.len)?;
        let offset = self.offset(index)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut self.buffer)?;
        Ok(&self.buffer)
    }

    fn write(&mut self, index: usize, entry: &[u8]) -> Result<(), OramError> {
        check_index(index, self.len)?;
        check_entry(entry, self.entry_size)?;
        let offset = self.offset(index)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(entry)?;
        Ok(())
    }

    fn is_on_disk(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_live_at_fixed_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let mut store = FileStore::open(&path, 4, 2, true).unwrap();
        store.write(3, &[7, 8]).unwrap();
        store.write(0, &[1, 2]).unwrap();
        assert_eq!(store.read(3).unwrap(), &[7, 8]);
        assert_eq!(store.read(1).unwrap(), &[0, 0]);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 0, 0, 0, 0, 7, 8]);
    }

    #[test]
    fn reopen_keeps_contents_of_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let mut store = FileStore::open(&path, 3, 4, true).unwrap();
            assert!(!store.reused());
            store.write(2, b"abcd").unwrap();
        }
        let mut reopened = FileStore::open(&path, 3, 4, false).unwrap();
        assert!(reopened.reused());
        assert_eq!(reopened.read(2).unwrap(), b"abcd");
    }

    #[test]
    fn reopen_with_other_shape_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let mut store = FileStore::open(&path, 3, 4, true).unwrap();
            store.write(0, b"abcd").unwrap();
        }
        let mut reopened = FileStore::open(&path, 4, 4, false).unwrap();
        assert!(!reopened.reused());
        assert_eq!(reopened.read(0).unwrap(), &[0u8; 4]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn out_of_range_access_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("s.bin"), 2, 2, true).unwrap();
        assert!(store.read(2).is_err());
        assert!(store.write(2, &[0, 0]).is_err());
        assert!(store.is_on_disk());
    }

    #[test]
    fn unopenable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // A regular file cannot be used as a parent directory.
        assert!(matches!(
            FileStore::open(blocker.join("store.bin"), 2, 2, true),
            Err(OramError::IoError(_))
        ));
    }
}
