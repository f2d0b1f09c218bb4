// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A very simple demonstration of resizable oblivious structures.

extern crate dynamic_oram;

use dynamic_oram::{
    DynamicOheap, DynamicOmap, DynamicOram, EncryptionKey, Measured, OramError, StorageConfig,
};
use rand::rngs::OsRng;
use simplelog::{Config, LevelFilter, SimpleLogger};

fn report<T: Measured>(name: &str, structure: &T) {
    println!(
        "{name}: capacity {}, size {}, {} memory accesses, {} bytes moved",
        structure.capacity(),
        structure.size(),
        structure.memory_access_count(),
        structure.memory_bytes_moved()
    );
}

fn main() -> Result<(), OramError> {
    SimpleLogger::init(LevelFilter::Info, Config::default())
        .map_err(|_| OramError::InvalidConfigurationError)?;
    let mut rng = OsRng;
    let key = EncryptionKey::generate(&mut rng);

    let mut map = DynamicOmap::new(8, StorageConfig::InMemory);
    for k in 1..=5u32 {
        map.grow(&key, &mut rng)?;
        map.insert(k, u64::from(k * 100).to_le_bytes().to_vec(), &key, &mut rng)?;
    }
    println!("map[3] = {:?}", map.read(3, &key, &mut rng)?);
    map.read_and_remove(3, &key, &mut rng)?;
    map.shrink(&key, &mut rng)?;
    report("map", &map);

    let mut oram = DynamicOram::new(4, StorageConfig::InMemory);
    for _ in 0..6 {
        oram.grow(&key, &mut rng)?;
    }
    oram.insert(6, b"last".to_vec(), &key, &mut rng)?;
    println!("oram shrink dropped {:?}", oram.shrink(&key, &mut rng)?);
    report("oram", &oram);

    let mut heap = DynamicOheap::new(4, StorageConfig::InMemory);
    for priority in [30u32, 10, 20] {
        heap.grow(&key, &mut rng)?;
        heap.insert(priority, priority.to_le_bytes().to_vec(), &key, &mut rng)?;
    }
    while let Some(min) = heap.extract_min(&key, &mut rng)? {
        println!("heap min {}", min.key);
    }
    report("heap", &heap);

    Ok(())
}
