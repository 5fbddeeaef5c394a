//! Property-based tests for store correctness
//!
//! Uses proptest to verify round-trip, last-writer-wins, and the free-sector
//! invariant across many random operation sequences.

use proptest::prelude::*;
use std::collections::HashMap;

use flashkv::{Config, EntryFormat, InMemoryFlash, KeyValueStore, KvsError};

const MAGIC: u32 = 0x464C_4B56;
const SECTOR: usize = 1024;
const SECTORS: usize = 8;

fn test_store() -> KeyValueStore<InMemoryFlash> {
    let flash = InMemoryFlash::new(SECTOR, SECTORS, 16);
    let config = Config::builder().max_entries(32).build();
    let mut kvs = KeyValueStore::new(flash, vec![EntryFormat::crc32(MAGIC)], config).unwrap();
    kvs.init().unwrap();
    kvs
}

fn get_vec(kvs: &mut KeyValueStore<InMemoryFlash>, key: &str) -> Result<Vec<u8>, KvsError> {
    let size = kvs.value_size(key)?;
    let mut buf = vec![0u8; size];
    kvs.get(key, &mut buf)?;
    Ok(buf)
}

fn erased_sectors(kvs: &KeyValueStore<InMemoryFlash>) -> usize {
    let image = kvs.device().contents();
    (0..SECTORS)
        .filter(|&s| image[s * SECTOR..(s + 1) * SECTOR].iter().all(|&b| b == 0xFF))
        .count()
}

/// One random store operation.
#[derive(Debug, Clone)]
enum Op {
    Put(u8, Vec<u8>),
    Delete(u8),
    Maintenance,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u8..12, prop::collection::vec(any::<u8>(), 0..200)).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0u8..12).prop_map(Op::Delete),
        1 => Just(Op::Maintenance),
    ]
}

proptest! {
    #[test]
    fn prop_roundtrip(key in "[a-z]{1,16}", value in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut kvs = test_store();
        kvs.put(&key, &value).unwrap();
        prop_assert_eq!(get_vec(&mut kvs, &key).unwrap(), value);
    }

    #[test]
    fn prop_last_write_wins(
        key in "[a-z]{1,16}",
        values in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..20)
    ) {
        let mut kvs = test_store();
        for value in &values {
            kvs.put(&key, value).unwrap();
        }
        prop_assert_eq!(&get_vec(&mut kvs, &key).unwrap(), values.last().unwrap());
        prop_assert_eq!(kvs.len(), 1);
    }

    #[test]
    fn prop_store_matches_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut kvs = test_store();
        let mut model: HashMap<String, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, value) => {
                    let key = format!("key-{k}");
                    kvs.put(&key, &value).unwrap();
                    model.insert(key, value);
                }
                Op::Delete(k) => {
                    let key = format!("key-{k}");
                    let result = kvs.delete(&key);
                    if model.remove(&key).is_some() {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(KvsError::NotFound)));
                    }
                }
                Op::Maintenance => kvs.full_maintenance().unwrap(),
            }
            prop_assert!(erased_sectors(&kvs) >= 1, "free-sector invariant violated");
        }

        prop_assert_eq!(kvs.len(), model.len());
        for (key, value) in &model {
            prop_assert_eq!(&get_vec(&mut kvs, key).unwrap(), value);
        }
    }

    #[test]
    fn prop_survives_reinit(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut kvs = test_store();
        let mut model: HashMap<String, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, value) => {
                    let key = format!("key-{k}");
                    kvs.put(&key, &value).unwrap();
                    model.insert(key, value);
                }
                Op::Delete(k) => {
                    let key = format!("key-{k}");
                    if kvs.delete(&key).is_ok() {
                        model.remove(&key);
                    }
                }
                Op::Maintenance => kvs.heavy_maintenance().unwrap(),
            }
        }

        let image = kvs.device().contents().to_vec();
        let mut flash = InMemoryFlash::new(SECTOR, SECTORS, 16);
        flash.load_image(&image);
        let config = Config::builder().max_entries(32).build();
        let mut reopened =
            KeyValueStore::new(flash, vec![EntryFormat::crc32(MAGIC)], config).unwrap();
        reopened.init().unwrap();

        prop_assert_eq!(reopened.len(), model.len());
        for (key, value) in &model {
            prop_assert_eq!(&get_vec(&mut reopened, key).unwrap(), value);
        }
    }
}
