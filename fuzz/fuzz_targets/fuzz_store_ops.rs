#![no_main]
use flashkv::{Config, EntryFormat, InMemoryFlash, KeyValueStore};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug, Arbitrary)]
enum StoreOp {
    Put { key: u8, len: u16 },
    Delete { key: u8 },
    Get { key: u8 },
    Maintenance,
    CorruptByte { address: u16 },
    Reinit,
}

// Random operation sequences, including mid-run corruption and reinit, must
// never panic the store.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<StoreOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let flash = InMemoryFlash::new(1024, 4, 16);
    let formats = || vec![EntryFormat::crc32(0x464C_4B56)];
    let mut kvs = match KeyValueStore::new(flash, formats(), Config::default()) {
        Ok(kvs) => kvs,
        Err(_) => return,
    };
    let _ = kvs.init();

    for op in ops.iter().take(64) {
        match op {
            StoreOp::Put { key, len } => {
                let value = vec![*key; (*len as usize) % 512];
                let _ = kvs.put(&format!("key{key}"), &value);
            }
            StoreOp::Delete { key } => {
                let _ = kvs.delete(&format!("key{key}"));
            }
            StoreOp::Get { key } => {
                let mut buf = [0u8; 512];
                let _ = kvs.get(&format!("key{key}"), &mut buf);
            }
            StoreOp::Maintenance => {
                let _ = kvs.full_maintenance();
            }
            StoreOp::CorruptByte { address } => {
                let address = (*address as u32) % 4096;
                kvs.device_mut().corrupt_byte(address);
            }
            StoreOp::Reinit => {
                let image = kvs.device().contents().to_vec();
                let mut flash = InMemoryFlash::new(1024, 4, 16);
                flash.load_image(&image);
                kvs = match KeyValueStore::new(flash, formats(), Config::default()) {
                    Ok(kvs) => kvs,
                    Err(_) => return,
                };
                let _ = kvs.init();
            }
        }
    }
});
