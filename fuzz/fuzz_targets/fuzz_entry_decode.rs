#![no_main]
use flashkv::entry::{Entry, EntryFormat};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the entry parser or checksum verifier.
fuzz_target!(|input: &[u8]| {
    let mut format = EntryFormat::crc32(0x464C_4B56);
    if let Ok(entry) = Entry::parse(input) {
        let _ = entry.header.entry_size();
        let _ = entry.key();
        let _ = entry.value();
        let _ = entry.verify_checksum(&mut format);
    }
});
