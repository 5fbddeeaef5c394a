//! On-flash entry codec.
//!
//! Every record on flash is one entry: a fixed 16-byte header, the raw key
//! bytes, the raw value bytes, then padding up to the entry alignment. The
//! header is encoded field by field at fixed offsets in little-endian order;
//! the layout never depends on compiler struct packing.
//!
//! ## Layout
//! ```text
//! ┌────────────┬──────────────┬───────────────────┬─────────────┬──────────────┬────────────────┐
//! │ magic (4)  │ checksum (4) │ alignment_units(1)│ key_len (1) │ value_len (2)│ txn_id (4)     │
//! ├────────────┴──────────────┴───────────────────┴─────────────┴──────────────┴────────────────┤
//! │ key bytes │ value bytes │ padding to (alignment_units + 1) * 16, filled with erased byte    │
//! └───────────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A tombstone records a deletion: `value_len` holds the sentinel 0xFFFF and
//! the entry carries no value payload.

use crate::checksum::{ChecksumAlgorithm, CHECKSUM_FIELD_SIZE};
use crate::error::{KvsError, Result};

/// Fixed size of the entry header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Longest supported key, in bytes.
pub const MAX_KEY_LENGTH: usize = 64;

/// Largest supported value, in bytes. 0xFFFF is reserved for the tombstone
/// sentinel.
pub const MAX_VALUE_LENGTH: usize = 65534;

/// `value_length` pattern marking a deleted entry.
const TOMBSTONE_SENTINEL: u16 = 0xFFFF;

/// Round `n` up to the next multiple of `alignment`.
pub const fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) / alignment * alignment
}

/// One recognized on-flash format: a magic number plus the checksum
/// algorithm entries of that format carry (`None` means unchecked, with the
/// header checksum field required to be zero).
///
/// The first format registered with a store is primary: all new writes use
/// it. Additional formats remain readable for migration.
pub struct EntryFormat {
    pub magic: u32,
    pub checksum: Option<Box<dyn ChecksumAlgorithm>>,
}

impl EntryFormat {
    pub fn new(magic: u32, checksum: Option<Box<dyn ChecksumAlgorithm>>) -> Self {
        Self { magic, checksum }
    }

    /// Convenience constructor for the default CRC32-checked format.
    pub fn crc32(magic: u32) -> Self {
        Self::new(magic, Some(Box::new(crate::checksum::ChecksumCrc32::new())))
    }

    /// Compute the checksum field value for `header_bytes` (checksum field
    /// already zeroed) followed by key and value bytes.
    fn compute(&mut self, header_bytes: &[u8], key: &[u8], value: &[u8]) -> u32 {
        match self.checksum.as_mut() {
            None => 0,
            Some(algo) => {
                algo.reset();
                algo.update(header_bytes);
                algo.update(key);
                algo.update(value);
                let state = algo.finish();
                let mut field = [0u8; CHECKSUM_FIELD_SIZE];
                let len = state.len().min(CHECKSUM_FIELD_SIZE);
                field[..len].copy_from_slice(&state[..len]);
                u32::from_le_bytes(field)
            }
        }
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: u32,
    pub checksum: u32,
    alignment_units: u8,
    key_length: u8,
    value_length_raw: u16,
    pub transaction_id: u32,
}

impl EntryHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(KvsError::DataLoss(format!(
                "entry header truncated: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            alignment_units: bytes[8],
            key_length: bytes[9],
            value_length_raw: u16::from_le_bytes([bytes[10], bytes[11]]),
            transaction_id: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Encode into exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8] = self.alignment_units;
        bytes[9] = self.key_length;
        bytes[10..12].copy_from_slice(&self.value_length_raw.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.transaction_id.to_le_bytes());
        bytes
    }

    /// Entry alignment in bytes, always a multiple of 16.
    pub fn alignment_bytes(&self) -> usize {
        (self.alignment_units as usize + 1) * 16
    }

    pub fn key_length(&self) -> usize {
        self.key_length as usize
    }

    /// Value length in bytes; 0 for tombstones regardless of the stored
    /// sentinel pattern.
    pub fn value_length(&self) -> usize {
        if self.is_tombstone() {
            0
        } else {
            self.value_length_raw as usize
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_length_raw == TOMBSTONE_SENTINEL
    }

    /// Total on-flash size of the entry this header starts.
    pub fn entry_size(&self) -> usize {
        align_up(
            HEADER_SIZE + self.key_length() + self.value_length(),
            self.alignment_bytes(),
        )
    }

    /// Structural sanity check, independent of checksums: key length within
    /// bounds. Headers failing this are corrupt and their sizes cannot be
    /// trusted.
    pub fn is_plausible(&self) -> bool {
        self.key_length >= 1 && self.key_length as usize <= MAX_KEY_LENGTH
    }
}

/// A decoded entry borrowed from a raw flash buffer.
pub struct Entry<'a> {
    pub header: EntryHeader,
    bytes: &'a [u8],
}

impl<'a> Entry<'a> {
    /// Parse an entry from `bytes`, which must hold at least header + key +
    /// value.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = EntryHeader::decode(bytes)?;
        let span = HEADER_SIZE + header.key_length() + header.value_length();
        if bytes.len() < span {
            return Err(KvsError::DataLoss(format!(
                "entry truncated: need {} bytes, have {}",
                span,
                bytes.len()
            )));
        }
        Ok(Self { header, bytes })
    }

    pub fn key(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..HEADER_SIZE + self.header.key_length()]
    }

    pub fn value(&self) -> &'a [u8] {
        let start = HEADER_SIZE + self.header.key_length();
        &self.bytes[start..start + self.header.value_length()]
    }

    /// Recompute the checksum with `format`'s algorithm and compare against
    /// the stored field.
    ///
    /// With no algorithm registered, a nonzero stored checksum is an
    /// integrity claim nothing can check, and fails as data loss.
    pub fn verify_checksum(&self, format: &mut EntryFormat) -> Result<()> {
        match format.checksum.as_mut() {
            None => {
                if self.header.checksum != 0 {
                    return Err(KvsError::DataLoss(
                        "nonzero checksum stored under a checksum-less format".into(),
                    ));
                }
                Ok(())
            }
            Some(algo) => {
                let mut zeroed = self.header;
                zeroed.checksum = 0;
                algo.reset();
                algo.update(&zeroed.encode());
                algo.update(self.key());
                algo.update(self.value());
                algo.verify(&self.header.checksum.to_le_bytes())
            }
        }
    }
}

/// Total on-flash size for an entry with the given key and value lengths.
/// `value_length` of `None` sizes a tombstone.
pub fn entry_size(alignment: usize, key_length: usize, value_length: Option<usize>) -> usize {
    align_up(
        HEADER_SIZE + key_length + value_length.unwrap_or(0),
        alignment,
    )
}

/// Serialize one entry in `format`.
///
/// `value` of `None` encodes a tombstone. Padding bytes up to `alignment`
/// are filled with `erased_byte` so padded regions are indistinguishable
/// from untouched flash.
pub fn encode_entry(
    format: &mut EntryFormat,
    key: &[u8],
    value: Option<&[u8]>,
    alignment: usize,
    transaction_id: u32,
    erased_byte: u8,
) -> Result<Vec<u8>> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(KvsError::InvalidArgument(format!(
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    if let Some(value) = value {
        if value.len() > MAX_VALUE_LENGTH {
            return Err(KvsError::InvalidArgument(format!(
                "value length {} exceeds {}",
                value.len(),
                MAX_VALUE_LENGTH
            )));
        }
    }
    debug_assert!(alignment % 16 == 0 && alignment / 16 <= 256);

    let value_bytes = value.unwrap_or(&[]);
    let mut header = EntryHeader {
        magic: format.magic,
        checksum: 0,
        alignment_units: (alignment / 16 - 1) as u8,
        key_length: key.len() as u8,
        value_length_raw: match value {
            Some(v) => v.len() as u16,
            None => TOMBSTONE_SENTINEL,
        },
        transaction_id,
    };
    header.checksum = format.compute(&header.encode(), key, value_bytes);

    let total = entry_size(alignment, key.len(), value.map(<[u8]>::len));
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(value_bytes);
    bytes.resize(total, erased_byte);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x464C_4B56;

    fn format() -> EntryFormat {
        EntryFormat::crc32(MAGIC)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(100, 32), 128);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = EntryHeader {
            magic: MAGIC,
            checksum: 0xDEAD_BEEF,
            alignment_units: 0,
            key_length: 4,
            value_length_raw: 6,
            transaction_id: 42,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(EntryHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_fixed() {
        let header = EntryHeader {
            magic: 0x0403_0201,
            checksum: 0x0807_0605,
            alignment_units: 0x09,
            key_length: 0x0A,
            value_length_raw: 0x0C0B,
            transaction_id: 0x100F_0E0D,
        };
        assert_eq!(
            header.encode(),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10]
        );
    }

    #[test]
    fn test_encode_decode_entry() {
        let mut format = format();
        let bytes = encode_entry(&mut format, b"key1", Some(b"value1"), 16, 7, 0xFF).unwrap();
        assert_eq!(bytes.len(), align_up(16 + 4 + 6, 16));

        let entry = Entry::parse(&bytes).unwrap();
        assert_eq!(entry.header.magic, MAGIC);
        assert_eq!(entry.header.transaction_id, 7);
        assert_eq!(entry.key(), b"key1");
        assert_eq!(entry.value(), b"value1");
        assert!(!entry.header.is_tombstone());
        entry.verify_checksum(&mut format).unwrap();
    }

    #[test]
    fn test_padding_uses_erased_byte() {
        let mut format = format();
        let bytes = encode_entry(&mut format, b"k", Some(b"v"), 32, 1, 0xFF).unwrap();
        assert_eq!(bytes.len(), 32);
        assert!(bytes[18..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_tombstone_encoding() {
        let mut format = format();
        let bytes = encode_entry(&mut format, b"gone", None, 16, 9, 0xFF).unwrap();
        assert_eq!(bytes.len(), align_up(16 + 4, 16));

        let entry = Entry::parse(&bytes).unwrap();
        assert!(entry.header.is_tombstone());
        assert_eq!(entry.header.value_length(), 0);
        assert_eq!(entry.value(), b"");
        assert_eq!(entry.header.entry_size(), 32);
        entry.verify_checksum(&mut format).unwrap();
    }

    #[test]
    fn test_corrupted_entry_fails_verification() {
        let mut format = format();
        let mut bytes = encode_entry(&mut format, b"key1", Some(b"value1"), 16, 1, 0xFF).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0x40;

        let entry = Entry::parse(&bytes).unwrap();
        assert!(matches!(
            entry.verify_checksum(&mut format),
            Err(KvsError::DataLoss(_))
        ));
    }

    #[test]
    fn test_corrupted_header_fails_verification() {
        let mut format = format();
        let mut bytes = encode_entry(&mut format, b"key1", Some(b"value1"), 16, 1, 0xFF).unwrap();
        // Flip a transaction id bit; the checksum covers the header too.
        bytes[12] ^= 0x01;

        let entry = Entry::parse(&bytes).unwrap();
        assert!(entry.verify_checksum(&mut format).is_err());
    }

    #[test]
    fn test_checksum_less_format() {
        let mut format = EntryFormat::new(MAGIC, None);
        let bytes = encode_entry(&mut format, b"key", Some(b"val"), 16, 1, 0xFF).unwrap();
        let entry = Entry::parse(&bytes).unwrap();
        assert_eq!(entry.header.checksum, 0);
        entry.verify_checksum(&mut format).unwrap();
    }

    #[test]
    fn test_nonzero_checksum_without_algorithm_is_data_loss() {
        let mut checked = format();
        let bytes = encode_entry(&mut checked, b"key", Some(b"val"), 16, 1, 0xFF).unwrap();

        let mut unchecked = EntryFormat::new(MAGIC, None);
        let entry = Entry::parse(&bytes).unwrap();
        assert!(matches!(
            entry.verify_checksum(&mut unchecked),
            Err(KvsError::DataLoss(_))
        ));
    }

    #[test]
    fn test_key_size_limits() {
        let mut format = format();
        assert!(matches!(
            encode_entry(&mut format, b"", Some(b"v"), 16, 1, 0xFF),
            Err(KvsError::InvalidArgument(_))
        ));
        let long_key = vec![b'k'; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            encode_entry(&mut format, &long_key, Some(b"v"), 16, 1, 0xFF),
            Err(KvsError::InvalidArgument(_))
        ));
        let max_key = vec![b'k'; MAX_KEY_LENGTH];
        assert!(encode_entry(&mut format, &max_key, Some(b"v"), 16, 1, 0xFF).is_ok());
    }

    #[test]
    fn test_value_size_limit() {
        let mut format = format();
        let oversized = vec![0u8; MAX_VALUE_LENGTH + 1];
        assert!(matches!(
            encode_entry(&mut format, b"k", Some(&oversized), 16, 1, 0xFF),
            Err(KvsError::InvalidArgument(_))
        ));
        let max = vec![0u8; MAX_VALUE_LENGTH];
        let bytes = encode_entry(&mut format, b"k", Some(&max), 16, 1, 0xFF).unwrap();
        assert_eq!(bytes.len(), align_up(16 + 1 + MAX_VALUE_LENGTH, 16));
    }

    #[test]
    fn test_entry_size_matches_header_size() {
        let mut format = format();
        for (key, value) in [(&b"k"[..], &b""[..]), (b"key-number-2", b"some value here")] {
            let bytes = encode_entry(&mut format, key, Some(value), 16, 1, 0xFF).unwrap();
            let entry = Entry::parse(&bytes).unwrap();
            assert_eq!(entry.header.entry_size(), bytes.len());
            assert_eq!(
                entry_size(16, key.len(), Some(value.len())),
                bytes.len()
            );
        }
    }

    #[test]
    fn test_wider_alignment() {
        let mut format = format();
        let bytes = encode_entry(&mut format, b"key1", Some(b"value1"), 64, 3, 0xFF).unwrap();
        assert_eq!(bytes.len(), 64);
        let entry = Entry::parse(&bytes).unwrap();
        assert_eq!(entry.header.alignment_bytes(), 64);
        entry.verify_checksum(&mut format).unwrap();
    }

    #[test]
    fn test_implausible_header_detected() {
        let mut header = EntryHeader::decode(&[0u8; 16]).unwrap();
        assert!(!header.is_plausible());
        header.key_length = 65;
        assert!(!header.is_plausible());
        header.key_length = 64;
        assert!(header.is_plausible());
    }
}
