//! Pluggable entry checksums.
//!
//! An [`EntryFormat`](crate::entry::EntryFormat) optionally carries a
//! checksum algorithm. The on-flash header reserves 4 bytes for checksum
//! state; algorithms with wider state are truncated to their first 4 bytes
//! when stored and verified.

use crate::error::{KvsError, Result};

/// Number of checksum bytes the entry header can hold.
pub const CHECKSUM_FIELD_SIZE: usize = 4;

/// Streaming checksum over an entry's bytes.
///
/// The store drives the algorithm as `reset` → `update`* → `finish`, then
/// either copies the state into the header or compares it against a stored
/// candidate with `verify`.
pub trait ChecksumAlgorithm {
    /// Clear internal state for a new calculation.
    fn reset(&mut self);

    /// Feed a chunk of entry bytes.
    fn update(&mut self, data: &[u8]);

    /// Finalize and expose the state bytes.
    fn finish(&mut self) -> &[u8];

    /// Finalize and compare against `candidate`.
    ///
    /// Only the first [`CHECKSUM_FIELD_SIZE`] bytes participate; wider state
    /// cannot round-trip through the header field.
    fn verify(&mut self, candidate: &[u8]) -> Result<()> {
        let state = self.finish();
        let len = state.len().min(CHECKSUM_FIELD_SIZE).min(candidate.len());
        if state[..len] == candidate[..len] {
            Ok(())
        } else {
            Err(KvsError::DataLoss("entry checksum mismatch".into()))
        }
    }
}

/// CRC32 (IEEE) entry checksum, the default algorithm.
#[derive(Default)]
pub struct ChecksumCrc32 {
    hasher: crc32fast::Hasher,
    state: [u8; 4],
}

impl ChecksumCrc32 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChecksumAlgorithm for ChecksumCrc32 {
    fn reset(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finish(&mut self) -> &[u8] {
        let crc = self.hasher.clone().finalize();
        self.state = crc.to_le_bytes();
        &self.state
    }
}
