//! In-RAM index of everything on flash.
//!
//! The cache holds one [`KeyDescriptor`] per logical key: the xxh3 hash of
//! the key bytes (the key text itself is never kept in RAM), the transaction
//! id of its latest write, a valid/deleted state, and the flash address of
//! each redundant copy. Capacity is fixed at construction.

use crate::error::{KvsError, Result};
use tracing::warn;

/// Hash key bytes into the 64-bit digest descriptors are indexed by.
pub fn key_hash(key: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(key)
}

/// Whether the latest entry for a key is a value or a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Valid,
    Deleted,
}

/// In-memory summary of one logical key.
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub key_hash: u64,
    pub transaction_id: u32,
    pub state: EntryState,
    addresses: Vec<u32>,
}

impl KeyDescriptor {
    pub fn new(key_hash: u64, transaction_id: u32, state: EntryState) -> Self {
        Self {
            key_hash,
            transaction_id,
            state,
            addresses: Vec::new(),
        }
    }

    /// Flash addresses of the redundant copies, in recording order.
    pub fn addresses(&self) -> &[u32] {
        &self.addresses
    }

    /// Address reads are served from first.
    pub fn first_address(&self) -> u32 {
        self.addresses[0]
    }
}

/// Outcome of [`EntryCache::add_new_or_update_existing`], telling the caller
/// how sector accounting must change.
#[derive(Debug, PartialEq, Eq)]
pub enum CacheUpdate {
    /// First sighting of this hash.
    AddedNew,
    /// The incoming entry superseded the descriptor; the returned addresses
    /// are now stale copies.
    Superseded { stale: Vec<u32> },
    /// Same transaction id: another copy of the current entry was recorded.
    AddedRedundantCopy,
    /// Redundancy already satisfied; the extra copy was not recorded.
    CopyCapped,
    /// The incoming entry is older than the descriptor; its address is stale.
    IgnoredOlderCopy,
}

/// Capacity-bounded descriptor index. Lookup is a linear scan over a
/// pre-allocated Vec.
pub struct EntryCache {
    max_entries: usize,
    redundancy: usize,
    sector_size: usize,
    descriptors: Vec<KeyDescriptor>,
}

impl EntryCache {
    pub fn new(max_entries: usize, redundancy: usize, sector_size: usize) -> Self {
        assert!(redundancy >= 1);
        Self {
            max_entries,
            redundancy,
            sector_size,
            descriptors: Vec::with_capacity(max_entries),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.descriptors.len() >= self.max_entries
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    /// Look up a descriptor by key hash, valid or deleted.
    pub fn find(&self, hash: u64) -> Option<&KeyDescriptor> {
        self.descriptors.iter().find(|d| d.key_hash == hash)
    }

    pub fn find_mut(&mut self, hash: u64) -> Option<&mut KeyDescriptor> {
        self.descriptors.iter_mut().find(|d| d.key_hash == hash)
    }

    /// Look up a descriptor by key hash, ignoring tombstones. This is the
    /// lookup `get` uses.
    pub fn find_existing(&self, hash: u64) -> Option<&KeyDescriptor> {
        self.find(hash).filter(|d| d.state == EntryState::Valid)
    }

    /// Insert a brand-new descriptor with one address.
    pub fn add_new(&mut self, mut descriptor: KeyDescriptor, address: u32) -> Result<()> {
        if self.at_capacity() {
            return Err(KvsError::ResourceExhausted(format!(
                "entry cache full ({} entries)",
                self.max_entries
            )));
        }
        descriptor.addresses.clear();
        descriptor.addresses.push(address);
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Reconcile one decoded entry against the index.
    ///
    /// Higher transaction ids win; equal ids are redundant copies of the same
    /// write. Two copies of one entry in the same sector means something
    /// rewrote flash without an erase, which is reported as data loss.
    pub fn add_new_or_update_existing(
        &mut self,
        descriptor: KeyDescriptor,
        address: u32,
    ) -> Result<CacheUpdate> {
        let sector_size = self.sector_size;
        let redundancy = self.redundancy;
        let Some(index) = self
            .descriptors
            .iter()
            .position(|d| d.key_hash == descriptor.key_hash)
        else {
            self.add_new(descriptor, address)?;
            return Ok(CacheUpdate::AddedNew);
        };
        let existing = &mut self.descriptors[index];

        if descriptor.transaction_id > existing.transaction_id {
            let stale = std::mem::take(&mut existing.addresses);
            existing.transaction_id = descriptor.transaction_id;
            existing.state = descriptor.state;
            existing.addresses.push(address);
            return Ok(CacheUpdate::Superseded { stale });
        }

        if descriptor.transaction_id < existing.transaction_id {
            return Ok(CacheUpdate::IgnoredOlderCopy);
        }

        // Same transaction id: a redundant copy of the entry we already know.
        let sector = address as usize / sector_size;
        if existing
            .addresses
            .iter()
            .any(|&a| a as usize / sector_size == sector)
        {
            warn!(
                key_hash = descriptor.key_hash,
                address, "redundant copy recorded in an already-used sector"
            );
            return Err(KvsError::DataLoss(format!(
                "two copies of entry {:#x} share sector {}",
                descriptor.key_hash, sector
            )));
        }
        if existing.addresses.len() >= redundancy {
            return Ok(CacheUpdate::CopyCapped);
        }
        existing.addresses.push(address);
        Ok(CacheUpdate::AddedRedundantCopy)
    }

    /// Swap one recorded copy address for its relocation target.
    pub fn replace_address(&mut self, hash: u64, old: u32, new: u32) {
        if let Some(descriptor) = self.find_mut(hash) {
            if let Some(slot) = descriptor.addresses.iter_mut().find(|a| **a == old) {
                *slot = new;
            }
        }
    }

    /// Drop a copy address (e.g. a copy that failed verification).
    pub fn remove_address(&mut self, hash: u64, address: u32) {
        if let Some(descriptor) = self.find_mut(hash) {
            descriptor.addresses.retain(|&a| a != address);
        }
    }

    /// Drop a descriptor entirely. Used when every copy of an entry has been
    /// lost to corruption.
    pub fn remove_key(&mut self, hash: u64) {
        self.descriptors.retain(|d| d.key_hash != hash);
    }

    /// Remove every tombstoned descriptor, returning them so the caller can
    /// reclaim their flash bytes. Only maintenance calls this; `delete`
    /// leaves descriptors in place so the tombstone stays addressable.
    pub fn remove_deleted_keys(&mut self) -> Vec<KeyDescriptor> {
        let mut removed = Vec::new();
        self.descriptors.retain(|d| {
            if d.state == EntryState::Deleted {
                removed.push(d.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Iterate descriptors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.descriptors.iter()
    }

    /// Clear all descriptors, e.g. before a re-initialization scan.
    pub fn reset(&mut self) {
        self.descriptors.clear();
    }
}
