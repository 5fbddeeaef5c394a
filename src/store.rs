//! The key-value store orchestrator.
//!
//! [`KeyValueStore`] ties the entry codec, the entry cache, and the sector
//! map together over one block device. All operations are synchronous and
//! take `&mut self`; a store instance has a single logical owner.
//!
//! ## Write path
//! `put` serializes the entry in the primary format, reserves one address
//! per redundant copy in distinct sectors (garbage-collecting per policy if
//! space is short), writes and optionally verifies each copy, and only then
//! updates the cache. A crash between copies leaves flash states the next
//! `init` scan reconciles by transaction id.
//!
//! ## Recovery
//! `init` scans every sector from its start, decoding entries until it hits
//! erased flash. Checksum failures are skipped and reported without aborting
//! the scan; header corruption quarantines the sector until it is erased.

use crate::cache::{key_hash, CacheUpdate, EntryCache, EntryState, KeyDescriptor};
use crate::config::{Config, ErrorRecovery, GarbageCollectOnWrite};
use crate::entry::{
    self, encode_entry, Entry, EntryFormat, EntryHeader, HEADER_SIZE, MAX_KEY_LENGTH,
    MAX_VALUE_LENGTH,
};
use crate::error::{KvsError, Result};
use crate::flash::BlockDevice;
use crate::sectors::{SectorMap, StorageStats, GC_USAGE_THRESHOLD};
use tracing::{debug, info, warn};

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Constructed but not yet scanned; all operations are rejected.
    NotInitialized,
    /// Fully operational.
    Ready,
    /// Invariant violations were found and repair was deferred. Reads work;
    /// writes are rejected until a maintenance pass succeeds.
    NeedsMaintenance,
}

/// One row of the store-level iteration: the cached summary of a key.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub key_hash: u64,
    pub transaction_id: u32,
    pub state: EntryState,
    pub address: u32,
}

/// Flash-resident key-value store.
pub struct KeyValueStore<D: BlockDevice> {
    device: D,
    formats: Vec<EntryFormat>,
    config: Config,
    cache: EntryCache,
    sectors: SectorMap,
    alignment: usize,
    state: StoreState,
    last_transaction_id: u32,
}

impl<D: BlockDevice> KeyValueStore<D> {
    /// Create a store over `device` recognizing `formats` (first is primary
    /// and used for all new writes). Nothing is read until [`init`].
    ///
    /// [`init`]: KeyValueStore::init
    pub fn new(device: D, formats: Vec<EntryFormat>, config: Config) -> Result<Self> {
        if formats.is_empty() {
            return Err(KvsError::InvalidArgument(
                "at least one entry format is required".into(),
            ));
        }
        if config.redundancy < 1 || config.redundancy > device.sector_count() {
            return Err(KvsError::InvalidArgument(format!(
                "redundancy {} not supported by {} sectors",
                config.redundancy,
                device.sector_count()
            )));
        }
        if device.sector_count() < 2 {
            return Err(KvsError::InvalidArgument(
                "at least two sectors are required to keep one erased".into(),
            ));
        }

        let alignment = entry::align_up(device.alignment_bytes().max(16), 16);
        if alignment % device.alignment_bytes() != 0
            || device.sector_size_bytes() % alignment != 0
            || alignment / 16 > 256
        {
            return Err(KvsError::InvalidArgument(format!(
                "device alignment {} incompatible with entry alignment",
                device.alignment_bytes()
            )));
        }

        let cache = EntryCache::new(
            config.max_entries,
            config.redundancy,
            device.sector_size_bytes(),
        );
        let sectors = SectorMap::new(device.sector_size_bytes(), device.sector_count());
        Ok(Self {
            device,
            formats,
            config,
            cache,
            sectors,
            alignment,
            state: StoreState::NotInitialized,
            last_transaction_id: 0,
        })
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Scan the whole region and rebuild the cache and sector accounting.
    ///
    /// Duplicate hashes are reconciled by transaction id, so the latest write
    /// of each key wins over its own older copies. Returns `DataLoss` when
    /// corrupt entries were skipped; the store is still usable, minus the
    /// lost data. No-op when already initialized.
    pub fn init(&mut self) -> Result<()> {
        if self.state != StoreState::NotInitialized {
            return Ok(());
        }

        let mut scan_errors = 0usize;
        for sector in 0..self.sectors.sector_count() {
            scan_errors += self.scan_sector(sector)?;
        }

        self.state = StoreState::Ready;
        info!(
            entries = self.cache.len(),
            last_transaction_id = self.last_transaction_id,
            scan_errors,
            "store initialized"
        );

        if self.check_for_errors() {
            if self.config.error_recovery == ErrorRecovery::Immediate {
                if let Err(err) = self.full_maintenance() {
                    warn!(%err, "automatic repair after init failed");
                }
            }
            self.refresh_state();
        }

        if scan_errors > 0 {
            return Err(KvsError::DataLoss(format!(
                "{scan_errors} corrupt entries skipped during scan"
            )));
        }
        Ok(())
    }

    /// Decode one sector's written region into the cache. Returns the number
    /// of corrupt entries encountered.
    fn scan_sector(&mut self, sector: usize) -> Result<usize> {
        let sector_size = self.sectors.sector_size();
        let start = self.sectors.start_address(sector);
        let erased = self.device.erased_byte();
        let mut errors = 0usize;
        let mut offset = 0usize;

        while offset + HEADER_SIZE <= sector_size {
            let address = start + offset as u32;
            let mut header_bytes = [0u8; HEADER_SIZE];
            self.device.read(address, &mut header_bytes)?;
            if header_bytes.iter().all(|&b| b == erased) {
                // End of the written region.
                break;
            }

            let header = EntryHeader::decode(&header_bytes)?;
            let recognized = self.format_index(header.magic).is_some();
            if !recognized || !header.is_plausible() || offset + header.entry_size() > sector_size
            {
                // The size fields cannot be trusted, so the rest of the
                // sector cannot be walked. Unrecognized data is sector-local
                // damage, never fatal to the whole store.
                warn!(sector, address, "corrupt entry header, quarantining sector");
                self.sectors.quarantine(sector);
                errors += 1;
                break;
            }

            let size = header.entry_size();
            let mut bytes = vec![0u8; size];
            self.device.read(address, &mut bytes)?;

            let checked = if self.config.verify_on_read {
                self.verify_bytes(&bytes)
            } else {
                Ok(())
            };
            match checked {
                Err(err) => {
                    warn!(sector, address, %err, "skipping corrupt entry");
                    self.sectors.record_reclaimable(sector, size);
                    errors += 1;
                }
                Ok(()) => {
                    let parsed = Entry::parse(&bytes)?;
                    let hash = key_hash(parsed.key());
                    let entry_state = if parsed.header.is_tombstone() {
                        EntryState::Deleted
                    } else {
                        EntryState::Valid
                    };
                    let transaction_id = parsed.header.transaction_id;
                    let descriptor = KeyDescriptor::new(hash, transaction_id, entry_state);
                    match self.cache.add_new_or_update_existing(descriptor, address) {
                        Ok(CacheUpdate::AddedNew) | Ok(CacheUpdate::AddedRedundantCopy) => {
                            self.sectors.record_write(sector, size);
                        }
                        Ok(CacheUpdate::Superseded { stale }) => {
                            self.sectors.record_write(sector, size);
                            for stale_address in stale {
                                self.mark_entry_stale(stale_address);
                            }
                        }
                        Ok(CacheUpdate::CopyCapped) | Ok(CacheUpdate::IgnoredOlderCopy) => {
                            self.sectors.record_reclaimable(sector, size);
                        }
                        Err(KvsError::DataLoss(err)) => {
                            warn!(sector, address, %err, "rejected duplicate copy");
                            self.sectors.record_reclaimable(sector, size);
                            errors += 1;
                        }
                        Err(err) => return Err(err),
                    }
                    self.last_transaction_id = self.last_transaction_id.max(transaction_id);
                }
            }
            offset += size;
        }
        Ok(errors)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Read the value for `key` into `buffer`, starting at the value's
    /// beginning. Returns the number of bytes read.
    pub fn get(&mut self, key: &str, buffer: &mut [u8]) -> Result<usize> {
        self.get_at(key, 0, buffer)
    }

    /// Read the value for `key` into `buffer`, starting `offset` bytes into
    /// the value.
    ///
    /// When `buffer` cannot hold the remaining bytes, as many bytes as fit
    /// are copied and `ResourceExhausted` is returned.
    pub fn get_at(&mut self, key: &str, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        self.require_initialized()?;
        let key = Self::checked_key(key)?;
        let hash = key_hash(key);
        let Some(descriptor) = self.cache.find_existing(hash) else {
            return Err(KvsError::NotFound);
        };

        // Try every redundant copy before giving up.
        let addresses: Vec<u32> = descriptor.addresses().to_vec();
        for (i, address) in addresses.iter().copied().enumerate() {
            let bytes = match self.read_checked(address) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(address, copy = i, %err, "copy unreadable, trying next");
                    continue;
                }
            };
            let parsed = Entry::parse(&bytes)?;
            if parsed.key() != key {
                return Err(KvsError::AlreadyExists);
            }
            let value = parsed.value();
            if offset > value.len() {
                return Err(KvsError::InvalidArgument(format!(
                    "offset {} beyond value length {}",
                    offset,
                    value.len()
                )));
            }
            let remaining = value.len() - offset;
            let n = remaining.min(buffer.len());
            buffer[..n].copy_from_slice(&value[offset..offset + n]);
            if n < remaining {
                return Err(KvsError::ResourceExhausted(format!(
                    "buffer holds {n} of {remaining} value bytes"
                )));
            }
            return Ok(n);
        }
        Err(KvsError::DataLoss(format!(
            "no readable copy of key hash {hash:#x}"
        )))
    }

    /// Size of the value stored for `key`.
    pub fn value_size(&mut self, key: &str) -> Result<usize> {
        self.require_initialized()?;
        let key = Self::checked_key(key)?;
        let hash = key_hash(key);
        let Some(descriptor) = self.cache.find_existing(hash) else {
            return Err(KvsError::NotFound);
        };
        let addresses: Vec<u32> = descriptor.addresses().to_vec();
        for address in addresses {
            if let Ok(bytes) = self.read_checked(address) {
                let parsed = Entry::parse(&bytes)?;
                if parsed.key() != key {
                    return Err(KvsError::AlreadyExists);
                }
                return Ok(parsed.header.value_length());
            }
        }
        Err(KvsError::DataLoss(format!(
            "no readable copy of key hash {hash:#x}"
        )))
    }

    /// Whether `key` currently has a value.
    pub fn contains(&mut self, key: &str) -> Result<bool> {
        match self.value_size(key) {
            Ok(_) => Ok(true),
            Err(KvsError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store `value` under `key`, superseding any previous value.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.require_writable()?;
        let key = Self::checked_key(key)?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(KvsError::InvalidArgument(format!(
                "value length {} exceeds {}",
                value.len(),
                MAX_VALUE_LENGTH
            )));
        }
        let entry_len = entry::entry_size(self.alignment, key.len(), Some(value.len()));
        if entry_len > self.sectors.sector_size() {
            return Err(KvsError::InvalidArgument(format!(
                "entry of {} bytes exceeds sector size {}",
                entry_len,
                self.sectors.sector_size()
            )));
        }

        let hash = key_hash(key);
        match self.cache.find(hash) {
            Some(descriptor) => {
                let addresses: Vec<u32> = descriptor.addresses().to_vec();
                self.check_key_matches(&addresses, key)?;
            }
            None => {
                if self.cache.at_capacity() {
                    return Err(KvsError::ResourceExhausted(format!(
                        "entry cache full ({} entries)",
                        self.config.max_entries
                    )));
                }
            }
        }
        self.write_entry(hash, key, Some(value))
    }

    /// Record a deletion for `key` by writing a tombstone.
    ///
    /// The cache keeps the tombstoned descriptor until maintenance reclaims
    /// it, so a crash right after the tombstone write can never resurrect
    /// the key.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.require_writable()?;
        let key = Self::checked_key(key)?;
        let hash = key_hash(key);
        let Some(descriptor) = self.cache.find(hash) else {
            return Err(KvsError::NotFound);
        };
        if descriptor.state == EntryState::Deleted {
            return Err(KvsError::NotFound);
        }
        let addresses: Vec<u32> = descriptor.addresses().to_vec();
        self.check_key_matches(&addresses, key)?;
        self.write_entry(hash, key, None)
    }

    /// Serialize and write one entry (value or tombstone) with a fresh
    /// transaction id, then update the cache.
    fn write_entry(&mut self, hash: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let transaction_id = self.last_transaction_id + 1;
        let erased = self.device.erased_byte();
        let bytes = encode_entry(
            &mut self.formats[0],
            key,
            value,
            self.alignment,
            transaction_id,
            erased,
        )?;

        let addresses = self.reserve_addresses(bytes.len())?;
        let mut written = Vec::with_capacity(addresses.len());
        let mut failed = 0usize;
        for &address in &addresses {
            let sector = self.sectors.sector_of(address);
            if let Err(err) = self.device.write(address, &bytes) {
                // The flash state past this point is unknown; stop using the
                // sector until it is erased.
                warn!(address, %err, "device write failed");
                self.sectors.mark_stale(sector, bytes.len());
                self.sectors.quarantine(sector);
                failed += 1;
                continue;
            }
            if self.config.verify_on_write {
                let reread = self
                    .read_entry_raw(address)
                    .and_then(|bytes| self.verify_bytes(&bytes));
                if let Err(err) = reread {
                    warn!(address, %err, "entry copy failed verification");
                    self.sectors.mark_stale(sector, bytes.len());
                    failed += 1;
                    continue;
                }
            }
            written.push(address);
        }
        if written.is_empty() {
            return Err(KvsError::DataLoss(
                "every copy of the entry failed to write".into(),
            ));
        }

        // Cache update comes last: a crash before this point is resolved by
        // the next init scan, which finds the new copies and reconciles by
        // transaction id.
        let entry_state = match value {
            Some(_) => EntryState::Valid,
            None => EntryState::Deleted,
        };
        for &address in &written {
            let descriptor = KeyDescriptor::new(hash, transaction_id, entry_state);
            if let CacheUpdate::Superseded { stale } =
                self.cache.add_new_or_update_existing(descriptor, address)?
            {
                for stale_address in stale {
                    self.mark_entry_stale(stale_address);
                }
            }
        }
        self.last_transaction_id = transaction_id;
        debug!(
            key_hash = hash,
            transaction_id,
            copies = written.len(),
            tombstone = value.is_none(),
            "entry written"
        );

        if failed > 0 {
            return Err(KvsError::DataLoss(format!(
                "{failed} of {} copies failed write verification",
                addresses.len()
            )));
        }
        Ok(())
    }

    /// Reserve one write address per redundant copy, each in a distinct
    /// sector, garbage collecting per the configured policy when space runs
    /// short.
    fn reserve_addresses(&mut self, entry_len: usize) -> Result<Vec<u32>> {
        let redundancy = self.config.redundancy;
        let mut reserved_sectors: Vec<usize> = Vec::with_capacity(redundancy);
        let mut addresses: Vec<u32> = Vec::with_capacity(redundancy);
        let mut collected = 0usize;
        let gc_limit = match self.config.gc_on_write {
            GarbageCollectOnWrite::Disabled => 0,
            GarbageCollectOnWrite::OneSector => 1,
            GarbageCollectOnWrite::AsManySectorsNeeded => usize::MAX,
        };

        let result = loop {
            if addresses.len() == redundancy {
                break Ok(());
            }
            match self
                .sectors
                .pick_write_sector(entry_len, &reserved_sectors, false)
            {
                Ok(sector) => {
                    let address = self.sectors.write_address(sector);
                    self.sectors.record_write(sector, entry_len);
                    reserved_sectors.push(sector);
                    addresses.push(address);
                }
                Err(err) => {
                    if collected >= gc_limit {
                        break Err(err);
                    }
                    let target = self
                        .sectors
                        .pick_gc_sector(&reserved_sectors, false)
                        .or_else(|| self.sectors.pick_gc_sector(&reserved_sectors, true));
                    let Some(target) = target else {
                        break Err(err);
                    };
                    if let Err(err) = self.evacuate_sector(target, &addresses, false) {
                        break Err(err);
                    }
                    collected += 1;
                }
            }
        };

        match result {
            Ok(()) => Ok(addresses),
            Err(err) => {
                // Nothing was written yet; hand the reserved space back.
                for &sector in &reserved_sectors {
                    self.sectors.release_reservation(sector, entry_len);
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // Garbage collection & maintenance
    // =========================================================================

    /// Relocate every cache-addressed entry out of `target`, then erase it.
    ///
    /// `reserved_addresses` are copies of an in-flight write that are not in
    /// the cache yet; their sectors are protected. With `drop_unreadable`,
    /// entries whose last copy cannot be read are dropped from the cache
    /// instead of failing the evacuation (repair path).
    fn evacuate_sector(
        &mut self,
        target: usize,
        reserved_addresses: &[u32],
        drop_unreadable: bool,
    ) -> Result<()> {
        debug!(target, "evacuating sector");
        let victims: Vec<(u64, u32)> = self
            .cache
            .iter()
            .flat_map(|d| {
                d.addresses()
                    .iter()
                    .copied()
                    .filter(|&a| self.sectors.sector_of(a) == target)
                    .map(move |a| (d.key_hash, a))
            })
            .collect();

        let mut reserved_sectors: Vec<usize> = reserved_addresses
            .iter()
            .map(|&a| self.sectors.sector_of(a))
            .collect();
        reserved_sectors.push(target);

        for (hash, address) in victims {
            self.relocate_entry(hash, address, &reserved_sectors, drop_unreadable)?;
        }

        self.device.erase(target, 1)?;
        self.sectors.mark_erased(target);
        Ok(())
    }

    /// Move one entry copy out of a sector about to be erased.
    ///
    /// The copy is verified before relocation so rot never propagates; the
    /// relocated bytes keep their format and transaction id. The destination
    /// excludes the sectors of the descriptor's other copies.
    fn relocate_entry(
        &mut self,
        hash: u64,
        address: u32,
        reserved_sectors: &[usize],
        drop_unreadable: bool,
    ) -> Result<()> {
        let bytes = match self.read_verified(address) {
            Ok(bytes) => bytes,
            Err(err) => {
                let copies = self
                    .cache
                    .find(hash)
                    .map(|d| d.addresses().len())
                    .unwrap_or(0);
                if copies > 1 {
                    warn!(address, %err, "dropping unreadable redundant copy");
                    self.cache.remove_address(hash, address);
                    return Ok(());
                }
                if drop_unreadable {
                    warn!(key_hash = hash, address, %err, "last copy unreadable, key lost");
                    self.cache.remove_key(hash);
                    return Ok(());
                }
                return Err(err);
            }
        };

        let mut exclusions = reserved_sectors.to_vec();
        if let Some(descriptor) = self.cache.find(hash) {
            for &a in descriptor.addresses() {
                if a != address {
                    exclusions.push(self.sectors.sector_of(a));
                }
            }
        }

        let len = bytes.len();
        let sector = self.sectors.pick_write_sector(len, &exclusions, true)?;
        let new_address = self.sectors.write_address(sector);
        self.sectors.record_write(sector, len);
        if let Err(err) = self.device.write(new_address, &bytes) {
            self.sectors.mark_stale(sector, len);
            self.sectors.quarantine(sector);
            return Err(err);
        }
        if self.config.verify_on_write {
            if let Err(err) = self
                .read_entry_raw(new_address)
                .and_then(|bytes| self.verify_bytes(&bytes))
            {
                self.sectors.mark_stale(sector, len);
                return Err(err);
            }
        }
        self.cache.replace_address(hash, address, new_address);
        self.sectors.mark_stale(self.sectors.sector_of(address), len);
        debug!(address, new_address, "entry relocated");
        Ok(())
    }

    /// Reclaim the best garbage-collection candidate sector.
    pub fn garbage_collect(&mut self) -> Result<()> {
        self.require_initialized()?;
        let include_live = self.sectors.usage_ratio() > GC_USAGE_THRESHOLD;
        let target = self
            .sectors
            .pick_gc_sector(&[], include_live)
            .ok_or_else(|| KvsError::ResourceExhausted("no sector worth collecting".into()))?;
        self.evacuate_sector(target, &[], false)
    }

    /// Restore the free-sector invariant by collecting the best candidate.
    fn ensure_free_sector_exists(&mut self) -> Result<()> {
        if self.sectors.empty_sector_count() > 0 {
            return Ok(());
        }
        let target = self
            .sectors
            .pick_gc_sector(&[], false)
            .or_else(|| self.sectors.pick_gc_sector(&[], true))
            .ok_or_else(|| {
                KvsError::ResourceExhausted("cannot produce a free sector".into())
            })?;
        self.evacuate_sector(target, &[], false)
    }

    /// Rewrite additional copies for one under-replicated entry.
    fn restore_redundancy(&mut self, hash: u64) -> Result<()> {
        let Some(descriptor) = self.cache.find(hash) else {
            return Ok(());
        };
        let addresses: Vec<u32> = descriptor.addresses().to_vec();
        let missing = self.config.redundancy.saturating_sub(addresses.len());
        if missing == 0 {
            return Ok(());
        }

        let mut bytes = None;
        for &address in &addresses {
            if let Ok(read) = self.read_verified(address) {
                bytes = Some(read);
                break;
            }
        }
        let Some(bytes) = bytes else {
            return Err(KvsError::DataLoss(format!(
                "no readable copy of key hash {hash:#x} to replicate"
            )));
        };

        let mut exclusions: Vec<usize> =
            addresses.iter().map(|&a| self.sectors.sector_of(a)).collect();
        for _ in 0..missing {
            let sector = self.sectors.pick_write_sector(bytes.len(), &exclusions, false)?;
            let new_address = self.sectors.write_address(sector);
            self.sectors.record_write(sector, bytes.len());
            if let Err(err) = self.device.write(new_address, &bytes) {
                self.sectors.mark_stale(sector, bytes.len());
                self.sectors.quarantine(sector);
                return Err(err);
            }
            if self.config.verify_on_write {
                if let Err(err) = self
                    .read_entry_raw(new_address)
                    .and_then(|bytes| self.verify_bytes(&bytes))
                {
                    self.sectors.mark_stale(sector, bytes.len());
                    return Err(err);
                }
            }
            let header = EntryHeader::decode(&bytes)?;
            let entry_state = if header.is_tombstone() {
                EntryState::Deleted
            } else {
                EntryState::Valid
            };
            let descriptor = KeyDescriptor::new(hash, header.transaction_id, entry_state);
            self.cache.add_new_or_update_existing(descriptor, new_address)?;
            exclusions.push(sector);
        }
        debug!(key_hash = hash, missing, "entry redundancy restored");
        Ok(())
    }

    /// One bounded unit of repair or reclamation. Returns whether any work
    /// was done.
    fn maintenance_step(&mut self, reclaim_live: bool) -> Result<bool> {
        if let Some(&sector) = self.sectors.quarantined_sectors().first() {
            self.evacuate_sector(sector, &[], true)?;
            return Ok(true);
        }
        if self.sectors.empty_sector_count() == 0 {
            self.ensure_free_sector_exists()?;
            return Ok(true);
        }
        let under_replicated = self
            .cache
            .iter()
            .find(|d| d.addresses().len() < self.config.redundancy)
            .map(|d| d.key_hash);
        if let Some(hash) = under_replicated {
            self.restore_redundancy(hash)?;
            return Ok(true);
        }
        let include_live = reclaim_live || self.sectors.usage_ratio() > GC_USAGE_THRESHOLD;
        if let Some(target) = self.sectors.pick_gc_sector(&[], include_live) {
            self.evacuate_sector(target, &[], false)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Perform one bounded unit of maintenance. Returns whether anything was
    /// repaired or reclaimed.
    pub fn partial_maintenance(&mut self) -> Result<bool> {
        self.require_initialized()?;
        let worked = self.maintenance_step(false)?;
        self.refresh_state();
        Ok(worked)
    }

    /// Repeat maintenance until nothing is left to do, leaving sectors that
    /// are mostly live data alone unless overall usage is past the
    /// threshold.
    pub fn full_maintenance(&mut self) -> Result<()> {
        self.require_initialized()?;
        while self.maintenance_step(false)? {}
        self.refresh_state();
        Ok(())
    }

    /// Reclaim every sector holding any reclaimable bytes, then drop
    /// tombstoned keys from the cache and reclaim their entries too.
    ///
    /// Tombstones are only removed after the reclaim pass has erased all
    /// superseded copies, so no older value of a deleted key can survive the
    /// tombstone on flash.
    pub fn heavy_maintenance(&mut self) -> Result<()> {
        self.require_initialized()?;
        while self.maintenance_step(true)? {}

        let removed = self.cache.remove_deleted_keys();
        if !removed.is_empty() {
            info!(keys = removed.len(), "removing tombstoned keys");
            for descriptor in removed {
                for &address in descriptor.addresses() {
                    self.mark_entry_stale(address);
                }
            }
            while self.maintenance_step(true)? {}
        }
        self.refresh_state();
        Ok(())
    }

    /// Rewrite every entry still encoded in a secondary format using the
    /// primary format. Returns the number of migrated entries.
    pub fn update_entries_to_primary_format(&mut self) -> Result<usize> {
        self.require_writable()?;
        let primary_magic = self.formats[0].magic;
        let snapshot: Vec<(u64, u32)> = self
            .cache
            .iter()
            .map(|d| (d.key_hash, d.first_address()))
            .collect();

        let mut migrated = 0usize;
        for (hash, address) in snapshot {
            let bytes = self.read_verified(address)?;
            let parsed = Entry::parse(&bytes)?;
            if parsed.header.magic == primary_magic {
                continue;
            }
            let key = parsed.key().to_vec();
            let value = if parsed.header.is_tombstone() {
                None
            } else {
                Some(parsed.value().to_vec())
            };
            self.write_entry(hash, &key, value.as_deref())?;
            migrated += 1;
        }
        if migrated > 0 {
            info!(migrated, "entries rewritten in primary format");
        }
        Ok(migrated)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Number of live (non-deleted) keys.
    pub fn len(&self) -> usize {
        self.cache
            .iter()
            .filter(|d| d.state == EntryState::Valid)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The transaction id of the most recent write.
    pub fn transaction_count(&self) -> u32 {
        self.last_transaction_id
    }

    /// Cached summaries of all present keys, in cache insertion order.
    pub fn entries(&self) -> impl Iterator<Item = EntryInfo> + '_ {
        self.cache.iter().map(|d| EntryInfo {
            key_hash: d.key_hash,
            transaction_id: d.transaction_id,
            state: d.state,
            address: d.first_address(),
        })
    }

    /// Aggregate sector usage report.
    pub fn stats(&self) -> StorageStats {
        self.sectors.stats()
    }

    /// Borrow the underlying block device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutably borrow the underlying block device.
    ///
    /// Intended for tests and host-side tooling (fault injection, image
    /// capture). Mutating flash behind the store's back invalidates its
    /// accounting; reads remain safe, but re-run [`init`] on a fresh store
    /// before trusting writes again.
    ///
    /// [`init`]: KeyValueStore::init
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn require_initialized(&self) -> Result<()> {
        if self.state == StoreState::NotInitialized {
            return Err(KvsError::FailedPrecondition("store not initialized"));
        }
        Ok(())
    }

    /// Writes need a `Ready` store; deferred-repair policies get one chance
    /// to fix things up here.
    fn require_writable(&mut self) -> Result<()> {
        self.require_initialized()?;
        if self.state == StoreState::NeedsMaintenance
            && self.config.error_recovery != ErrorRecovery::Manual
        {
            if let Err(err) = self.full_maintenance() {
                warn!(%err, "deferred repair failed");
            }
        }
        if self.state != StoreState::Ready {
            return Err(KvsError::FailedPrecondition(
                "store needs maintenance before accepting writes",
            ));
        }
        Ok(())
    }

    fn refresh_state(&mut self) {
        if self.state != StoreState::NotInitialized {
            self.state = if self.check_for_errors() {
                StoreState::NeedsMaintenance
            } else {
                StoreState::Ready
            };
        }
    }

    /// Anything maintenance would need to fix?
    fn check_for_errors(&self) -> bool {
        self.sectors.empty_sector_count() == 0
            || self.sectors.has_quarantined_sectors()
            || self
                .cache
                .iter()
                .any(|d| d.addresses().len() < self.config.redundancy)
    }

    fn checked_key(key: &str) -> Result<&[u8]> {
        let bytes = key.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_KEY_LENGTH {
            return Err(KvsError::InvalidArgument(format!(
                "key length {} outside 1..={}",
                bytes.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(bytes)
    }

    fn format_index(&self, magic: u32) -> Option<usize> {
        self.formats.iter().position(|f| f.magic == magic)
    }

    /// Compare the key bytes stored at the first readable copy against
    /// `key`; a mismatch is a hash collision.
    fn check_key_matches(&mut self, addresses: &[u32], key: &[u8]) -> Result<()> {
        for &address in addresses {
            match self.read_entry_raw(address) {
                Ok(bytes) => {
                    let parsed = Entry::parse(&bytes)?;
                    return if parsed.key() == key {
                        Ok(())
                    } else {
                        Err(KvsError::AlreadyExists)
                    };
                }
                Err(_) => continue,
            }
        }
        Ok(())
    }

    /// Read a whole entry's raw bytes, validating only the header structure.
    fn read_entry_raw(&mut self, address: u32) -> Result<Vec<u8>> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.device.read(address, &mut header_bytes)?;
        let header = EntryHeader::decode(&header_bytes)?;
        if self.format_index(header.magic).is_none() || !header.is_plausible() {
            return Err(KvsError::DataLoss(format!(
                "unrecognized or corrupt entry header at {address:#x}"
            )));
        }
        let size = header.entry_size();
        let sector = self.sectors.sector_of(address);
        let sector_end = self.sectors.start_address(sector) as usize + self.sectors.sector_size();
        if address as usize + size > sector_end {
            return Err(KvsError::DataLoss(format!(
                "entry at {address:#x} runs past its sector"
            )));
        }
        let mut bytes = vec![0u8; size];
        self.device.read(address, &mut bytes)?;
        Ok(bytes)
    }

    /// Read an entry, verifying per the `verify_on_read` setting.
    fn read_checked(&mut self, address: u32) -> Result<Vec<u8>> {
        let bytes = self.read_entry_raw(address)?;
        if self.config.verify_on_read {
            self.verify_bytes(&bytes)?;
        }
        Ok(bytes)
    }

    /// Read an entry, always verifying (relocation and migration paths).
    fn read_verified(&mut self, address: u32) -> Result<Vec<u8>> {
        let bytes = self.read_entry_raw(address)?;
        self.verify_bytes(&bytes)?;
        Ok(bytes)
    }

    fn verify_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let parsed = Entry::parse(bytes)?;
        let index = self.format_index(parsed.header.magic).ok_or_else(|| {
            KvsError::DataLoss(format!("unrecognized magic {:#x}", parsed.header.magic))
        })?;
        parsed.verify_checksum(&mut self.formats[index])
    }

    /// Mark the entry starting at `address` as stale in its sector's
    /// accounting.
    fn mark_entry_stale(&mut self, address: u32) {
        match self.entry_size_at(address) {
            Ok(size) => self
                .sectors
                .mark_stale(self.sectors.sector_of(address), size),
            Err(err) => warn!(address, %err, "could not size superseded entry"),
        }
    }

    fn entry_size_at(&mut self, address: u32) -> Result<usize> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.device.read(address, &mut header_bytes)?;
        let header = EntryHeader::decode(&header_bytes)?;
        let size = header.entry_size();
        let sector = self.sectors.sector_of(address);
        let sector_end = self.sectors.start_address(sector) as usize + self.sectors.sector_size();
        if !header.is_plausible() || address as usize + size > sector_end {
            return Err(KvsError::DataLoss(format!(
                "implausible entry header at {address:#x}"
            )));
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::InMemoryFlash;

    const MAGIC: u32 = 0x464C_4B56;

    fn store(sectors: usize) -> KeyValueStore<InMemoryFlash> {
        let flash = InMemoryFlash::new(1024, sectors, 16);
        KeyValueStore::new(
            flash,
            vec![EntryFormat::crc32(MAGIC)],
            Config::default(),
        )
        .unwrap()
    }

    fn ready_store(sectors: usize) -> KeyValueStore<InMemoryFlash> {
        let mut kvs = store(sectors);
        kvs.init().unwrap();
        kvs
    }

    fn get_vec(kvs: &mut KeyValueStore<InMemoryFlash>, key: &str) -> Result<Vec<u8>> {
        let size = kvs.value_size(key)?;
        let mut buf = vec![0u8; size];
        kvs.get(key, &mut buf)?;
        Ok(buf)
    }

    #[test]
    fn test_operations_require_init() {
        let mut kvs = store(4);
        let mut buf = [0u8; 8];
        assert!(matches!(
            kvs.get("key1", &mut buf),
            Err(KvsError::FailedPrecondition(_))
        ));
        assert!(matches!(
            kvs.put("key1", b"value"),
            Err(KvsError::FailedPrecondition(_))
        ));
        assert!(matches!(
            kvs.delete("key1"),
            Err(KvsError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value1");
        assert_eq!(kvs.len(), 1);
    }

    #[test]
    fn test_get_missing_key() {
        let mut kvs = ready_store(4);
        let mut buf = [0u8; 8];
        assert!(matches!(kvs.get("nope", &mut buf), Err(KvsError::NotFound)));
    }

    #[test]
    fn test_overwrite_keeps_one_live_entry() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        kvs.put("key1", b"value2").unwrap();
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value2");
        assert_eq!(kvs.len(), 1);

        let stats = kvs.stats();
        assert!(stats.reclaimable_bytes > 0);
    }

    #[test]
    fn test_delete_then_not_found() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        kvs.delete("key1").unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(kvs.get("key1", &mut buf), Err(KvsError::NotFound)));
        assert!(matches!(kvs.delete("key1"), Err(KvsError::NotFound)));
        assert_eq!(kvs.len(), 0);
    }

    #[test]
    fn test_put_after_delete() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"old").unwrap();
        kvs.delete("key1").unwrap();
        kvs.put("key1", b"new").unwrap();
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"new");
    }

    #[test]
    fn test_invalid_keys_and_values() {
        let mut kvs = ready_store(4);
        assert!(matches!(
            kvs.put("", b"v"),
            Err(KvsError::InvalidArgument(_))
        ));
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            kvs.put(&long_key, b"v"),
            Err(KvsError::InvalidArgument(_))
        ));
        // Value larger than a sector cannot be stored on this geometry.
        assert!(matches!(
            kvs.put("key1", &vec![0u8; 2048]),
            Err(KvsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_partial_read_at_offset() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        let err = kvs.get_at("key1", 3, &mut buf).unwrap_err();
        assert!(matches!(err, KvsError::ResourceExhausted(_)));
        assert_eq!(&buf, b"3456");

        let mut buf = [0u8; 7];
        assert_eq!(kvs.get_at("key1", 3, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"3456789");
    }

    #[test]
    fn test_small_buffer_returns_prefix() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"abcdef").unwrap();
        let mut buf = [0u8; 3];
        assert!(matches!(
            kvs.get("key1", &mut buf),
            Err(KvsError::ResourceExhausted(_))
        ));
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_value_size_and_contains() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        assert_eq!(kvs.value_size("key1").unwrap(), 6);
        assert!(kvs.contains("key1").unwrap());
        assert!(!kvs.contains("key2").unwrap());
    }

    #[test]
    fn test_reinit_recovers_entries() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        kvs.put("k2", b"value2").unwrap();
        kvs.put("key1", b"value3").unwrap();
        let transaction_count = kvs.transaction_count();

        let image = kvs.device().contents().to_vec();
        let mut flash = InMemoryFlash::new(1024, 4, 16);
        flash.load_image(&image);
        let mut recovered =
            KeyValueStore::new(flash, vec![EntryFormat::crc32(MAGIC)], Config::default()).unwrap();
        recovered.init().unwrap();

        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.transaction_count(), transaction_count);
        assert_eq!(get_vec(&mut recovered, "key1").unwrap(), b"value3");
        assert_eq!(get_vec(&mut recovered, "k2").unwrap(), b"value2");
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        kvs.init().unwrap();
        assert_eq!(kvs.len(), 1);
    }

    #[test]
    fn test_free_sector_invariant_under_churn() {
        let mut kvs = ready_store(4);
        for i in 0..200 {
            let value = vec![i as u8; 100];
            kvs.put("churn", &value).unwrap();
            // At least one fully-erased sector after every operation.
            let empties = (0..4)
                .filter(|&s| {
                    kvs.device()
                        .contents()
                        .iter()
                        .skip(s * 1024)
                        .take(1024)
                        .all(|&b| b == 0xFF)
                })
                .count();
            assert!(empties >= 1, "no erased sector after put {i}");
        }
    }

    #[test]
    fn test_gc_disabled_fails_fast() {
        let flash = InMemoryFlash::new(1024, 4, 16);
        let config = Config::builder()
            .gc_on_write(GarbageCollectOnWrite::Disabled)
            .build();
        let mut kvs =
            KeyValueStore::new(flash, vec![EntryFormat::crc32(MAGIC)], config).unwrap();
        kvs.init().unwrap();

        let value = vec![0xAA; 200];
        let mut filled = 0;
        loop {
            match kvs.put(&format!("key{filled}"), &value) {
                Ok(()) => filled += 1,
                Err(KvsError::ResourceExhausted(_)) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
            assert!(filled < 100, "store never filled");
        }
        // Existing keys are still readable after the failed put.
        assert_eq!(get_vec(&mut kvs, "key0").unwrap(), value);
    }

    #[test]
    fn test_redundant_copies_live_in_distinct_sectors() {
        let flash = InMemoryFlash::new(1024, 4, 16);
        let config = Config::builder().redundancy(2).build();
        let mut kvs =
            KeyValueStore::new(flash, vec![EntryFormat::crc32(MAGIC)], config).unwrap();
        kvs.init().unwrap();
        kvs.put("key1", b"value1").unwrap();

        let info: Vec<_> = kvs.entries().collect();
        assert_eq!(info.len(), 1);
        let descriptor_sectors: Vec<usize> = kvs
            .cache
            .find(info[0].key_hash)
            .unwrap()
            .addresses()
            .iter()
            .map(|&a| a as usize / 1024)
            .collect();
        assert_eq!(descriptor_sectors.len(), 2);
        assert_ne!(descriptor_sectors[0], descriptor_sectors[1]);
    }

    #[test]
    fn test_entries_iteration() {
        let mut kvs = ready_store(4);
        kvs.put("a", b"1").unwrap();
        kvs.put("b", b"2").unwrap();
        kvs.delete("a").unwrap();

        let info: Vec<_> = kvs.entries().collect();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].state, EntryState::Deleted);
        assert_eq!(info[1].state, EntryState::Valid);
        assert!(info[0].transaction_id > info[1].transaction_id);
    }

    #[test]
    fn test_heavy_maintenance_drops_tombstones() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();
        kvs.delete("key1").unwrap();
        assert_eq!(kvs.entries().count(), 1);

        kvs.heavy_maintenance().unwrap();
        assert_eq!(kvs.entries().count(), 0);
        assert_eq!(kvs.stats().reclaimable_bytes, 0);
    }

    #[test]
    fn test_format_migration() {
        const OLD_MAGIC: u32 = 0x4F4C_4421;
        let flash = InMemoryFlash::new(1024, 4, 16);
        let mut old_store = KeyValueStore::new(
            flash,
            vec![EntryFormat::crc32(OLD_MAGIC)],
            Config::default(),
        )
        .unwrap();
        old_store.init().unwrap();
        old_store.put("key1", b"value1").unwrap();
        let image = old_store.device().contents().to_vec();

        let mut flash = InMemoryFlash::new(1024, 4, 16);
        flash.load_image(&image);
        let mut kvs = KeyValueStore::new(
            flash,
            vec![EntryFormat::crc32(MAGIC), EntryFormat::crc32(OLD_MAGIC)],
            Config::default(),
        )
        .unwrap();
        kvs.init().unwrap();
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value1");

        assert_eq!(kvs.update_entries_to_primary_format().unwrap(), 1);
        assert_eq!(kvs.update_entries_to_primary_format().unwrap(), 0);
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value1");
    }

    #[test]
    fn test_hash_collision_reported_not_overwritten() {
        let mut kvs = ready_store(4);
        kvs.put("key1", b"value1").unwrap();

        // Forge a collision: alias a second key's hash onto the entry whose
        // stored key text is "key1".
        let info = kvs.entries().next().unwrap();
        let colliding_hash = key_hash(b"other-key");
        kvs.cache
            .add_new(
                KeyDescriptor::new(colliding_hash, info.transaction_id, EntryState::Valid),
                info.address,
            )
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            kvs.get("other-key", &mut buf),
            Err(KvsError::AlreadyExists)
        ));
        assert!(matches!(
            kvs.put("other-key", b"clobber"),
            Err(KvsError::AlreadyExists)
        ));
        assert!(matches!(
            kvs.delete("other-key"),
            Err(KvsError::AlreadyExists)
        ));
        // The resident key is untouched.
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value1");
    }

    #[test]
    fn test_checksum_less_format_roundtrip() {
        let flash = InMemoryFlash::new(1024, 4, 16);
        let mut kvs = KeyValueStore::new(
            flash,
            vec![EntryFormat::new(MAGIC, None)],
            Config::default(),
        )
        .unwrap();
        kvs.init().unwrap();
        kvs.put("key1", b"value1").unwrap();
        assert_eq!(get_vec(&mut kvs, "key1").unwrap(), b"value1");
    }
}
