//! Per-sector accounting and write placement.
//!
//! Each sector tracks how many of its bytes hold live entries
//! (`bytes_used`), how many hold stale data awaiting garbage collection
//! (`bytes_reclaimable`), and whether it is writable at all. The sum of the
//! two counters is the sector's write offset: everything past it is erased
//! flash. The map also owns the placement decisions (where the next entry
//! lands, which sector garbage collection reclaims) and the store-wide
//! invariant that at least one fully-erased sector always remains.

use crate::error::{KvsError, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// Fraction of total capacity in live use above which garbage collection may
/// start relocating live data out of mixed sectors.
pub const GC_USAGE_THRESHOLD: f32 = 0.7;

/// Bookkeeping for one erasable sector.
#[derive(Debug, Clone, Serialize)]
pub struct SectorDescriptor {
    /// Bytes held by entries the cache currently addresses.
    bytes_used: usize,
    /// Bytes held by superseded or skipped entries, recoverable by erase.
    bytes_reclaimable: usize,
    /// Cleared when header corruption is found in the sector; restored by
    /// erasing it.
    writable: bool,
    /// Erase bookkeeping for wear observation; not used for correctness.
    erase_count: u32,
}

impl SectorDescriptor {
    fn new() -> Self {
        Self {
            bytes_used: 0,
            bytes_reclaimable: 0,
            writable: true,
            erase_count: 0,
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn bytes_reclaimable(&self) -> usize {
        self.bytes_reclaimable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    /// A sector with nothing written since its last erase.
    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0 && self.bytes_reclaimable == 0
    }
}

/// Aggregate usage report across all sectors.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub sector_count: usize,
    pub sector_size_bytes: usize,
    pub in_use_bytes: usize,
    pub reclaimable_bytes: usize,
    pub writable_bytes: usize,
    pub min_erase_count: u32,
    pub max_erase_count: u32,
}

/// Accounting for every sector of the managed region.
pub struct SectorMap {
    sector_size: usize,
    descriptors: Vec<SectorDescriptor>,
    /// Rotation cursor: write placement scans start after the sector that
    /// received the previous entry, spreading wear.
    last_new_sector: usize,
}

impl SectorMap {
    pub fn new(sector_size: usize, sector_count: usize) -> Self {
        Self {
            sector_size,
            descriptors: vec![SectorDescriptor::new(); sector_count],
            last_new_sector: sector_count - 1,
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn sector_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn get(&self, sector: usize) -> &SectorDescriptor {
        &self.descriptors[sector]
    }

    /// Sector index containing `address`.
    pub fn sector_of(&self, address: u32) -> usize {
        address as usize / self.sector_size
    }

    /// First address of `sector`.
    pub fn start_address(&self, sector: usize) -> u32 {
        (sector * self.sector_size) as u32
    }

    /// Address where the next entry in `sector` would land.
    pub fn write_address(&self, sector: usize) -> u32 {
        let d = &self.descriptors[sector];
        self.start_address(sector) + (d.bytes_used + d.bytes_reclaimable) as u32
    }

    pub fn free_bytes(&self, sector: usize) -> usize {
        let d = &self.descriptors[sector];
        self.sector_size - d.bytes_used - d.bytes_reclaimable
    }

    pub fn empty_sector_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_empty()).count()
    }

    /// Live bytes as a fraction of total capacity.
    pub fn usage_ratio(&self) -> f32 {
        let used: usize = self.descriptors.iter().map(|d| d.bytes_used).sum();
        used as f32 / (self.sector_size * self.descriptors.len()) as f32
    }

    /// Account `bytes` of newly written live entry data in `sector`.
    pub fn record_write(&mut self, sector: usize, bytes: usize) {
        debug_assert!(self.free_bytes(sector) >= bytes);
        self.descriptors[sector].bytes_used += bytes;
    }

    /// Move `bytes` of `sector` from live to reclaimable (entry superseded,
    /// deleted copy dropped, or failed verification).
    ///
    /// Sizes come from flash headers and may disagree with what was
    /// accounted if the header rotted in between; the transfer is clamped so
    /// the sector totals stay coherent.
    pub fn mark_stale(&mut self, sector: usize, bytes: usize) {
        let d = &mut self.descriptors[sector];
        let moved = bytes.min(d.bytes_used);
        if moved < bytes {
            warn!(sector, bytes, "stale bytes exceed live accounting");
        }
        d.bytes_used -= moved;
        d.bytes_reclaimable += moved;
    }

    /// Account `bytes` in `sector` as dead on arrival (scan found them
    /// unusable).
    pub fn record_reclaimable(&mut self, sector: usize, bytes: usize) {
        self.descriptors[sector].bytes_reclaimable += bytes;
    }

    /// Undo a [`record_write`](Self::record_write) for space that was
    /// reserved but never written. Only valid while the sector's tail is
    /// still erased.
    pub fn release_reservation(&mut self, sector: usize, bytes: usize) {
        let d = &mut self.descriptors[sector];
        debug_assert!(d.bytes_used >= bytes);
        d.bytes_used = d.bytes_used.saturating_sub(bytes);
    }

    /// Header corruption found in `sector`: everything past its live entries
    /// is untrustworthy. The sector stops accepting writes until erased.
    pub fn quarantine(&mut self, sector: usize) {
        let d = &mut self.descriptors[sector];
        d.writable = false;
        d.bytes_reclaimable = self.sector_size - d.bytes_used;
    }

    pub fn has_quarantined_sectors(&self) -> bool {
        self.descriptors.iter().any(|d| !d.writable)
    }

    pub fn quarantined_sectors(&self) -> Vec<usize> {
        self.descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.writable)
            .map(|(i, _)| i)
            .collect()
    }

    /// Reset accounting after the device erased `sector`.
    pub fn mark_erased(&mut self, sector: usize) {
        let d = &mut self.descriptors[sector];
        d.bytes_used = 0;
        d.bytes_reclaimable = 0;
        d.writable = true;
        d.erase_count += 1;
    }

    /// Choose the sector the next entry is written into.
    ///
    /// Scans round-robin from just past the previously chosen sector so
    /// consecutive writes spread across the region. Skips unwritable
    /// sectors, `reserved` sectors (targets of an in-flight multi-copy
    /// write), and sectors without room. The last fully-erased sector is
    /// handed out only to garbage-collection relocation (`for_relocation`),
    /// which erases its source right afterwards and thereby restores the
    /// free-sector invariant.
    pub fn pick_write_sector(
        &mut self,
        required_bytes: usize,
        reserved: &[usize],
        for_relocation: bool,
    ) -> Result<usize> {
        let count = self.descriptors.len();
        let empty_sectors = self.empty_sector_count();

        for i in 1..=count {
            let sector = (self.last_new_sector + i) % count;
            let d = &self.descriptors[sector];
            if !d.writable || reserved.contains(&sector) {
                continue;
            }
            if self.free_bytes(sector) < required_bytes {
                continue;
            }
            if d.is_empty() && !for_relocation && empty_sectors <= 1 {
                // Regular writes never consume the final erased sector.
                continue;
            }
            self.last_new_sector = sector;
            debug!(sector, required_bytes, "picked write sector");
            return Ok(sector);
        }

        Err(KvsError::ResourceExhausted(format!(
            "no sector with {} free bytes",
            required_bytes
        )))
    }

    /// Choose the sector garbage collection should reclaim next, or `None`
    /// if nothing qualifies.
    ///
    /// Sectors holding only reclaimable bytes come first (no relocation
    /// needed), largest haul first. Sectors mixing live data are candidates
    /// only with `include_live`, which callers set above the usage threshold
    /// or during heavy maintenance.
    pub fn pick_gc_sector(&self, reserved: &[usize], include_live: bool) -> Option<usize> {
        let candidates = self
            .descriptors
            .iter()
            .enumerate()
            .filter(|(i, d)| d.bytes_reclaimable > 0 && !reserved.contains(i));

        let mut best: Option<(usize, &SectorDescriptor)> = None;
        for (i, d) in candidates {
            if d.bytes_used > 0 && !include_live {
                continue;
            }
            best = match best {
                Some((bi, bd)) => {
                    // All-reclaimable sectors beat mixed ones outright.
                    let better = (d.bytes_used == 0, d.bytes_reclaimable)
                        > (bd.bytes_used == 0, bd.bytes_reclaimable);
                    if better {
                        Some((i, d))
                    } else {
                        Some((bi, bd))
                    }
                }
                None => Some((i, d)),
            };
        }
        best.map(|(i, _)| i)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            sector_count: self.descriptors.len(),
            sector_size_bytes: self.sector_size,
            in_use_bytes: self.descriptors.iter().map(|d| d.bytes_used).sum(),
            reclaimable_bytes: self.descriptors.iter().map(|d| d.bytes_reclaimable).sum(),
            writable_bytes: (0..self.descriptors.len())
                .filter(|&s| self.descriptors[s].writable)
                .map(|s| self.free_bytes(s))
                .sum(),
            min_erase_count: self
                .descriptors
                .iter()
                .map(|d| d.erase_count)
                .min()
                .unwrap_or(0),
            max_erase_count: self
                .descriptors
                .iter()
                .map(|d| d.erase_count)
                .max()
                .unwrap_or(0),
        }
    }
}
