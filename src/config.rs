//! Construction-time configuration for a [`KeyValueStore`](crate::KeyValueStore).

use serde::{Deserialize, Serialize};

/// How much garbage collection a single write may trigger when no sector has
/// room for the new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GarbageCollectOnWrite {
    /// Never collect during a write; fail with `ResourceExhausted` instead.
    Disabled,
    /// Collect at most one sector per write.
    OneSector,
    /// Collect as many sectors as the write needs (default)
    AsManySectorsNeeded,
}

/// When the store repairs problems found during init or normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorRecovery {
    /// Repair inline as soon as a problem is detected (default)
    Immediate,
    /// Defer repair until the next write that needs it.
    Lazy,
    /// Only repair when the caller invokes a maintenance method.
    Manual,
}

/// Store configuration.
///
/// All capacities are fixed at construction; the store never grows its RAM
/// footprint afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of logical keys the entry cache can index.
    pub max_entries: usize,

    /// Number of physical copies written per entry, each in a distinct
    /// sector. Must be at least 1.
    pub redundancy: usize,

    /// Garbage collection policy for writes that find no free space.
    pub gc_on_write: GarbageCollectOnWrite,

    /// Recovery policy for corruption and invariant violations.
    pub error_recovery: ErrorRecovery,

    /// Re-verify entry checksums on every read.
    pub verify_on_read: bool,

    /// Read back and verify every written copy.
    pub verify_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 64,
            redundancy: 1,
            gc_on_write: GarbageCollectOnWrite::AsManySectorsNeeded,
            error_recovery: ErrorRecovery::Immediate,
            verify_on_read: true,
            verify_on_write: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`].
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum number of logical keys.
    pub fn max_entries(mut self, count: usize) -> Self {
        self.config.max_entries = count;
        self
    }

    /// Set the number of redundant copies per entry.
    pub fn redundancy(mut self, copies: usize) -> Self {
        self.config.redundancy = copies;
        self
    }

    /// Set the garbage-collect-on-write policy.
    pub fn gc_on_write(mut self, policy: GarbageCollectOnWrite) -> Self {
        self.config.gc_on_write = policy;
        self
    }

    /// Set the error recovery policy.
    pub fn error_recovery(mut self, policy: ErrorRecovery) -> Self {
        self.config.error_recovery = policy;
        self
    }

    /// Enable or disable checksum verification on reads.
    pub fn verify_on_read(mut self, verify: bool) -> Self {
        self.config.verify_on_read = verify;
        self
    }

    /// Enable or disable read-back verification after writes.
    pub fn verify_on_write(mut self, verify: bool) -> Self {
        self.config.verify_on_write = verify;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
