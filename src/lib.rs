//! # FlashKV - Crash-Safe Key-Value Store for Raw Flash
//!
//! `flashkv` is a lightweight alternative to a filesystem for firmware that
//! needs persistent key-value data on NOR/NAND-like block storage:
//!
//! - **Crash safety**: every write is a new entry; power loss mid-write is
//!   reconciled by transaction id on the next init scan
//! - **Wear leveling**: writes rotate across sectors, garbage collection
//!   keeps erases spread out
//! - **Redundancy**: optional multiple copies per entry, each in a distinct
//!   sector
//! - **Bounded memory**: fixed-capacity in-RAM index, no allocation growth
//!   after construction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               KeyValueStore                     │
//! │   init / get / put / delete / maintenance       │
//! └──────┬───────────────┬───────────────┬──────────┘
//!        │               │               │
//!        ▼               ▼               ▼
//! ┌────────────┐  ┌─────────────┐  ┌────────────┐
//! │ EntryCache │  │  SectorMap  │  │ Entry codec│
//! │ (RAM index)│  │ (accounting)│  │ (on-flash) │
//! └────────────┘  └──────┬──────┘  └─────┬──────┘
//!                        │               │
//!                        ▼               ▼
//!                 ┌─────────────────────────┐
//!                 │       BlockDevice       │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use flashkv::{Config, EntryFormat, InMemoryFlash, KeyValueStore};
//!
//! # fn main() -> flashkv::Result<()> {
//! let flash = InMemoryFlash::new(1024, 4, 16);
//! let mut kvs = KeyValueStore::new(
//!     flash,
//!     vec![EntryFormat::crc32(0x464C_4B56)],
//!     Config::default(),
//! )?;
//! kvs.init()?;
//!
//! kvs.put("boot-count", &1u32.to_le_bytes())?;
//!
//! let mut buf = [0u8; 4];
//! kvs.get("boot-count", &mut buf)?;
//! assert_eq!(u32::from_le_bytes(buf), 1);
//!
//! kvs.delete("boot-count")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod error;
pub mod flash;
pub mod sectors;
pub mod store;

pub use cache::{EntryState, KeyDescriptor};
pub use checksum::{ChecksumAlgorithm, ChecksumCrc32};
pub use config::{Config, ConfigBuilder, ErrorRecovery, GarbageCollectOnWrite};
pub use entry::{EntryFormat, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
pub use error::{KvsError, Result};
pub use flash::{BlockDevice, InMemoryFlash};
pub use sectors::StorageStats;
pub use store::{EntryInfo, KeyValueStore, StoreState};

/// Current version of FlashKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
