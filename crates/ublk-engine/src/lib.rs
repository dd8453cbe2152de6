//! Request-processing engine for a user-space block device.
//!
//! The engine consumes decoded block requests (reads, writes, flushes,
//! discards) and fulfills them against a configured storage topology: a
//! single file, an in-memory store, RAID0/RAID1/RAID4/RAID5, nested
//! compositions of those (RAID10 is RAID0 over RAID1 targets), optionally
//! wrapped by a read-through chunk cache.
//!
//! # Model
//!
//! - Everything is a [`RwHandler`]; targets nest by holding other handlers
//!   as leaves.
//! - Work travels as reference-counted queries ([`ReadQuery`],
//!   [`WriteQuery`], …) whose completer fires exactly once, when the last
//!   reference drops; subqueries slice the parent's buffer and propagate
//!   errors upward.
//! - The engine is **single-threaded per device**: completers run inline,
//!   and every lock here is a plain bit; a request that finds a bit taken
//!   parks on a FIFO and is resubmitted by the current holder's completer.
//! - Every target is wrapped by the online/offline [`fsm`]: the first leaf
//!   error drives it offline, permanently.
//!
//! The shared-memory ring protocol feeding this engine lives in the
//! `ublk-ring` crate; device discovery and the event loop live in the
//! `ublkd` daemon.

mod bitset;
mod buf;
pub mod cache;
mod error;
pub mod file;
pub mod fsm;
mod handler;
pub mod inmem;
pub mod mm;
mod query;
pub mod raid0;
pub mod raid1;
pub mod raid4;
pub mod raid5;
pub mod raidsp;
pub mod testing;

pub use bitset::{BitLocker, DynBitset, RwBitSemaphore};
pub use buf::IoBuf;
pub use error::{IoError, IoResult};
pub use fsm::TargetState;
pub use handler::RwHandler;
pub use query::{DiscardQuery, FlushQuery, Query, ReadMarker, ReadQuery, WriteMarker, WriteQuery};

/// Sector shift: all device I/O is sector-aligned.
pub const SECTOR_SHIFT: u64 = 9;
/// Sector size in bytes.
pub const SECTOR_SZ: u64 = 1 << SECTOR_SHIFT;

/// Bytes of `n` sectors.
#[inline]
pub fn sectors_to_bytes(n: u64) -> u64 {
    n << SECTOR_SHIFT
}

/// Sectors of `n` bytes (rounding down).
#[inline]
pub fn bytes_to_sectors(n: u64) -> u64 {
    n >> SECTOR_SHIFT
}
