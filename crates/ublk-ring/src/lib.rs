//! Shared-memory command-ring protocol for a user-space block-device worker.
//!
//! The kernel driver hands every block request to user space through a pair
//! of single-producer single-consumer rings mapped into both address spaces:
//! commands flow kernel→user through the `cmdb` ring, acknowledgements flow
//! back through the `cmdb_ack` ring, and request payloads live in a shared
//! byte arena addressed by chains of cell descriptors.
//!
//! This crate is the protocol layer only:
//!
//! - [`proto`]: the `#[repr(C)]` wire records of the four mapped regions
//! - [`Popper`] / [`Pusher`]: the SPSC ring endpoints, acquire/release
//!   against the kernel counterpart
//! - [`CellChain`]: the walker recovering a request's scatter/gather
//!   segments from the descriptor table
//! - [`Backoff`]: adaptive spin/yield for the transient empty/full windows
//!
//! Device discovery, mapping setup and the event loop live in the daemon
//! crate; the request engine that consumes the decoded commands lives in
//! `ublk-engine`.

mod backoff;
mod cells;
mod invariants;
pub mod proto;
mod ring;

pub use backoff::Backoff;
pub use cells::{CellChain, CellsError};
pub use ring::{Popper, Pusher};
