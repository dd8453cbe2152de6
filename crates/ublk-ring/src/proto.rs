//! Wire records shared with the kernel driver.
//!
//! The driver exposes four memory regions per block device. Every struct in
//! this module is an exact overlay of what the kernel lays out in them:
//!
//! - `cmdb` (kernel→user): [`CmdbHdr`] followed by `cmds_len` records of
//!   [`Cmd`],
//! - `cmdb_ack` (user→kernel): [`CmdbAckHdr`] followed by `cmds_len` records
//!   of [`CmdAck`],
//! - `cellc`: [`CellcHdr`] followed by `cellds_len` records of [`CellDesc`],
//! - `cells`: a plain byte arena that [`CellDesc::offset`] indexes into.
//!
//! All records are `#[repr(C)]` and [`bytemuck::Pod`], so views into the
//! mapped regions are plain casts with no copying and no endianness
//! conversion (the counterpart is the local kernel).

use bytemuck::{Pod, Zeroable};

/// Read request: walk the cell chain and fill it from the device.
pub const CMD_OP_READ: u8 = 0;
/// Write request: walk the cell chain and store it to the device.
pub const CMD_OP_WRITE: u8 = 1;
/// Flush request: persist everything written so far.
pub const CMD_OP_FLUSH: u8 = 2;
/// Discard request: the range is no longer needed.
pub const CMD_OP_DISCARD: u8 = 3;

/// Decoded command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOp {
    Read,
    Write,
    Flush,
    Discard,
}

impl CmdOp {
    /// Decodes the raw opcode byte. Unknown opcodes return `None` and are
    /// acknowledged with `ENOTSUP` by the dispatcher.
    #[inline]
    pub fn from_raw(op: u8) -> Option<Self> {
        match op {
            CMD_OP_READ => Some(Self::Read),
            CMD_OP_WRITE => Some(Self::Write),
            CMD_OP_FLUSH => Some(Self::Flush),
            CMD_OP_DISCARD => Some(Self::Discard),
            _ => None,
        }
    }
}

/// One command record in the `cmdb` ring.
///
/// The payload is two raw 64-bit words; their meaning depends on the opcode.
/// Use [`Cmd::rw`] or [`Cmd::discard`] to decode them; flush carries no
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Cmd {
    /// Kernel-chosen tag, echoed back in the matching [`CmdAck`].
    pub id: u16,
    /// Raw opcode, see [`CmdOp::from_raw`].
    pub op: u8,
    /// Per-command flags; currently opaque to the worker.
    pub flags: u8,
    _rsvd: u32,
    payload: [u64; 2],
}

/// Payload of a read or write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwPayload {
    /// Index of the first cell descriptor of the chain.
    pub fcdn: u32,
    /// Number of cell descriptors in the chain.
    pub cds_nr: u32,
    /// Absolute byte offset on the block device.
    pub offset: u64,
}

/// Payload of a discard command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardPayload {
    /// Absolute byte offset on the block device.
    pub offset: u64,
    /// Length of the discarded range in bytes.
    pub len: u64,
}

impl Cmd {
    /// Decodes the payload of a read/write command.
    #[inline]
    pub fn rw(&self) -> RwPayload {
        RwPayload {
            fcdn: self.payload[0] as u32,
            cds_nr: (self.payload[0] >> 32) as u32,
            offset: self.payload[1],
        }
    }

    /// Decodes the payload of a discard command.
    #[inline]
    pub fn discard(&self) -> DiscardPayload {
        DiscardPayload {
            offset: self.payload[0],
            len: self.payload[1],
        }
    }

    /// Builds a read command record (used by tests and tooling; in
    /// production the kernel writes these).
    pub fn read(id: u16, fcdn: u32, cds_nr: u32, offset: u64) -> Self {
        Self::rw_cmd(id, CMD_OP_READ, fcdn, cds_nr, offset)
    }

    /// Builds a write command record.
    pub fn write(id: u16, fcdn: u32, cds_nr: u32, offset: u64) -> Self {
        Self::rw_cmd(id, CMD_OP_WRITE, fcdn, cds_nr, offset)
    }

    /// Builds a flush command record.
    pub fn flush(id: u16) -> Self {
        Self {
            id,
            op: CMD_OP_FLUSH,
            flags: 0,
            _rsvd: 0,
            payload: [0; 2],
        }
    }

    /// Builds a discard command record.
    pub fn discard_cmd(id: u16, offset: u64, len: u64) -> Self {
        Self {
            id,
            op: CMD_OP_DISCARD,
            flags: 0,
            _rsvd: 0,
            payload: [offset, len],
        }
    }

    /// Builds a record with an arbitrary raw opcode.
    pub fn raw(id: u16, op: u8) -> Self {
        Self {
            id,
            op,
            flags: 0,
            _rsvd: 0,
            payload: [0; 2],
        }
    }

    fn rw_cmd(id: u16, op: u8, fcdn: u32, cds_nr: u32, offset: u64) -> Self {
        Self {
            id,
            op,
            flags: 0,
            _rsvd: 0,
            payload: [u64::from(fcdn) | (u64::from(cds_nr) << 32), offset],
        }
    }
}

/// One acknowledgement record in the `cmdb_ack` ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CmdAck {
    /// Tag of the command being acknowledged.
    pub id: u16,
    /// POSIX errno, zero on success.
    pub err: u16,
}

impl CmdAck {
    pub fn new(id: u16, err: u16) -> Self {
        Self { id, err }
    }
}

/// One cell descriptor: a segment of the request buffer inside the `cells`
/// arena. Descriptors of one command form a singly-linked chain through
/// [`CellDesc::ncelld`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CellDesc {
    /// Byte offset of the segment inside the `cells` arena.
    pub offset: u32,
    /// Segment length in bytes.
    pub data_sz: u32,
    /// Index of the next descriptor in the chain.
    pub ncelld: u32,
}

/// Header of the `cmdb` region; the command records follow it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CmdbHdr {
    /// Producer position, written by the kernel, read with acquire.
    pub tail: u32,
    /// Ring capacity in records.
    pub cmds_len: u32,
}

/// Header of the `cmdb_ack` region; the ack records follow it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CmdbAckHdr {
    /// Producer position, written by the worker with release.
    pub tail: u32,
    /// Ring capacity in records.
    pub cmds_len: u32,
}

/// Header of the `cellc` region; the cell descriptors follow it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CellcHdr {
    /// Initial consumer position of the command ring.
    pub cmdb_head: u32,
    /// Consumer position of the ack ring, written by the kernel.
    pub cmdb_ack_head: u32,
    /// Number of cell descriptors in the table.
    pub cellds_len: u32,
}
