//! Core types for OSD request dispatch

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============= Request flags =============

bitflags::bitflags! {
    /// OSD request flag word, carried in the request head and echoed in
    /// replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OsdFlags: u32 {
        /// Request acknowledgement when the op is applied in memory
        const ACK = 0x0001;
        /// Request commit confirmation once the op is durable
        const ONDISK = 0x0004;
        /// This send is a resubmission of an earlier attempt
        const RETRY = 0x0008;
        /// Read operation
        const READ = 0x0010;
        /// Write operation
        const WRITE = 0x0020;
    }
}

// ============= Opcodes =============

const OP_MODE_RD: u16 = 0x1000;
const OP_MODE_WR: u16 = 0x2000;
const OP_TYPE_DATA: u16 = 0x0200;

/// Compose an opcode from mode, type and number
macro_rules! osd_op {
    (RD, DATA, $nr:expr) => {
        OP_MODE_RD | OP_TYPE_DATA | $nr
    };
    (WR, DATA, $nr:expr) => {
        OP_MODE_WR | OP_TYPE_DATA | $nr
    };
}

/// OSD operation codes.
///
/// The value composes the access mode (bits 12-15), the operand type
/// (bits 8-11) and the operation number (bits 0-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    Read = osd_op!(RD, DATA, 1),
    Stat = osd_op!(RD, DATA, 2),
    /// Mask a read against a pending truncation
    MaskTrunc = osd_op!(RD, DATA, 4),
    Write = osd_op!(WR, DATA, 1),
    WriteFull = osd_op!(WR, DATA, 2),
    Truncate = osd_op!(WR, DATA, 3),
    Delete = osd_op!(WR, DATA, 5),
    /// Flush pending data to disk promptly
    StartSync = osd_op!(WR, DATA, 7),
    /// Record a truncation point alongside a write
    SetTrunc = osd_op!(WR, DATA, 8),
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1201 => Some(OpCode::Read),
            0x1202 => Some(OpCode::Stat),
            0x1204 => Some(OpCode::MaskTrunc),
            0x2201 => Some(OpCode::Write),
            0x2202 => Some(OpCode::WriteFull),
            0x2203 => Some(OpCode::Truncate),
            0x2205 => Some(OpCode::Delete),
            0x2207 => Some(OpCode::StartSync),
            0x2208 => Some(OpCode::SetTrunc),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        (self as u16) & OP_MODE_RD != 0
    }

    pub fn is_write(self) -> bool {
        (self as u16) & OP_MODE_WR != 0
    }
}

// ============= Identity types =============

/// Cluster-wide unique identifier, sanity-checked on received maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fsid(pub [u8; 16]);

impl fmt::Display for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Snapshot id of the live object revision
pub const NOSNAP: u64 = u64::MAX - 1;

/// An inode plus the snapshot revision being addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vino {
    pub ino: u64,
    pub snap: u64,
}

impl Vino {
    pub fn new(ino: u64, snap: u64) -> Self {
        Self { ino, snap }
    }

    pub fn head(ino: u64) -> Self {
        Self { ino, snap: NOSNAP }
    }
}

/// Placement group id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PgId {
    pub pool: u32,
    pub seed: u32,
}

impl PgId {
    pub fn new(pool: u32, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

// ============= Layout and snapshots =============

/// Striping parameters of a file. Copied onto each request at submit time
/// so a concurrent layout change cannot skew an in-flight resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    /// Bytes of consecutive file data per stripe unit
    pub stripe_unit: u32,
    /// Stripe units across before wrapping to the next object set
    pub stripe_count: u32,
    /// Total bytes per object
    pub object_size: u32,
    /// Pool the file's objects live in
    pub pg_pool: u32,
}

impl FileLayout {
    /// One object per stripe unit, the common default.
    pub fn simple(object_size: u32, pg_pool: u32) -> Self {
        Self {
            stripe_unit: object_size,
            stripe_count: 1,
            object_size,
            pg_pool,
        }
    }
}

/// Snapshot descriptor attached to writes: the snapshot sequence number and
/// the ids of the snapshots the write must preserve. Shared by reference;
/// released when the last holder drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<u64>,
}

impl SnapContext {
    pub fn new(seq: u64, snaps: Vec<u64>) -> Arc<Self> {
        Arc::new(Self { seq, snaps })
    }
}
