//! Encoding and decoding of OSD op and op-reply message fronts.
//!
//! All integers are little-endian on the wire. The request front is a fixed
//! head followed by `num_ops` fixed-size op records, the object name, the
//! opaque authentication ticket, and (for writes under a snapshot context)
//! the snapshot id list. The reply front is a fixed head followed by the
//! object name and the op records echoed with result lengths; its total
//! length must match exactly or the message is corrupt.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::OsdcError;
use crate::types::{OpCode, PgId};
use crate::Result;

/// Message type for an OSD op (client to OSD)
pub const MSG_OSD_OP: u16 = 42;

/// Message type for an OSD op reply (OSD to client)
pub const MSG_OSD_OPREPLY: u16 = 43;

/// Fixed size of the request head in bytes
pub const REQUEST_HEAD_SIZE: usize = 78;

/// Fixed size of the reply head in bytes
pub const REPLY_HEAD_SIZE: usize = 36;

/// Fixed size of one op record in bytes
pub const OP_RECORD_SIZE: usize = 34;

/// Wire timestamp: seconds and nanoseconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u32,
    pub nsec: u32,
}

impl Timespec {
    pub fn zero() -> Self {
        Self::default()
    }
}

impl From<SystemTime> for Timespec {
    fn from(t: SystemTime) -> Self {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: d.as_secs() as u32,
            nsec: d.subsec_nanos(),
        }
    }
}

/// Object version token echoed on write replies. Re-sent on retry so the
/// server can deduplicate a replayed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EVersion {
    pub epoch: u32,
    pub version: u64,
}

impl EVersion {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.epoch);
        buf.put_u64_le(self.version);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            epoch: buf.get_u32_le(),
            version: buf.get_u64_le(),
        }
    }
}

/// One operation within a request: the opcode plus its extent and
/// truncation arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub op: u16,
    pub offset: u64,
    pub length: u64,
    pub truncate_size: u64,
    pub truncate_seq: u32,
    pub payload_len: u32,
}

impl OpRecord {
    pub fn new(op: OpCode) -> Self {
        Self {
            op: op.as_u16(),
            offset: 0,
            length: 0,
            truncate_size: 0,
            truncate_seq: 0,
            payload_len: 0,
        }
    }

    pub fn extent(op: OpCode, offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            ..Self::new(op)
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.op);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
        buf.put_u64_le(self.truncate_size);
        buf.put_u32_le(self.truncate_seq);
        buf.put_u32_le(self.payload_len);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            op: buf.get_u16_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
            truncate_size: buf.get_u64_le(),
            truncate_seq: buf.get_u32_le(),
            payload_len: buf.get_u32_le(),
        }
    }
}

/// OSD op request (message type 42).
///
/// Held on the request in structured form; the wire front is encoded fresh
/// at each send so resubmissions pick up the stamped epoch, flags and
/// reassert version.
#[derive(Debug, Clone)]
pub struct MOSDOp {
    pub client_inc: u32,
    pub osdmap_epoch: u32,
    pub flags: u32,
    pub mtime: Timespec,
    pub reassert_version: EVersion,
    pub pgid: PgId,
    pub snapid: u64,
    pub snap_seq: u64,
    pub snaps: Vec<u64>,
    pub tid: u64,
    pub oid: String,
    pub ticket: Bytes,
    pub ops: Vec<OpRecord>,
}

impl MOSDOp {
    /// Encode the message front.
    pub fn encode_front(&self) -> Bytes {
        let size = REQUEST_HEAD_SIZE
            + self.ops.len() * OP_RECORD_SIZE
            + self.oid.len()
            + self.ticket.len()
            + self.snaps.len() * 8;
        let mut buf = BytesMut::with_capacity(size);

        // fixed head
        buf.put_u32_le(self.client_inc);
        buf.put_u32_le(self.osdmap_epoch);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.mtime.sec);
        buf.put_u32_le(self.mtime.nsec);
        self.reassert_version.encode(&mut buf);
        buf.put_u32_le(self.pgid.pool);
        buf.put_u32_le(self.pgid.seed);
        buf.put_u64_le(self.snapid);
        buf.put_u64_le(self.snap_seq);
        buf.put_u32_le(self.snaps.len() as u32);
        buf.put_u32_le(self.oid.len() as u32);
        buf.put_u32_le(self.ticket.len() as u32);
        buf.put_u16_le(self.ops.len() as u16);
        buf.put_u64_le(self.tid);
        debug_assert_eq!(buf.len(), REQUEST_HEAD_SIZE);

        for op in &self.ops {
            op.encode(&mut buf);
        }
        buf.put_slice(self.oid.as_bytes());
        buf.put_slice(&self.ticket);
        for snap in &self.snaps {
            buf.put_u64_le(*snap);
        }
        buf.freeze()
    }

    /// Decode a message front. The counterpart of [`encode_front`]; used by
    /// tests and server-side tooling.
    ///
    /// [`encode_front`]: MOSDOp::encode_front
    pub fn decode_front(front: &[u8]) -> Result<Self> {
        let mut buf = front;
        if buf.remaining() < REQUEST_HEAD_SIZE {
            return Err(OsdcError::Decoding("short osd_op front".into()));
        }
        let client_inc = buf.get_u32_le();
        let osdmap_epoch = buf.get_u32_le();
        let flags = buf.get_u32_le();
        let mtime = Timespec {
            sec: buf.get_u32_le(),
            nsec: buf.get_u32_le(),
        };
        let reassert_version = EVersion::decode(&mut buf);
        let pgid = PgId::new(buf.get_u32_le(), buf.get_u32_le());
        let snapid = buf.get_u64_le();
        let snap_seq = buf.get_u64_le();
        let num_snaps = buf.get_u32_le() as usize;
        let object_len = buf.get_u32_le() as usize;
        let ticket_len = buf.get_u32_le() as usize;
        let num_ops = buf.get_u16_le() as usize;
        let tid = buf.get_u64_le();

        let trailer = num_ops * OP_RECORD_SIZE + object_len + ticket_len + num_snaps * 8;
        if buf.remaining() != trailer {
            return Err(OsdcError::Decoding(format!(
                "osd_op front trailer is {} bytes, expected {}",
                buf.remaining(),
                trailer
            )));
        }

        let ops = (0..num_ops).map(|_| OpRecord::decode(&mut buf)).collect();
        let oid = String::from_utf8(buf.copy_to_bytes(object_len).to_vec())
            .map_err(|_| OsdcError::Decoding("object name is not utf-8".into()))?;
        let ticket = buf.copy_to_bytes(ticket_len);
        let snaps = (0..num_snaps).map(|_| buf.get_u64_le()).collect();

        Ok(Self {
            client_inc,
            osdmap_epoch,
            flags,
            mtime,
            reassert_version,
            pgid,
            snapid,
            snap_seq,
            snaps,
            tid,
            oid,
            ticket,
            ops,
        })
    }
}

/// OSD op reply (message type 43).
#[derive(Debug, Clone)]
pub struct MOSDOpReply {
    pub tid: u64,
    pub flags: u32,
    pub result: i32,
    pub reassert_version: EVersion,
    pub oid: String,
    pub ops: Vec<OpRecord>,
}

impl MOSDOpReply {
    /// Encode the reply front. Only a server (or a test standing in for one)
    /// builds these.
    pub fn encode_front(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            REPLY_HEAD_SIZE + self.oid.len() + self.ops.len() * OP_RECORD_SIZE,
        );
        buf.put_u64_le(self.tid);
        buf.put_u32_le(self.flags);
        buf.put_i32_le(self.result);
        self.reassert_version.encode(&mut buf);
        buf.put_u32_le(self.ops.len() as u32);
        buf.put_u32_le(self.oid.len() as u32);
        debug_assert_eq!(buf.len(), REPLY_HEAD_SIZE);
        buf.put_slice(self.oid.as_bytes());
        for op in &self.ops {
            op.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decode a reply front, rejecting any length mismatch.
    pub fn decode_front(front: &[u8]) -> Result<Self> {
        let mut buf = front;
        if buf.remaining() < REPLY_HEAD_SIZE {
            return Err(OsdcError::Decoding("short osd_opreply front".into()));
        }
        let tid = buf.get_u64_le();
        let flags = buf.get_u32_le();
        let result = buf.get_i32_le();
        let reassert_version = EVersion::decode(&mut buf);
        let num_ops = buf.get_u32_le() as usize;
        let object_len = buf.get_u32_le() as usize;

        if front.len() != REPLY_HEAD_SIZE + object_len + num_ops * OP_RECORD_SIZE {
            return Err(OsdcError::Decoding(format!(
                "osd_opreply front is {} bytes, expected {}",
                front.len(),
                REPLY_HEAD_SIZE + object_len + num_ops * OP_RECORD_SIZE
            )));
        }

        let oid = String::from_utf8(buf.copy_to_bytes(object_len).to_vec())
            .map_err(|_| OsdcError::Decoding("object name is not utf-8".into()))?;
        let ops = (0..num_ops).map(|_| OpRecord::decode(&mut buf)).collect();

        Ok(Self {
            tid,
            flags,
            result,
            reassert_version,
            oid,
            ops,
        })
    }

    /// Read the tid out of a reply front that may still be streaming in.
    /// Only the head needs to have arrived.
    pub fn peek_tid(front: &[u8]) -> Option<u64> {
        if front.len() < 8 {
            return None;
        }
        let mut buf = front;
        Some(buf.get_u64_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OsdFlags;

    fn sample_op() -> MOSDOp {
        MOSDOp {
            client_inc: 1,
            osdmap_epoch: 12,
            flags: (OsdFlags::WRITE | OsdFlags::ONDISK).bits(),
            mtime: Timespec { sec: 1000, nsec: 42 },
            reassert_version: EVersion {
                epoch: 3,
                version: 77,
            },
            pgid: PgId::new(2, 0x1f),
            snapid: crate::types::NOSNAP,
            snap_seq: 5,
            snaps: vec![4, 5],
            tid: 99,
            oid: "123.00000000".to_string(),
            ticket: Bytes::from_static(b"ticket-blob"),
            ops: vec![
                OpRecord::extent(OpCode::Write, 4096, 8192),
                OpRecord::new(OpCode::StartSync),
            ],
        }
    }

    #[test]
    fn request_front_roundtrip() {
        let op = sample_op();
        let front = op.encode_front();
        let decoded = MOSDOp::decode_front(&front).unwrap();
        assert_eq!(decoded.tid, op.tid);
        assert_eq!(decoded.reassert_version, op.reassert_version);
        assert_eq!(decoded.oid, op.oid);
        assert_eq!(decoded.ops, op.ops);
        assert_eq!(decoded.snaps, op.snaps);
        assert_eq!(decoded.ticket, op.ticket);
        assert_eq!(decoded.flags, op.flags);
    }

    #[test]
    fn request_front_size_is_exact() {
        let op = sample_op();
        let front = op.encode_front();
        assert_eq!(
            front.len(),
            REQUEST_HEAD_SIZE + 2 * OP_RECORD_SIZE + op.oid.len() + op.ticket.len() + 16
        );
    }

    #[test]
    fn reply_front_roundtrip() {
        let reply = MOSDOpReply {
            tid: 99,
            flags: OsdFlags::ONDISK.bits(),
            result: -5,
            reassert_version: EVersion {
                epoch: 3,
                version: 77,
            },
            oid: "123.00000000".to_string(),
            ops: vec![OpRecord::extent(OpCode::Write, 4096, 8192)],
        };
        let front = reply.encode_front();
        let decoded = MOSDOpReply::decode_front(&front).unwrap();
        assert_eq!(decoded.tid, reply.tid);
        assert_eq!(decoded.result, -5);
        assert_eq!(decoded.reassert_version, reply.reassert_version);
        assert_eq!(decoded.ops, reply.ops);
    }

    #[test]
    fn reply_length_mismatch_is_rejected() {
        let reply = MOSDOpReply {
            tid: 1,
            flags: 0,
            result: 0,
            reassert_version: EVersion::default(),
            oid: "a.00000000".to_string(),
            ops: vec![OpRecord::extent(OpCode::Read, 0, 4096)],
        };
        let front = reply.encode_front();

        // truncated
        assert!(MOSDOpReply::decode_front(&front[..front.len() - 1]).is_err());

        // padded
        let mut padded = front.to_vec();
        padded.push(0);
        assert!(MOSDOpReply::decode_front(&padded).is_err());
    }

    #[test]
    fn peek_tid_reads_partial_front() {
        let reply = MOSDOpReply {
            tid: 0xdead_beef,
            flags: 0,
            result: 0,
            reassert_version: EVersion::default(),
            oid: String::new(),
            ops: vec![],
        };
        let front = reply.encode_front();
        assert_eq!(MOSDOpReply::peek_tid(&front[..10]), Some(0xdead_beef));
        assert_eq!(MOSDOpReply::peek_tid(&front[..4]), None);
    }
}
