//! Cluster topology map.
//!
//! A minimal concrete realization of the osdmap interface the dispatcher
//! consumes: versioned by epoch, it maps objects to placement groups and
//! placement groups to a primary OSD, and records each OSD's liveness and
//! address. The production data-placement algorithm is out of scope; the
//! placement here is a stable hash into the layout's pool followed by a
//! first-up scan, which preserves the properties the dispatcher relies on
//! (purity, determinism per epoch, -1 when nothing is up).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use msgr::EntityAddr;

use crate::error::OsdcError;
use crate::types::{FileLayout, PgId};
use crate::Result;

/// Per-OSD state tracked by the map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdInfo {
    pub up: bool,
    pub addr: EntityAddr,
}

/// One cluster topology snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdMap {
    pub epoch: u32,
    pub pg_num: u32,
    osds: Vec<OsdInfo>,
}

/// Stable object-name hash used to seed placement
fn hash_oid(oid: &str) -> u32 {
    // FNV-1a
    let mut h: u32 = 0x811c9dc5;
    for b in oid.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

impl OsdMap {
    pub fn new(epoch: u32, pg_num: u32, osds: Vec<OsdInfo>) -> Self {
        Self { epoch, pg_num, osds }
    }

    pub fn max_osd(&self) -> usize {
        self.osds.len()
    }

    /// Map an object onto its placement group.
    pub fn object_layout(&self, oid: &str, layout: &FileLayout) -> Result<PgId> {
        if self.pg_num == 0 {
            return Err(OsdcError::Layout("map has no placement groups".into()));
        }
        let seed = hash_oid(oid) % self.pg_num;
        Ok(PgId::new(layout.pg_pool, seed))
    }

    /// Primary OSD for a placement group: the first up OSD scanning from the
    /// seed position. Returns -1 if no OSD is up.
    pub fn pg_primary(&self, pgid: PgId) -> i32 {
        if self.osds.is_empty() {
            return -1;
        }
        let n = self.osds.len();
        let start = pgid.seed as usize % n;
        for i in 0..n {
            let o = (start + i) % n;
            if self.osds[o].up {
                return o as i32;
            }
        }
        -1
    }

    pub fn osd_addr(&self, osd: i32) -> Option<EntityAddr> {
        if osd < 0 {
            return None;
        }
        self.osds.get(osd as usize).map(|info| info.addr)
    }

    /// Full-map wire form: epoch u32, pg_num u32, osd count u32, then each
    /// OSD as up u8 + address. Little-endian throughout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.pg_num);
        buf.put_u32_le(self.osds.len() as u32);
        for info in &self.osds {
            buf.put_u8(info.up as u8);
            info.addr.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(OsdcError::Decoding("short osdmap".into()));
        }
        let epoch = buf.get_u32_le();
        let pg_num = buf.get_u32_le();
        let count = buf.get_u32_le() as usize;
        let mut osds = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(OsdcError::Decoding("truncated osdmap entry".into()));
            }
            let up = buf.get_u8() != 0;
            let addr = EntityAddr::decode(&mut buf)
                .map_err(|e| OsdcError::Decoding(format!("osdmap addr: {}", e)))?;
            osds.push(OsdInfo { up, addr });
        }
        debug!("decoded full osdmap epoch {} ({} osds)", epoch, osds.len());
        Ok(Self { epoch, pg_num, osds })
    }

    /// Apply an incremental, producing the next epoch's map. The incremental
    /// must be exactly one epoch ahead.
    pub fn apply_incremental(&self, inc: &OsdMapIncremental) -> Result<OsdMap> {
        if inc.epoch != self.epoch + 1 {
            return Err(OsdcError::Decoding(format!(
                "incremental epoch {} does not follow {}",
                inc.epoch, self.epoch
            )));
        }
        let mut next = self.clone();
        next.epoch = inc.epoch;
        for change in &inc.changes {
            let idx = change.osd as usize;
            if idx >= next.osds.len() {
                next.osds.resize(
                    idx + 1,
                    OsdInfo {
                        up: false,
                        addr: change.addr,
                    },
                );
            }
            next.osds[idx] = OsdInfo {
                up: change.up,
                addr: change.addr,
            };
        }
        debug!(
            "applied incremental epoch {} ({} changes)",
            inc.epoch,
            inc.changes.len()
        );
        Ok(next)
    }
}

/// A single OSD state change carried by an incremental map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdChange {
    pub osd: i32,
    pub up: bool,
    pub addr: EntityAddr,
}

/// Delta from one epoch to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdMapIncremental {
    pub epoch: u32,
    pub changes: Vec<OsdChange>,
}

impl OsdMapIncremental {
    pub fn new(epoch: u32, changes: Vec<OsdChange>) -> Self {
        Self { epoch, changes }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.changes.len() as u32);
        for change in &self.changes {
            buf.put_i32_le(change.osd);
            buf.put_u8(change.up as u8);
            change.addr.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(OsdcError::Decoding("short incremental".into()));
        }
        let epoch = buf.get_u32_le();
        let count = buf.get_u32_le() as usize;
        let mut changes = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 5 {
                return Err(OsdcError::Decoding("truncated incremental entry".into()));
            }
            let osd = buf.get_i32_le();
            let up = buf.get_u8() != 0;
            let addr = EntityAddr::decode(&mut buf)
                .map_err(|e| OsdcError::Decoding(format!("incremental addr: {}", e)))?;
            changes.push(OsdChange { osd, up, addr });
        }
        Ok(Self { epoch, changes })
    }
}
