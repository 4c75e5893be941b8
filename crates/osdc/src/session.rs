//! Per-OSD session tracking.
//!
//! A session bundles the transport connection to one OSD with the set of
//! requests currently targeted at it. Sessions are owned by the client's OSD
//! index and exist only while at least one request is attached; the index and
//! the attachment sets are only touched under the client's request mutex.

use std::collections::BTreeSet;
use std::sync::Mutex;

use msgr::{ConnectionRef, EntityAddr};

/// An open session with one OSD.
pub struct OsdSession {
    pub osd: i32,
    pub con: ConnectionRef,
    requests: Mutex<BTreeSet<u64>>,
}

impl OsdSession {
    pub fn new(osd: i32, con: ConnectionRef) -> Self {
        Self {
            osd,
            con,
            requests: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn peer_addr(&self) -> EntityAddr {
        self.con.peer_addr()
    }

    pub fn attach(&self, tid: u64) {
        self.requests.lock().unwrap().insert(tid);
    }

    /// Detach a request; returns true if the session is now empty and should
    /// be dropped from the index.
    pub fn detach(&self, tid: u64) -> bool {
        let mut requests = self.requests.lock().unwrap();
        requests.remove(&tid);
        requests.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl std::fmt::Debug for OsdSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsdSession")
            .field("osd", &self.osd)
            .field("addr", &self.peer_addr())
            .field("requests", &self.num_requests())
            .finish()
    }
}
