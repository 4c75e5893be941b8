//! In-memory messenger and monitor stand-ins for driving the client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use msgr::{
    ConnectionRef, EntityAddr, EntityName, Message, Messenger, MsgrError, MSG_OSD_MAP,
};
use osdc::messages::{EVersion, MOSDOpReply, MSG_OSD_OPREPLY};
use osdc::osdmap::{OsdInfo, OsdMap, OsdMapIncremental};
use osdc::{FileLayout, Fsid, MonitorClient, OsdClient, OsdClientConfig, OsdFlags};

/// Connection that records what the client queues on it.
pub struct TestConnection {
    pub name: EntityName,
    pub addr: EntityAddr,
    pub sent: Mutex<Vec<Arc<Message>>>,
    fail: Arc<AtomicBool>,
}

impl msgr::Connection for TestConnection {
    fn send(&self, msg: Arc<Message>) -> msgr::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MsgrError::QueueFull);
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn peer_name(&self) -> EntityName {
        self.name
    }

    fn peer_addr(&self) -> EntityAddr {
        self.addr
    }
}

/// Messenger that hands out recording connections and logs pings.
#[derive(Default)]
pub struct TestMessenger {
    conns: Mutex<HashMap<EntityAddr, Arc<TestConnection>>>,
    pub pings: Mutex<Vec<(EntityName, EntityAddr)>>,
    fail_sends: Arc<AtomicBool>,
}

impl TestMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent send fail with a full queue.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn connection(&self, addr: EntityAddr) -> Option<Arc<TestConnection>> {
        self.conns.lock().unwrap().get(&addr).map(Arc::clone)
    }

    /// All queued messages in send order, with the peer they went to.
    pub fn sent_messages(&self) -> Vec<(EntityAddr, Arc<Message>)> {
        let conns = self.conns.lock().unwrap();
        let mut out = Vec::new();
        for con in conns.values() {
            for msg in con.sent.lock().unwrap().iter() {
                out.push((con.addr, Arc::clone(msg)));
            }
        }
        out
    }

    pub fn total_sent(&self) -> usize {
        self.sent_messages().len()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.lock().unwrap().len()
    }
}

impl Messenger for TestMessenger {
    fn connect(&self, name: EntityName, addr: EntityAddr) -> ConnectionRef {
        let mut conns = self.conns.lock().unwrap();
        let con = conns.entry(addr).or_insert_with(|| {
            Arc::new(TestConnection {
                name,
                addr,
                sent: Mutex::new(Vec::new()),
                fail: Arc::clone(&self.fail_sends),
            })
        });
        Arc::clone(con) as ConnectionRef
    }

    fn ping(&self, name: EntityName, addr: EntityAddr) {
        self.pings.lock().unwrap().push((name, addr));
    }
}

/// Monitor client that records the epochs asked for and acknowledged.
#[derive(Default)]
pub struct TestMonitor {
    pub requested: Mutex<Vec<u32>>,
    pub got: Mutex<Vec<u32>>,
}

impl MonitorClient for TestMonitor {
    fn request_osdmap(&self, epoch: u32) {
        self.requested.lock().unwrap().push(epoch);
    }

    fn got_osdmap(&self, epoch: u32) {
        self.got.lock().unwrap().push(epoch);
    }
}

pub fn fsid() -> Fsid {
    Fsid([7u8; 16])
}

pub fn osd_addr(osd: i32) -> EntityAddr {
    EntityAddr::new(
        format!("127.0.0.1:{}", 6800 + osd).parse().unwrap(),
        1,
    )
}

pub fn layout_4m() -> FileLayout {
    FileLayout::simple(4 << 20, 1)
}

pub fn map_with_up(epoch: u32, ups: &[bool]) -> OsdMap {
    let osds = ups
        .iter()
        .enumerate()
        .map(|(i, &up)| OsdInfo {
            up,
            addr: osd_addr(i as i32),
        })
        .collect();
    OsdMap::new(epoch, 16, osds)
}

pub fn map_all_up(epoch: u32, n: usize) -> OsdMap {
    map_with_up(epoch, &vec![true; n])
}

/// Build an OSDMAP message from incremental and full map payloads.
pub fn osdmap_msg(fsid: Fsid, incs: &[&OsdMapIncremental], fulls: &[&OsdMap]) -> Arc<Message> {
    let mut buf = BytesMut::new();
    buf.put_slice(&fsid.0);
    buf.put_u32_le(incs.len() as u32);
    for inc in incs {
        let payload = inc.encode();
        buf.put_u32_le(inc.epoch);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }
    buf.put_u32_le(fulls.len() as u32);
    for map in fulls {
        let payload = map.encode();
        buf.put_u32_le(map.epoch);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }
    Arc::new(Message::new(MSG_OSD_MAP, buf.freeze()))
}

pub fn osdmap_msg_full(fsid: Fsid, map: &OsdMap) -> Arc<Message> {
    osdmap_msg(fsid, &[], &[map])
}

/// Fabricate an op reply the way an OSD would send it.
pub fn reply_msg(tid: u64, flags: OsdFlags, result: i32, data_len: u32) -> Arc<Message> {
    let reply = MOSDOpReply {
        tid,
        flags: flags.bits(),
        result,
        reassert_version: EVersion {
            epoch: 1,
            version: tid,
        },
        oid: String::new(),
        ops: Vec::new(),
    };
    Arc::new(
        Message::new(MSG_OSD_OPREPLY, reply.encode_front())
            .with_tid(tid)
            .with_data_extent(data_len, 0),
    )
}

pub struct Harness {
    pub osdc: Arc<OsdClient>,
    pub messenger: Arc<TestMessenger>,
    pub monc: Arc<TestMonitor>,
}

impl Harness {
    pub fn new(config: OsdClientConfig) -> Self {
        let messenger = TestMessenger::new();
        let monc = Arc::new(TestMonitor::default());
        let osdc = OsdClient::new(
            config,
            fsid(),
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Arc::clone(&monc) as Arc<dyn MonitorClient>,
        );
        Self {
            osdc,
            messenger,
            monc,
        }
    }

    pub async fn with_map(map: &OsdMap) -> Self {
        let h = Self::new(OsdClientConfig::default());
        h.install_map(map).await;
        h
    }

    pub async fn install_map(&self, map: &OsdMap) {
        self.osdc.handle_map(osdmap_msg_full(fsid(), map)).await;
        assert_eq!(self.osdc.osdmap_epoch().await, Some(map.epoch));
    }

    /// Wait until at least `n` messages have been queued anywhere, then
    /// return the `n`-th.
    pub async fn wait_for_send(&self, n: usize) -> (EntityAddr, Arc<Message>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let all = self.messenger.sent_messages();
                if all.len() >= n {
                    return all[n - 1].clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a send")
    }
}

pub fn ticket() -> Bytes {
    Bytes::from_static(b"test-ticket")
}
