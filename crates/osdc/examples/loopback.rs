//! Drive a write and a read through the dispatcher against an in-process
//! OSD that acknowledges everything immediately.
//!
//!     cargo run -p osdc --example loopback

use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use anyhow::Result;
use bytes::{BufMut, BytesMut};

use msgr::{
    alloc_page_vec, channel_connection, ConnectionRef, EntityAddr, EntityName, Message,
    Messenger, MSG_OSD_MAP,
};
use osdc::messages::{EVersion, MOSDOp, MOSDOpReply, MSG_OSD_OPREPLY};
use osdc::osdmap::{OsdInfo, OsdMap};
use osdc::{FileLayout, Fsid, MonitorClient, OpCode, OsdClient, OsdClientConfig, OsdFlags, Vino};

/// Messenger whose every connection leads to a task that answers each op
/// with a committed reply.
struct LoopbackMessenger {
    client: OnceLock<Arc<OsdClient>>,
}

impl LoopbackMessenger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            client: OnceLock::new(),
        })
    }

    fn bind(&self, client: Arc<OsdClient>) {
        let _ = self.client.set(client);
    }
}

impl Messenger for LoopbackMessenger {
    fn connect(&self, name: EntityName, addr: EntityAddr) -> ConnectionRef {
        let (con, mut rx) = channel_connection(name, addr, 64);
        let client = self.client.get().cloned();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(client) = client.as_ref() else { break };
                let Ok(op) = MOSDOp::decode_front(&msg.front) else {
                    continue;
                };
                let is_read = OpCode::from_u16(op.ops[0].op).is_some_and(|o| o.is_read());
                let data_len = if is_read { op.ops[0].length as u32 } else { 0 };
                let reply = MOSDOpReply {
                    tid: op.tid,
                    flags: op.flags | OsdFlags::ONDISK.bits(),
                    result: 0,
                    reassert_version: EVersion {
                        epoch: op.osdmap_epoch,
                        version: op.tid,
                    },
                    oid: op.oid.clone(),
                    ops: op.ops.clone(),
                };
                let reply_msg = Arc::new(
                    Message::new(MSG_OSD_OPREPLY, reply.encode_front())
                        .with_tid(op.tid)
                        .with_data_extent(data_len, 0),
                );
                client.handle_reply(reply_msg).await;
            }
        });
        con
    }

    fn ping(&self, name: EntityName, addr: EntityAddr) {
        tracing::debug!("ping {} at {}", name, addr);
    }
}

struct LogMonitor;

impl MonitorClient for LogMonitor {
    fn request_osdmap(&self, epoch: u32) {
        tracing::info!("monitor asked for osdmap {}", epoch);
    }
    fn got_osdmap(&self, epoch: u32) {
        tracing::info!("monitor told we have osdmap {}", epoch);
    }
}

fn single_osd_map_msg(fsid: Fsid, map: &OsdMap) -> Arc<Message> {
    let mut buf = BytesMut::new();
    buf.put_slice(&fsid.0);
    buf.put_u32_le(0);
    let payload = map.encode();
    buf.put_u32_le(1);
    buf.put_u32_le(map.epoch);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    Arc::new(Message::new(MSG_OSD_MAP, buf.freeze()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let fsid = Fsid([3u8; 16]);
    let messenger = LoopbackMessenger::new();
    let osdc = OsdClient::new(
        OsdClientConfig::default(),
        fsid,
        Arc::clone(&messenger) as Arc<dyn Messenger>,
        Arc::new(LogMonitor),
    );
    messenger.bind(Arc::clone(&osdc));

    let map = OsdMap::new(
        1,
        16,
        vec![OsdInfo {
            up: true,
            addr: EntityAddr::new("127.0.0.1:6800".parse()?, 1),
        }],
    );
    osdc.handle_map(single_osd_map_msg(fsid, &map)).await;

    let layout = FileLayout::simple(4 << 20, 1);
    let vino = Vino::head(0x123);

    let pages = alloc_page_vec(1);
    pages[0].lock().unwrap().fill(0x5a);

    let written = osdc
        .writepages(
            vino,
            &layout,
            None,
            0,
            4096,
            0,
            0,
            Some(SystemTime::now()),
            Arc::clone(&pages),
            OsdFlags::empty(),
            true,
            false,
        )
        .await?;
    tracing::info!("wrote {} bytes", written);

    osdc.sync().await;
    tracing::info!("sync complete");

    let mut plen = 4096u64;
    let read = osdc
        .readpages(vino, &layout, 0, &mut plen, 0, 0, alloc_page_vec(1))
        .await?;
    tracing::info!("read {} bytes", read);

    osdc.stop().await;
    Ok(())
}
