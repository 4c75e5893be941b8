//! OSD client: request dispatch, tracking and recovery.
//!
//! Pending requests live in a tid-ordered index and are attached to per-OSD
//! sessions. Replies, map updates, connection resets and the timeout timer
//! all converge on that index: replies retire requests, map updates and
//! resets re-place and resubmit them, and the timer retries latched sends
//! and pings OSDs that have gone quiet.
//!
//! Lock order is map lock (shared), then the request mutex, then any
//! per-message page lock. Messenger sends and completion signals are issued
//! after the request mutex is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use msgr::{
    calc_pages_for, ConnectionRef, EntityAddr, EntityName, Message, Messenger, PageVec,
};

use crate::error::OsdcError;
use crate::layout::{file_extent_to_object, object_name};
use crate::messages::{EVersion, MOSDOp, MOSDOpReply, OpRecord, Timespec, MSG_OSD_OPREPLY};
use crate::monc::MonitorClient;
use crate::osdmap::{OsdMap, OsdMapIncremental};
use crate::request::{InflightBudget, OsdRequest, RequestPool};
use crate::session::OsdSession;
use crate::types::{FileLayout, Fsid, OpCode, OsdFlags, PgId, SnapContext, Vino, NOSNAP};
use crate::Result;

/// Configuration for the OSD client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsdClientConfig {
    /// Deadline after which a quiet OSD is pinged and the timer re-arms
    pub osd_timeout: Duration,
    /// Capacity of the preallocated pool backing `nofail` writeback
    pub request_pool_size: usize,
    /// In-flight payload budget in pages; zero-payload ops take one page of
    /// budget, so this also bounds the number of outstanding requests
    pub max_inflight_pages: usize,
    /// Opaque signed authentication ticket carried in every request
    pub signed_ticket: Bytes,
}

impl Default for OsdClientConfig {
    fn default() -> Self {
        Self {
            osd_timeout: Duration::from_secs(60),
            request_pool_size: 10,
            // 100 MiB of 4 KiB pages
            max_inflight_pages: 25600,
            signed_ticket: Bytes::new(),
        }
    }
}

/// State guarded by the request mutex: both ordered indexes, the tid
/// counter and the timer slot.
struct Inner {
    requests: BTreeMap<u64, Arc<OsdRequest>>,
    osds: BTreeMap<i32, Arc<OsdSession>>,
    last_tid: u64,
    num_requests: usize,
    /// Tid whose deadline the armed timer fires for; 0 when idle
    timeout_tid: u64,
    timer: Option<JoinHandle<()>>,
}

enum MapResult {
    Unchanged,
    Changed,
}

enum Prepared {
    /// No osdmap held yet
    NoMap,
    /// The placement group currently has no up primary
    NoPrimary,
    /// The request was aborted before the message could be armed
    Aborted,
    Ready(ConnectionRef, Arc<Message>),
}

/// Client-side dispatch engine for a cluster of object storage daemons.
pub struct OsdClient {
    config: OsdClientConfig,
    fsid: Fsid,
    messenger: Arc<dyn Messenger>,
    monc: Arc<dyn MonitorClient>,
    osdmap: RwLock<Option<Arc<OsdMap>>>,
    inner: Mutex<Inner>,
    req_pool: RequestPool,
    inflight: InflightBudget,
    self_weak: std::sync::Weak<Self>,
}

impl OsdClient {
    /// Create a client. No map is held until the first OSDMAP message is
    /// delivered; requests submitted before that stay registered and are
    /// dispatched once a map arrives.
    pub fn new(
        config: OsdClientConfig,
        fsid: Fsid,
        messenger: Arc<dyn Messenger>,
        monc: Arc<dyn MonitorClient>,
    ) -> Arc<Self> {
        info!(
            "osdc init, fsid {} timeout {:?}",
            fsid, config.osd_timeout
        );
        Arc::new_cyclic(|weak| Self {
            req_pool: RequestPool::new(config.request_pool_size),
            inflight: InflightBudget::new(config.max_inflight_pages),
            config,
            fsid,
            messenger,
            monc,
            osdmap: RwLock::new(None),
            inner: Mutex::new(Inner {
                requests: BTreeMap::new(),
                osds: BTreeMap::new(),
                last_tid: 0,
                num_requests: 0,
                timeout_tid: 0,
                timer: None,
            }),
            self_weak: weak.clone(),
        })
    }

    /// Cancel the timer and drop the map. In-flight requests are left to
    /// their owners; new submissions will queue for a map that never comes.
    pub async fn stop(&self) {
        debug!("osdc stop");
        {
            let mut inner = self.inner.lock().await;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.timeout_tid = 0;
        }
        *self.osdmap.write().await = None;
    }

    pub fn config(&self) -> &OsdClientConfig {
        &self.config
    }

    pub async fn num_requests(&self) -> usize {
        self.inner.lock().await.num_requests
    }

    pub async fn num_sessions(&self) -> usize {
        self.inner.lock().await.osds.len()
    }

    pub async fn osdmap_epoch(&self) -> Option<u32> {
        self.osdmap.read().await.as_ref().map(|m| m.epoch)
    }

    pub async fn lookup_request(&self, tid: u64) -> Option<Arc<OsdRequest>> {
        self.inner.lock().await.requests.get(&tid).map(Arc::clone)
    }

    // ------------------------------------------------------------------
    // Request building
    // ------------------------------------------------------------------

    /// Build a new request, mapping the file extent onto one object and
    /// shortening `*plen` to the object remainder; callers loop on the
    /// shortened length.
    ///
    /// If the file was recently truncated an extra truncation op carries the
    /// old and new size so the object is brought up to date lazily. If
    /// `do_sync`, a startsync op asks the OSD to flush promptly.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_request(
        &self,
        layout: &FileLayout,
        vino: Vino,
        off: u64,
        plen: &mut u64,
        opcode: OpCode,
        flags: OsdFlags,
        snapc: Option<Arc<SnapContext>>,
        do_sync: bool,
        truncate_seq: u32,
        truncate_size: u64,
        mtime: Option<SystemTime>,
        use_pool: bool,
    ) -> Result<Arc<OsdRequest>> {
        debug_assert!(flags.intersects(OsdFlags::READ | OsdFlags::WRITE));
        let permit = if use_pool {
            Some(self.req_pool.alloc().await)
        } else {
            None
        };

        let orig_len = *plen;
        let extent = file_extent_to_object(layout, off, *plen)?;
        if extent.objlen < orig_len {
            debug!(
                "skipping last {}, final file extent {}~{}",
                orig_len - extent.objlen,
                off,
                extent.objlen
            );
        }
        *plen = extent.objlen;
        let oid = object_name(vino.ino, extent.bno);

        let is_write = flags.contains(OsdFlags::WRITE);
        let do_trunc = truncate_seq != 0 && off + *plen > truncate_size;
        let mut ops = Vec::with_capacity(1 + do_trunc as usize + do_sync as usize);
        let mut main = OpRecord::extent(opcode, extent.objoff, extent.objlen);
        if is_write {
            main.payload_len = extent.objlen as u32;
        }
        ops.push(main);
        if do_trunc {
            let mut rec = OpRecord::new(if opcode.is_read() {
                OpCode::MaskTrunc
            } else {
                OpCode::SetTrunc
            });
            rec.truncate_seq = truncate_seq;
            // bias the truncation point to the object-local offset
            rec.truncate_size = truncate_size.saturating_sub(off - extent.objoff);
            ops.push(rec);
        }
        if do_sync {
            ops.push(OpRecord::new(OpCode::StartSync));
        }

        let head = MOSDOp {
            client_inc: 1, /* always, for now */
            osdmap_epoch: 0,
            flags: flags.bits(),
            mtime: if is_write {
                mtime.map(Timespec::from).unwrap_or_default()
            } else {
                Timespec::zero()
            },
            reassert_version: EVersion::default(),
            pgid: PgId::default(),
            snapid: vino.snap,
            snap_seq: snapc.as_ref().map(|s| s.seq).unwrap_or(0),
            snaps: snapc.as_ref().map(|s| s.snaps.clone()).unwrap_or_default(),
            tid: 0,
            oid: oid.clone(),
            ticket: self.config.signed_ticket.clone(),
            ops,
        };

        let req = OsdRequest::new(oid, *layout, flags, snapc, head, permit);
        debug!(
            "new_request {} {}~{} ({} pages)",
            req.oid(),
            extent.objoff,
            extent.objlen,
            calc_pages_for(off, *plen)
        );
        Ok(req)
    }

    // ------------------------------------------------------------------
    // Placement and send
    // ------------------------------------------------------------------

    fn detach_request(inner: &mut Inner, req: &Arc<OsdRequest>) {
        if let Some(session) = req.session() {
            if session.detach(req.tid()) {
                debug!("closing idle session osd{}", session.osd);
                inner.osds.remove(&session.osd);
            }
            req.set_session(None);
        }
    }

    /// Pick the primary OSD for the request's placement group and move the
    /// request onto that session. Sessions are created on first use and
    /// destroyed when their last request leaves.
    fn map_osds(
        &self,
        map: &OsdMap,
        inner: &mut Inner,
        req: &Arc<OsdRequest>,
    ) -> Result<MapResult> {
        let pgid = map.object_layout(req.oid(), req.file_layout())?;
        req.set_pgid(pgid);
        let o = map.pg_primary(pgid);

        let current = req.session().map(|s| s.osd).unwrap_or(-1);
        if current == o {
            return Ok(MapResult::Unchanged);
        }
        debug!(
            "map_osds tid {} pgid {} osd{} (was osd{})",
            req.tid(),
            pgid,
            o,
            current
        );

        Self::detach_request(inner, req);

        if o >= 0 {
            let session = match inner.osds.get(&o) {
                Some(session) => Arc::clone(session),
                None => {
                    let addr = map
                        .osd_addr(o)
                        .ok_or_else(|| OsdcError::Layout(format!("osd{} has no address", o)))?;
                    let con = self.messenger.connect(EntityName::osd(o as i64), addr);
                    let session = Arc::new(OsdSession::new(o, con));
                    inner.osds.insert(o, Arc::clone(&session));
                    session
                }
            };
            session.attach(req.tid());
            req.set_session(Some(session));
        }
        Ok(MapResult::Changed)
    }

    /// Place the request, stamp and encode its message, and reset the
    /// deadline. The connection and message are returned so callers can do
    /// the actual send after releasing the request mutex.
    fn prepare_send(
        &self,
        map: Option<&OsdMap>,
        inner: &mut Inner,
        req: &Arc<OsdRequest>,
    ) -> Result<Prepared> {
        let Some(map) = map else {
            return Ok(Prepared::NoMap);
        };
        self.map_osds(map, inner, req)?;
        let Some(session) = req.session() else {
            return Ok(Prepared::NoPrimary);
        };
        req.set_timeout_stamp(Instant::now() + self.config.osd_timeout);
        match req.encode_message(map.epoch) {
            Some(msg) => Ok(Prepared::Ready(Arc::clone(&session.con), msg)),
            None => Ok(Prepared::Aborted),
        }
    }

    /// Place and transmit. With no usable primary the request stays
    /// registered, a newer map is requested, and the arrival of that map
    /// kicks the request out; that path reports success.
    fn send_request(
        &self,
        map: Option<&OsdMap>,
        inner: &mut Inner,
        req: &Arc<OsdRequest>,
    ) -> Result<()> {
        match self.prepare_send(map, inner, req)? {
            Prepared::NoMap => {
                debug!("send_request tid {} has no osdmap yet", req.tid());
                self.monc.request_osdmap(1);
                Ok(())
            }
            Prepared::NoPrimary => {
                debug!("send_request tid {} no up osds in pg", req.tid());
                self.monc.request_osdmap(map.map(|m| m.epoch + 1).unwrap_or(1));
                Ok(())
            }
            Prepared::Aborted => {
                debug!("send_request tid {} aborted, not sending", req.tid());
                Ok(())
            }
            Prepared::Ready(con, msg) => {
                debug!(
                    "send_request tid {} to osd{} flags {:?}",
                    req.tid(),
                    req.session().map(|s| s.osd).unwrap_or(-1),
                    req.flags()
                );
                con.send(msg)?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Registration and submission
    // ------------------------------------------------------------------

    /// Register the request, assign its tid and send the initial attempt.
    ///
    /// With `nofail`, a failed send latches the request for the timeout tick
    /// to retry instead of surfacing the error; writeback callers rely on
    /// this never failing.
    pub async fn start_request(&self, req: Arc<OsdRequest>, nofail: bool) -> Result<()> {
        // registration: assign tid, arm the timer if this is the first
        {
            let mut inner = self.inner.lock().await;
            inner.last_tid += 1;
            let tid = inner.last_tid;
            req.set_tid(tid);
            debug!("register_request tid {}", tid);
            inner.requests.insert(tid, Arc::clone(&req));
            inner.num_requests += 1;
            let stamp = Instant::now() + self.config.osd_timeout;
            req.set_timeout_stamp(stamp);
            if inner.num_requests == 1 {
                inner.timeout_tid = tid;
                self.schedule_timeout(&mut inner, stamp);
            }
        }

        let map_guard = self.osdmap.read().await;
        let mut inner = self.inner.lock().await;
        match self.send_request(map_guard.as_deref(), &mut inner, &req) {
            Ok(()) => Ok(()),
            Err(e) => {
                if nofail {
                    debug!(
                        "start_request failed send, marking tid {} for resend: {}",
                        req.tid(),
                        e
                    );
                    req.set_resend(true);
                    Ok(())
                } else {
                    self.unregister_request(&mut inner, &req);
                    Err(e)
                }
            }
        }
    }

    /// Called under the request mutex.
    fn unregister_request(&self, inner: &mut Inner, req: &Arc<OsdRequest>) {
        let tid = req.tid();
        if inner.requests.remove(&tid).is_none() {
            return;
        }
        debug!("unregister_request tid {}", tid);
        inner.num_requests -= 1;
        Self::detach_request(inner, req);

        if tid == inner.timeout_tid {
            if inner.num_requests == 0 {
                debug!("no requests, canceling timeout");
                inner.timeout_tid = 0;
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
            } else {
                let (first_tid, first) = inner
                    .requests
                    .iter()
                    .next()
                    .map(|(t, r)| (*t, Arc::clone(r)))
                    .expect("num_requests > 0");
                inner.timeout_tid = first_tid;
                let stamp = first.timeout_stamp();
                debug!("rescheduled timeout on tid {}", first_tid);
                self.schedule_timeout(inner, stamp);
            }
        }
    }

    /// Arm the single timer slot for `deadline`, replacing any armed timer.
    fn schedule_timeout(&self, inner: &mut Inner, deadline: Instant) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let weak = self.self_weak.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(client) = weak.upgrade() {
                client.handle_timeout().await;
            }
        }));
    }

    // ------------------------------------------------------------------
    // Reply path
    // ------------------------------------------------------------------

    /// Handle an OSD op reply: either invoke the request's callback or wake
    /// the waiting thread, and retire the request once it is done.
    pub async fn handle_reply(&self, msg: Arc<Message>) {
        if msg.msg_type() != MSG_OSD_OPREPLY {
            warn!("unexpected message type 0x{:04x} on reply path", msg.msg_type());
            return;
        }
        let reply = match MOSDOpReply::decode_front(&msg.front) {
            Ok(reply) => reply,
            Err(e) => {
                error!("corrupt osd_opreply, dropping: {}", e);
                return;
            }
        };
        let tid = reply.tid;
        let flags = OsdFlags::from_bits_truncate(reply.flags);

        let mut inner = self.inner.lock().await;
        let Some(req) = inner.requests.get(&tid).map(Arc::clone) else {
            // already completed and unregistered; acks may arrive twice
            debug!("handle_reply tid {} dne", tid);
            return;
        };

        // the parked reply reference was only needed while pages could still
        // be revoked mid-receive
        if let Some(parked) = req.take_reply_msg() {
            drop(parked);
        }

        if req.aborted() {
            debug!("handle_reply tid {} aborted", tid);
            self.unregister_request(&mut inner, &req);
            return;
        }

        if !req.got_reply() {
            let mut result = reply.result as i64;
            let bytes = msg.header.data_len as i64;
            debug!("handle_reply tid {} result {} bytes {}", tid, result, bytes);
            if result == 0 {
                result = bytes;
            }
            req.set_result(result);
            // in case this is a write and we need to replay
            req.set_reassert_version(reply.reassert_version);
            req.mark_got_reply();
        } else if !flags.contains(OsdFlags::ONDISK) {
            debug!("handle_reply tid {} dup ack", tid);
            return;
        }

        // either this is a read, or we got the safe response
        let done = flags.contains(OsdFlags::ONDISK) || !req.is_write();
        if done {
            self.unregister_request(&mut inner, &req);
        }
        drop(inner);

        if let Some(cb) = req.callback() {
            cb(&req, &msg);
        } else {
            req.completion.complete();
        }
        if flags.contains(OsdFlags::ONDISK) {
            if let Some(cb) = req.safe_callback() {
                cb(&req, &msg);
            }
            req.safe_completion.complete();
        }
    }

    /// Pre-receive callback: install the request's page vector into the
    /// incoming reply so the payload lands in caller memory, and park a
    /// reference to the message so an abort can revoke the pages before the
    /// receive completes. Returns 0 on success, -1 otherwise.
    pub async fn prepare_pages(&self, msg: &Arc<Message>, want: usize) -> i32 {
        if msg.msg_type() != MSG_OSD_OPREPLY {
            return -1;
        }
        let Some(tid) = MOSDOpReply::peek_tid(&msg.front) else {
            return -1;
        };
        let inner = self.inner.lock().await;
        let Some(req) = inner.requests.get(&tid) else {
            debug!("prepare_pages unknown tid {}", tid);
            return -1;
        };
        debug!(
            "prepare_pages tid {} has {} pages, want {}",
            tid,
            req.num_pages(),
            want
        );
        if req.num_pages() >= want && !req.prepared_pages() && !req.aborted() {
            if let Some(pages) = req.pages() {
                if msg.install_pages(pages) {
                    req.set_reply_msg(Arc::clone(msg));
                    req.mark_prepared_pages();
                    return 0;
                }
            }
        }
        -1
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Resubmit requests whose placement changed, whose send previously
    /// failed, or (when `who` is given) which were attached to a peer whose
    /// connection reset. Caller holds the map lock shared.
    async fn kick_requests(&self, map: Option<&OsdMap>, who: Option<EntityAddr>) {
        let mut needmap = 0;
        let mut to_send: Vec<(Arc<OsdRequest>, ConnectionRef, Arc<Message>)> = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            let tids: Vec<u64> = inner.requests.keys().copied().collect();
            for tid in tids {
                let Some(req) = inner.requests.get(&tid).map(Arc::clone) else {
                    continue;
                };

                let mut kick = req.needs_resend();
                if !kick {
                    if let (Some(who), Some(session)) = (who.as_ref(), req.session()) {
                        kick = session.peer_addr() == *who;
                    }
                }
                if !kick {
                    let Some(map) = map else {
                        needmap += 1;
                        continue;
                    };
                    match self.map_osds(map, &mut inner, &req) {
                        Ok(result) => {
                            if req.session().is_none() {
                                debug!("tid {} maps to no valid osd", tid);
                                needmap += 1;
                                continue;
                            }
                            if matches!(result, MapResult::Unchanged) {
                                continue;
                            }
                        }
                        Err(e) => {
                            warn!("placement failed for tid {}: {}", tid, e);
                            continue;
                        }
                    }
                }

                if req.aborted() {
                    continue;
                }
                debug!("kicking tid {}", tid);
                req.add_flags(OsdFlags::RETRY);
                match self.prepare_send(map, &mut inner, &req) {
                    Ok(Prepared::Ready(con, msg)) => {
                        req.set_resend(false);
                        to_send.push((req, con, msg));
                    }
                    Ok(Prepared::NoMap) | Ok(Prepared::NoPrimary) => {
                        needmap += 1;
                    }
                    Ok(Prepared::Aborted) => {}
                    Err(e) => {
                        warn!("kick failed to prepare tid {}: {}", tid, e);
                        req.set_resend(true);
                    }
                }
            }
        }

        // messenger work happens outside the request mutex
        for (req, con, msg) in to_send {
            if let Err(e) = con.send(msg) {
                warn!("kick send failed for tid {}: {}", req.tid(), e);
                req.set_resend(true);
            }
        }

        if needmap > 0 {
            debug!("{} requests for down osds, need new map", needmap);
            self.monc
                .request_osdmap(map.map(|m| m.epoch + 1).unwrap_or(1));
        }
    }

    /// Process an osdmap message carrying any number of incremental and
    /// full maps, then kick requests whose placement changed.
    pub async fn handle_map(&self, msg: Arc<Message>) {
        let mut buf: &[u8] = &msg.front;
        if buf.remaining() < 16 {
            error!("osdc handle_map corrupt msg");
            return;
        }
        let mut fsid = [0u8; 16];
        buf.copy_to_slice(&mut fsid);
        if Fsid(fsid) != self.fsid {
            warn!("got osdmap with wrong fsid {}, ignoring", Fsid(fsid));
            return;
        }

        // parse the whole envelope up front; a corrupt message changes nothing
        let (incrementals, fulls) = match (decode_map_list(&mut buf), decode_map_list(&mut buf)) {
            (Ok(incrementals), Ok(fulls)) => (incrementals, fulls),
            _ => {
                error!("osdc handle_map corrupt msg");
                return;
            }
        };
        debug!(
            "handle_map {} inc maps, {} full maps",
            incrementals.len(),
            fulls.len()
        );

        let mut map_guard = self.osdmap.write().await;
        let mut updated = false;

        for (epoch, bytes) in &incrementals {
            let follows = map_guard
                .as_ref()
                .map(|m| m.epoch + 1 == *epoch)
                .unwrap_or(false);
            if !follows {
                debug!("ignoring incremental map {} len {}", epoch, bytes.len());
                continue;
            }
            let current = map_guard.as_ref().expect("checked above");
            match OsdMapIncremental::decode(bytes)
                .and_then(|inc| current.apply_incremental(&inc))
            {
                Ok(next) => {
                    debug!("applying incremental map {} len {}", epoch, bytes.len());
                    *map_guard = Some(Arc::new(next));
                    updated = true;
                }
                Err(e) => warn!("failed to apply incremental map {}: {}", epoch, e),
            }
        }

        if !updated {
            if let Some(((epoch, bytes), rest)) = fulls.split_last() {
                for (skipped, _) in rest {
                    debug!("skipping non-latest full map {}", skipped);
                }
                let current_epoch = map_guard.as_ref().map(|m| m.epoch).unwrap_or(0);
                if *epoch > current_epoch {
                    match OsdMap::decode(bytes) {
                        Ok(map) => {
                            debug!("taking full map {} len {}", epoch, bytes.len());
                            *map_guard = Some(Arc::new(map));
                            updated = true;
                        }
                        Err(e) => warn!("failed to decode full map {}: {}", epoch, e),
                    }
                } else {
                    debug!(
                        "skipping full map {}, older than our {}",
                        epoch, current_epoch
                    );
                }
            }
        }

        // keep placement readers out only while installing
        let read_guard = map_guard.downgrade();
        if let Some(map) = read_guard.as_ref() {
            self.monc.got_osdmap(map.epoch);
        }
        if updated {
            self.kick_requests(read_guard.as_deref(), None).await;
        }
    }

    /// A transport reset means unacknowledged replies from that OSD are
    /// gone for good; resubmit everything attached to the peer.
    pub async fn handle_reset(&self, addr: EntityAddr) {
        info!("osd connection reset at {}", addr);
        let map_guard = self.osdmap.read().await;
        self.kick_requests(map_guard.as_deref(), Some(addr)).await;
    }

    /// Timeout tick: retry latched sends, push out deadlines that have
    /// passed and ping each affected OSD once so a dead channel is noticed.
    /// Re-arms itself while requests remain.
    pub async fn handle_timeout(&self) {
        debug!("timeout tick");
        let map_guard = self.osdmap.read().await;
        let map = map_guard.as_deref();
        let next_deadline = Instant::now() + self.config.osd_timeout;

        let mut to_send: Vec<(Arc<OsdRequest>, ConnectionRef, Arc<Message>)> = Vec::new();
        let mut pings: Vec<(i32, EntityAddr)> = Vec::new();
        let mut pinged: BTreeSet<i32> = BTreeSet::new();

        {
            let mut inner = self.inner.lock().await;
            // our own handle occupies the timer slot; spent once we run
            inner.timer = None;

            let tids: Vec<u64> = inner.requests.keys().copied().collect();
            for tid in tids {
                let Some(req) = inner.requests.get(&tid).map(Arc::clone) else {
                    continue;
                };

                if req.needs_resend() {
                    debug!("osdc resending prev failed {}", tid);
                    match self.prepare_send(map, &mut inner, &req) {
                        Ok(Prepared::Ready(con, msg)) => {
                            req.set_resend(false);
                            to_send.push((req, con, msg));
                        }
                        Ok(Prepared::NoMap) | Ok(Prepared::NoPrimary) => {
                            // parked until a usable map arrives
                            req.set_resend(false);
                            self.monc
                                .request_osdmap(map.map(|m| m.epoch + 1).unwrap_or(1));
                        }
                        Ok(Prepared::Aborted) => {
                            req.set_resend(false);
                        }
                        Err(e) => {
                            debug!("osdc failed again on {}: {}", tid, e);
                        }
                    }
                    continue;
                }

                if Instant::now() < req.timeout_stamp() {
                    continue;
                }
                req.set_timeout_stamp(next_deadline);
                if let Some(session) = req.session() {
                    if pinged.insert(session.osd) {
                        debug!("tid {} (at least) timed out on osd{}", tid, session.osd);
                        pings.push((session.osd, session.peer_addr()));
                    }
                }
            }

            if inner.num_requests > 0 {
                if let Some(first_tid) = inner.requests.keys().next().copied() {
                    inner.timeout_tid = first_tid;
                }
                self.schedule_timeout(&mut inner, next_deadline);
            } else {
                inner.timeout_tid = 0;
            }
        }

        for (req, con, msg) in to_send {
            if let Err(e) = con.send(msg) {
                debug!("deferred send failed for tid {}: {}", req.tid(), e);
                req.set_resend(true);
            }
        }
        for (osd, addr) in pings {
            self.messenger.ping(EntityName::osd(osd as i64), addr);
        }
    }

    // ------------------------------------------------------------------
    // Waiting, aborting, syncing
    // ------------------------------------------------------------------

    /// Wait for a reply and return the request's result: bytes transferred,
    /// or a negative server error. A caller that gives up while waiting must
    /// call [`abort_request`] before releasing its buffers.
    ///
    /// [`abort_request`]: OsdClient::abort_request
    pub async fn wait_request(&self, req: &Arc<OsdRequest>) -> i64 {
        req.completion.wait().await;
        debug!("wait_request tid {} result {}", req.tid(), req.result());
        req.result()
    }

    /// Abort an in-progress request by taking the pages away from the
    /// outgoing and (if bound) incoming messages.
    pub fn abort_request(&self, req: &Arc<OsdRequest>) {
        warn!("abort_request tid {}, revoking pages", req.tid());
        // mark aborted before revoking pages: a racing resubmission that
        // re-arms the page vector will see the flag under the page lock and
        // refuse to send
        req.mark_aborted();
        if let Some(msg) = req.request_msg() {
            msg.revoke_pages();
        }
        if let Some(reply) = req.take_reply_msg() {
            reply.revoke_pages();
        }
        // wake any waiter; it will observe the aborted flag
        req.completion.complete();
    }

    /// Wait until every write submitted before this call is durable on its
    /// OSD. Writes submitted concurrently are not waited for.
    pub async fn sync(&self) {
        let mut inner = self.inner.lock().await;
        let last_tid = inner.last_tid;
        let mut next_tid = 0u64;
        loop {
            let Some((tid, req)) = inner
                .requests
                .range(next_tid..)
                .next()
                .map(|(t, r)| (*t, Arc::clone(r)))
            else {
                break;
            };
            if tid > last_tid {
                break;
            }
            next_tid = tid + 1;
            if !req.is_write() {
                continue;
            }
            drop(inner);
            debug!("sync waiting on tid {} (last is {})", tid, last_tid);
            req.safe_completion.wait().await;
            inner = self.inner.lock().await;
        }
        drop(inner);
        debug!("sync done (thru tid {})", last_tid);
    }

    // ------------------------------------------------------------------
    // Public read/write
    // ------------------------------------------------------------------

    /// Read some contiguous pages. If the extent crosses an object boundary
    /// `*plen` is shortened and the read is short; the caller loops. Returns
    /// bytes read.
    pub async fn readpages(
        &self,
        vino: Vino,
        layout: &FileLayout,
        off: u64,
        plen: &mut u64,
        truncate_seq: u32,
        truncate_size: u64,
        pages: PageVec,
    ) -> Result<u64> {
        debug!(
            "readpages on ino {:x}.{:x} on {}~{}",
            vino.ino, vino.snap, off, *plen
        );
        let _admission = self.inflight.admit(calc_pages_for(off, *plen)).await;
        let req = self
            .new_request(
                layout,
                vino,
                off,
                plen,
                OpCode::Read,
                OsdFlags::READ,
                None,
                false,
                truncate_seq,
                truncate_size,
                None,
                false,
            )
            .await?;
        req.set_pages(pages, calc_pages_for(off, *plen));

        self.start_request(Arc::clone(&req), false).await?;
        let rc = self.wait_request(&req).await;
        if req.aborted() {
            return Err(OsdcError::Aborted);
        }
        debug!("readpages result {}", rc);
        if rc < 0 {
            return Err(OsdcError::OsdError { code: rc as i32 });
        }
        Ok(rc as u64)
    }

    /// Do a synchronous write on N pages. Returns bytes written, shortened
    /// at an object boundary like [`readpages`].
    ///
    /// [`readpages`]: OsdClient::readpages
    #[allow(clippy::too_many_arguments)]
    pub async fn writepages(
        &self,
        vino: Vino,
        layout: &FileLayout,
        snapc: Option<Arc<SnapContext>>,
        off: u64,
        mut len: u64,
        truncate_seq: u32,
        truncate_size: u64,
        mtime: Option<SystemTime>,
        pages: PageVec,
        flags: OsdFlags,
        do_sync: bool,
        nofail: bool,
    ) -> Result<u64> {
        if vino.snap != NOSNAP {
            return Err(OsdcError::InvalidOperation(
                "writes must target the head revision".into(),
            ));
        }
        debug!("writepages on ino {:x} {}~{}", vino.ino, off, len);
        let _admission = self.inflight.admit(calc_pages_for(off, len)).await;
        let req = self
            .new_request(
                layout,
                vino,
                off,
                &mut len,
                OpCode::Write,
                flags | OsdFlags::ONDISK | OsdFlags::WRITE,
                snapc,
                do_sync,
                truncate_seq,
                truncate_size,
                mtime,
                nofail,
            )
            .await?;
        // may be a short write due to an object boundary
        req.set_pages(pages, calc_pages_for(off, len));

        self.start_request(Arc::clone(&req), nofail).await?;
        let mut rc = self.wait_request(&req).await;
        if req.aborted() {
            return Err(OsdcError::Aborted);
        }
        if rc < 0 {
            return Err(OsdcError::OsdError { code: rc as i32 });
        }
        if rc == 0 {
            rc = len as i64;
        }
        debug!("writepages result {}", rc);
        Ok(rc as u64)
    }
}

/// Decode one `(count, [(epoch, len, payload)...])` section of an OSDMAP
/// message.
fn decode_map_list(buf: &mut &[u8]) -> Result<Vec<(u32, Bytes)>> {
    if buf.remaining() < 4 {
        return Err(OsdcError::Decoding("short map list".into()));
    }
    let count = buf.get_u32_le();
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 8 {
            return Err(OsdcError::Decoding("short map entry".into()));
        }
        let epoch = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(OsdcError::Decoding("truncated map entry".into()));
        }
        out.push((epoch, Bytes::copy_from_slice(&buf[..len])));
        buf.advance(len);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn build_head_for_tests() -> MOSDOp {
    MOSDOp {
        client_inc: 1,
        osdmap_epoch: 0,
        flags: OsdFlags::READ.bits(),
        mtime: Timespec::zero(),
        reassert_version: EVersion::default(),
        pgid: PgId::default(),
        snapid: NOSNAP,
        snap_seq: 0,
        snaps: Vec::new(),
        tid: 0,
        oid: "1.00000000".into(),
        ticket: Bytes::new(),
        ops: vec![OpRecord::extent(OpCode::Read, 0, 4096)],
    }
}
