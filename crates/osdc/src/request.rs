//! Per-request state.
//!
//! A request is shared (`Arc`) between the caller, the tid index and the
//! delivery paths; the tid index holds one strong reference for as long as
//! the request is registered. One-way state bits (`got_reply`, `aborted`,
//! `resend`, `prepared_pages`) are atomics so the abort/resend race can be
//! settled without taking a lock; the mutable message head sits behind its
//! own mutex and is re-encoded at every send.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use msgr::{Message, PageVec, PAGE_SIZE};

use crate::messages::{EVersion, MOSDOp, MSG_OSD_OP};
use crate::session::OsdSession;
use crate::types::{FileLayout, OsdFlags, SnapContext};

/// One-shot completion signal with any number of waiters.
pub struct Completion {
    done: AtomicBool,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before the re-check so a complete() landing in
            // between still wakes us
            notified.as_mut().enable();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook invoked from the reply path in place of (or, for the safe hook, in
/// addition to) the completion signals.
pub type RequestCallback = Arc<dyn Fn(&OsdRequest, &Message) + Send + Sync>;

/// Bounded pool backing writeback submissions that must not fail under
/// memory pressure: `alloc` waits for a slot instead of erroring.
pub struct RequestPool {
    sem: Arc<Semaphore>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub async fn alloc(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("request pool semaphore closed")
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// Admission gate for in-flight operations, denominated in payload pages.
///
/// A single budget covers both of the dispatcher's limits: a zero-payload
/// op still takes one permit, so the page budget also caps how many
/// requests can be outstanding at once, and an extent wider than the whole
/// budget is clamped to it instead of waiting on permits that can never
/// accumulate.
pub(crate) struct InflightBudget {
    sem: Arc<Semaphore>,
    max_pages: usize,
}

impl InflightBudget {
    pub(crate) fn new(max_pages: usize) -> Self {
        let max_pages = max_pages.max(1);
        Self {
            sem: Arc::new(Semaphore::new(max_pages)),
            max_pages,
        }
    }

    /// Reserve budget for an operation spanning `pages` payload pages,
    /// waiting while the cluster-bound backlog is at the cap.
    pub(crate) async fn admit(&self, pages: usize) -> OwnedSemaphorePermit {
        let permits = pages.clamp(1, self.max_pages) as u32;
        Arc::clone(&self.sem)
            .acquire_many_owned(permits)
            .await
            .expect("admission semaphore closed")
    }

    pub(crate) fn available_pages(&self) -> usize {
        self.sem.available_permits()
    }
}

/// A pending OSD request.
pub struct OsdRequest {
    tid: AtomicU64,
    oid: String,
    file_layout: FileLayout,
    flags: AtomicU32,
    snapc: Option<Arc<SnapContext>>,
    head: Mutex<MOSDOp>,
    pages: Mutex<Option<PageVec>>,
    num_pages: AtomicUsize,
    request_msg: Mutex<Option<Arc<Message>>>,
    reply_msg: Mutex<Option<Arc<Message>>>,
    session: Mutex<Option<Arc<OsdSession>>>,
    timeout_stamp: Mutex<Instant>,
    got_reply: AtomicBool,
    aborted: AtomicBool,
    resend: AtomicBool,
    prepared_pages: AtomicBool,
    result: AtomicI64,
    /// Signalled when a reply arrives
    pub completion: Completion,
    /// Signalled when the write is durable on the OSD
    pub safe_completion: Completion,
    callback: Mutex<Option<RequestCallback>>,
    safe_callback: Mutex<Option<RequestCallback>>,
    _pool_permit: Option<OwnedSemaphorePermit>,
}

impl OsdRequest {
    pub(crate) fn new(
        oid: String,
        file_layout: FileLayout,
        flags: OsdFlags,
        snapc: Option<Arc<SnapContext>>,
        head: MOSDOp,
        pool_permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid: AtomicU64::new(0),
            oid,
            file_layout,
            flags: AtomicU32::new(flags.bits()),
            snapc,
            head: Mutex::new(head),
            pages: Mutex::new(None),
            num_pages: AtomicUsize::new(0),
            request_msg: Mutex::new(None),
            reply_msg: Mutex::new(None),
            session: Mutex::new(None),
            timeout_stamp: Mutex::new(Instant::now()),
            got_reply: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            resend: AtomicBool::new(false),
            prepared_pages: AtomicBool::new(false),
            result: AtomicI64::new(0),
            completion: Completion::new(),
            safe_completion: Completion::new(),
            callback: Mutex::new(None),
            safe_callback: Mutex::new(None),
            _pool_permit: pool_permit,
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_tid(&self, tid: u64) {
        self.tid.store(tid, Ordering::Release);
        self.head.lock().unwrap().tid = tid;
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    pub fn file_layout(&self) -> &FileLayout {
        &self.file_layout
    }

    pub fn snap_context(&self) -> Option<&Arc<SnapContext>> {
        self.snapc.as_ref()
    }

    pub fn flags(&self) -> OsdFlags {
        OsdFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn add_flags(&self, flags: OsdFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn is_write(&self) -> bool {
        self.flags().contains(OsdFlags::WRITE)
    }

    // --- one-way state bits ---

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Mark the request aborted. Must happen before any page revocation so a
    /// racing send observes either the intact page vector or the flag.
    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn got_reply(&self) -> bool {
        self.got_reply.load(Ordering::Acquire)
    }

    /// First-reply transition; true exactly once.
    pub(crate) fn mark_got_reply(&self) -> bool {
        !self.got_reply.swap(true, Ordering::AcqRel)
    }

    pub fn needs_resend(&self) -> bool {
        self.resend.load(Ordering::Acquire)
    }

    pub(crate) fn set_resend(&self, value: bool) {
        self.resend.store(value, Ordering::Release);
    }

    pub(crate) fn mark_prepared_pages(&self) -> bool {
        !self.prepared_pages.swap(true, Ordering::AcqRel)
    }

    pub fn prepared_pages(&self) -> bool {
        self.prepared_pages.load(Ordering::Acquire)
    }

    // --- buffers ---

    /// Attach the payload page vector. `num_pages` is derived from the final
    /// (possibly shortened) extent, not from the vector length: the caller
    /// may hand in a larger borrowed vector.
    pub fn set_pages(&self, pages: PageVec, num_pages: usize) {
        *self.pages.lock().unwrap() = Some(pages);
        self.num_pages.store(num_pages, Ordering::Release);
    }

    pub fn pages(&self) -> Option<PageVec> {
        self.pages.lock().unwrap().clone()
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages.load(Ordering::Acquire)
    }

    pub(crate) fn request_msg(&self) -> Option<Arc<Message>> {
        self.request_msg.lock().unwrap().clone()
    }

    pub(crate) fn set_reply_msg(&self, msg: Arc<Message>) {
        *self.reply_msg.lock().unwrap() = Some(msg);
    }

    pub(crate) fn take_reply_msg(&self) -> Option<Arc<Message>> {
        self.reply_msg.lock().unwrap().take()
    }

    // --- placement ---

    pub(crate) fn session(&self) -> Option<Arc<OsdSession>> {
        self.session.lock().unwrap().clone()
    }

    pub(crate) fn set_session(&self, session: Option<Arc<OsdSession>>) {
        *self.session.lock().unwrap() = session;
    }

    pub(crate) fn set_pgid(&self, pgid: crate::types::PgId) {
        self.head.lock().unwrap().pgid = pgid;
    }

    pub(crate) fn set_reassert_version(&self, version: EVersion) {
        self.head.lock().unwrap().reassert_version = version;
    }

    pub fn reassert_version(&self) -> EVersion {
        self.head.lock().unwrap().reassert_version
    }

    // --- deadline ---

    pub(crate) fn timeout_stamp(&self) -> Instant {
        *self.timeout_stamp.lock().unwrap()
    }

    pub(crate) fn set_timeout_stamp(&self, stamp: Instant) {
        *self.timeout_stamp.lock().unwrap() = stamp;
    }

    // --- result and signals ---

    pub fn result(&self) -> i64 {
        self.result.load(Ordering::Acquire)
    }

    pub(crate) fn set_result(&self, result: i64) {
        self.result.store(result, Ordering::Release);
    }

    pub fn set_callback(&self, cb: RequestCallback) {
        *self.callback.lock().unwrap() = Some(cb);
    }

    pub fn set_safe_callback(&self, cb: RequestCallback) {
        *self.safe_callback.lock().unwrap() = Some(cb);
    }

    pub(crate) fn callback(&self) -> Option<RequestCallback> {
        self.callback.lock().unwrap().clone()
    }

    pub(crate) fn safe_callback(&self) -> Option<RequestCallback> {
        self.safe_callback.lock().unwrap().clone()
    }

    /// Encode a fresh outbound message from the structured head, stamping
    /// the map epoch and the accumulated flag word, and install the page
    /// vector into it.
    ///
    /// Returns `None` if the request was aborted: the abort flag is
    /// re-checked under the new message's page lock, so a send racing an
    /// abort either carries the intact vector or does not happen at all.
    pub(crate) fn encode_message(&self, epoch: u32) -> Option<Arc<Message>> {
        let (front, tid, data_len, data_off) = {
            let mut head = self.head.lock().unwrap();
            head.osdmap_epoch = epoch;
            head.flags |= self.flags.load(Ordering::Acquire);
            head.tid = self.tid();
            let data_len = if self.is_write() {
                head.ops[0].payload_len
            } else {
                0
            };
            let data_off = (head.ops[0].offset % PAGE_SIZE as u64) as u16;
            (head.encode_front(), head.tid, data_len, data_off)
        };

        let msg = Arc::new(
            Message::new(MSG_OSD_OP, front)
                .with_tid(tid)
                .with_data_extent(data_len, data_off),
        );

        let pages = self.pages();
        let ok = msg.with_page_lock(|slot| {
            if self.aborted() {
                return false;
            }
            *slot = pages;
            true
        });
        if !ok {
            return None;
        }

        *self.request_msg.lock().unwrap() = Some(Arc::clone(&msg));
        Some(msg)
    }
}

impl std::fmt::Debug for OsdRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsdRequest")
            .field("tid", &self.tid())
            .field("oid", &self.oid)
            .field("flags", &self.flags())
            .field("got_reply", &self.got_reply())
            .field("aborted", &self.aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completion_wakes_waiter() {
        let c = Arc::new(Completion::new());
        let waiter = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.wait().await })
        };
        tokio::task::yield_now().await;
        c.complete();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn completion_wait_after_complete_returns_immediately() {
        let c = Completion::new();
        c.complete();
        c.wait().await;
        assert!(c.is_complete());
    }

    #[tokio::test]
    async fn pool_bounds_outstanding_allocations() {
        let pool = RequestPool::new(2);
        let a = pool.alloc().await;
        let _b = pool.alloc().await;
        assert_eq!(pool.available(), 0);

        // third alloc waits until a slot frees
        let third = tokio::time::timeout(Duration::from_millis(20), pool.alloc()).await;
        assert!(third.is_err());

        drop(a);
        let _c = tokio::time::timeout(Duration::from_secs(1), pool.alloc())
            .await
            .expect("slot was not returned");
    }

    #[tokio::test]
    async fn admission_floors_zero_payload_ops() {
        let budget = InflightBudget::new(2);
        let _a = budget.admit(0).await;
        let _b = budget.admit(0).await;
        assert_eq!(budget.available_pages(), 0);

        // even without payload, a third op waits for a slot
        let third = tokio::time::timeout(Duration::from_millis(20), budget.admit(0)).await;
        assert!(third.is_err());
    }

    #[tokio::test]
    async fn admission_clamps_oversized_extents() {
        let budget = InflightBudget::new(4);
        let big = tokio::time::timeout(Duration::from_secs(1), budget.admit(64))
            .await
            .expect("oversized extent should clamp to the budget");
        assert_eq!(budget.available_pages(), 0);
        drop(big);
        assert_eq!(budget.available_pages(), 4);
    }

    #[tokio::test]
    async fn admission_releases_pages_on_drop() {
        let budget = InflightBudget::new(8);
        let a = budget.admit(3).await;
        let _b = budget.admit(2).await;
        assert_eq!(budget.available_pages(), 3);
        drop(a);
        assert_eq!(budget.available_pages(), 6);
    }

    #[test]
    fn got_reply_transitions_once() {
        let req = OsdRequest::new(
            "1.00000000".into(),
            FileLayout::simple(1 << 22, 0),
            OsdFlags::READ,
            None,
            crate::client::build_head_for_tests(),
            None,
        );
        assert!(req.mark_got_reply());
        assert!(!req.mark_got_reply());
        assert!(req.got_reply());
    }
}
