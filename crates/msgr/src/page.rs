//! Fixed-size page buffers backing message payloads.
//!
//! Data payloads are handed between the client and the transport as vectors
//! of page buffers so a receive can land directly in caller-provided memory.
//! The vector itself is shared (`Arc`); a message holds at most one installed
//! vector behind its page lock, and that slot can be revoked while the
//! message is in flight.

use std::sync::{Arc, Mutex};

/// Page granularity for payload buffers.
pub const PAGE_SIZE: usize = 4096;

/// One payload page. Locked so the transport can fill it while other
/// threads hold references.
pub type Page = Arc<Mutex<Vec<u8>>>;

/// A shared vector of pages. Cloning is cheap; identity is the allocation.
pub type PageVec = Arc<Vec<Page>>;

/// Allocate `n` zeroed pages.
pub fn alloc_page_vec(n: usize) -> PageVec {
    Arc::new((0..n).map(|_| Arc::new(Mutex::new(vec![0u8; PAGE_SIZE]))).collect())
}

/// Number of pages spanned by the byte range `off..off+len`.
pub fn calc_pages_for(off: u64, len: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let first = off / PAGE_SIZE as u64;
    let last = (off + len - 1) / PAGE_SIZE as u64;
    (last - first + 1) as usize
}
