//! Topology churn, transport resets, deferred sends and timeouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fsid, map_all_up, map_with_up, osd_addr, osdmap_msg, reply_msg, Harness};
use msgr::alloc_page_vec;
use osdc::messages::MOSDOp;
use osdc::osdmap::{OsdChange, OsdMapIncremental};
use osdc::{Fsid, OpCode, OsdClientConfig, OsdFlags, Vino};

async fn start_read(h: &Harness, ino: u64) -> Arc<osdc::OsdRequest> {
    let mut plen = 4096u64;
    let req = h
        .osdc
        .new_request(
            &common::layout_4m(),
            Vino::head(ino),
            0,
            &mut plen,
            OpCode::Read,
            OsdFlags::READ,
            None,
            false,
            0,
            0,
            None,
            false,
        )
        .await
        .unwrap();
    req.set_pages(alloc_page_vec(1), 1);
    h.osdc
        .start_request(Arc::clone(&req), false)
        .await
        .unwrap();
    req
}

#[tokio::test]
async fn reset_resubmits_with_retry_flag() {
    let h = Harness::with_map(&map_all_up(1, 3)).await;
    let req = start_read(&h, 0x55).await;
    let tid = req.tid();

    let (addr, first) = h.wait_for_send(1).await;
    let first_op = MOSDOp::decode_front(&first.front).unwrap();
    assert!(!OsdFlags::from_bits_truncate(first_op.flags).contains(OsdFlags::RETRY));

    h.osdc.handle_reset(addr).await;

    let (addr2, second) = h.wait_for_send(2).await;
    assert_eq!(addr2, addr);
    let second_op = MOSDOp::decode_front(&second.front).unwrap();
    assert_eq!(second_op.tid, tid);
    assert!(OsdFlags::from_bits_truncate(second_op.flags).contains(OsdFlags::RETRY));

    // reply against the retried attempt still completes the request
    h.osdc
        .handle_reply(reply_msg(tid, OsdFlags::READ, 0, 4096))
        .await;
    assert_eq!(h.osdc.num_requests().await, 0);
}

#[tokio::test]
async fn no_primary_waits_for_map_then_kicks() {
    // every osd down: the request parks and a newer map is requested
    let h = Harness::with_map(&map_with_up(1, &[false, false, false])).await;
    let req = start_read(&h, 0x77).await;

    assert_eq!(h.messenger.total_sent(), 0);
    assert_eq!(h.osdc.num_requests().await, 1);
    assert!(h.monc.requested.lock().unwrap().contains(&2));

    // epoch 2 brings the osds up; the map arrival kicks the request out
    let inc = OsdMapIncremental::new(
        2,
        (0..3)
            .map(|i| OsdChange {
                osd: i,
                up: true,
                addr: osd_addr(i),
            })
            .collect(),
    );
    h.osdc.handle_map(osdmap_msg(fsid(), &[&inc], &[])).await;

    assert_eq!(h.osdc.osdmap_epoch().await, Some(2));
    assert_eq!(*h.monc.got.lock().unwrap().last().unwrap(), 2);

    let (_, msg) = h.wait_for_send(1).await;
    let op = MOSDOp::decode_front(&msg.front).unwrap();
    assert_eq!(op.tid, req.tid());
    assert!(OsdFlags::from_bits_truncate(op.flags).contains(OsdFlags::RETRY));
    assert_eq!(op.osdmap_epoch, 2);
}

#[tokio::test]
async fn wrong_fsid_map_is_ignored() {
    let h = Harness::with_map(&map_all_up(3, 2)).await;
    let newer = map_all_up(9, 2);
    h.osdc
        .handle_map(osdmap_msg(Fsid([0xee; 16]), &[], &[&newer]))
        .await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(3));
    assert!(h.monc.got.lock().unwrap().iter().all(|&e| e == 3));
}

#[tokio::test]
async fn duplicate_incremental_is_a_noop() {
    let h = Harness::with_map(&map_with_up(1, &[true, false])).await;
    let inc = OsdMapIncremental::new(
        2,
        vec![OsdChange {
            osd: 1,
            up: true,
            addr: osd_addr(1),
        }],
    );

    h.osdc.handle_map(osdmap_msg(fsid(), &[&inc], &[])).await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(2));

    // replayed incremental no longer follows the current epoch
    h.osdc.handle_map(osdmap_msg(fsid(), &[&inc], &[])).await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(2));
}

#[tokio::test]
async fn applied_incremental_wins_over_full_maps() {
    let h = Harness::with_map(&map_all_up(1, 2)).await;
    let inc = OsdMapIncremental::new(
        2,
        vec![OsdChange {
            osd: 0,
            up: false,
            addr: osd_addr(0),
        }],
    );
    let full = map_all_up(5, 2);

    // the envelope carries both; the applied incremental makes the full
    // maps irrelevant
    h.osdc
        .handle_map(osdmap_msg(fsid(), &[&inc], &[&full]))
        .await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(2));
}

#[tokio::test]
async fn only_latest_full_map_is_considered() {
    let h = Harness::with_map(&map_all_up(1, 2)).await;
    let older = map_all_up(4, 2);
    let newest = map_all_up(6, 2);
    h.osdc
        .handle_map(osdmap_msg(fsid(), &[], &[&older, &newest]))
        .await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(6));

    // a stale full map never replaces a newer one
    h.osdc.handle_map(osdmap_msg(fsid(), &[], &[&older])).await;
    assert_eq!(h.osdc.osdmap_epoch().await, Some(6));
}

#[tokio::test]
async fn nofail_send_failure_is_latched_and_retried() {
    let mut config = OsdClientConfig::default();
    config.osd_timeout = Duration::from_millis(50);
    let h = Harness::new(config);
    h.install_map(&map_all_up(1, 2)).await;

    h.messenger.set_fail_sends(true);
    let mut plen = 4096u64;
    let req = h
        .osdc
        .new_request(
            &common::layout_4m(),
            Vino::head(0x31),
            0,
            &mut plen,
            OpCode::Write,
            OsdFlags::WRITE | OsdFlags::ONDISK,
            None,
            false,
            0,
            0,
            None,
            true,
        )
        .await
        .unwrap();
    req.set_pages(alloc_page_vec(1), 1);

    // nofail submission swallows the transport failure
    h.osdc
        .start_request(Arc::clone(&req), true)
        .await
        .unwrap();
    assert!(req.needs_resend());
    assert_eq!(h.osdc.num_requests().await, 1);

    // once the channel recovers, the timeout tick pushes it out
    h.messenger.set_fail_sends(false);
    let (_, msg) = h.wait_for_send(1).await;
    assert_eq!(msg.tid(), req.tid());
    assert!(!req.needs_resend());
}

#[tokio::test]
async fn timed_out_requests_ping_each_osd_once() {
    let mut config = OsdClientConfig::default();
    config.osd_timeout = Duration::from_millis(50);
    let h = Harness::new(config);
    // one osd up: both requests land on the same session
    h.install_map(&map_with_up(1, &[true])).await;

    let _r1 = start_read(&h, 0x61).await;
    let _r2 = start_read(&h, 0x62).await;
    assert_eq!(h.osdc.num_sessions().await, 1);

    // the armed timer fires on its own once the deadlines pass
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.messenger.ping_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no ping was sent");

    let pings = h.messenger.pings.lock().unwrap().clone();
    assert_eq!(pings.len(), 1, "one ping per osd per tick");
    assert_eq!(pings[0].1, osd_addr(0));

    h.osdc.stop().await;
}
