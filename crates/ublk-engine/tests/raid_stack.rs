//! End-to-end tests over composed target trees: nested RAID levels and the
//! cache wrapper, the way the daemon assembles them.

use std::rc::Rc;

use ublk_engine::testing::MockLeaf;
use ublk_engine::{cache, raid0, raid1, raid4, raid5};
use ublk_engine::{FlushQuery, IoBuf, IoError, ReadQuery, RwHandler, TargetState, WriteQuery};

fn leaves(n: usize, size: usize) -> Vec<Rc<MockLeaf>> {
    (0..n).map(|_| MockLeaf::new(size)).collect()
}

fn handlers(leaves: &[Rc<MockLeaf>]) -> Vec<Rc<dyn RwHandler>> {
    leaves
        .iter()
        .map(|l| Rc::clone(l) as Rc<dyn RwHandler>)
        .collect()
}

#[test]
fn raid10_write_mirrors_within_each_stripe_column() {
    // RAID0 over two RAID1 pairs, 4 KiB strips.
    let all = leaves(4, 64 * 1024);
    let pair_a = raid1::target(4096, handlers(&all[0..2]));
    let pair_b = raid1::target(4096, handlers(&all[2..4]));
    let top = raid0::target(4096, vec![pair_a as Rc<dyn RwHandler>, pair_b as Rc<dyn RwHandler>]);

    let payload: Vec<u8> = (0..16 * 1024u32).map(|i| (i * 3) as u8).collect();
    top.submit_write(WriteQuery::new(IoBuf::from_vec(payload.clone()), 0))
        .unwrap();

    // Mirrors agree within each column.
    assert_eq!(all[0].mem(), all[1].mem());
    assert_eq!(all[2].mem(), all[3].mem());

    // Striping: device strips 0 and 2 on column A, 1 and 3 on column B.
    assert_eq!(all[0].mem()[..4096], payload[..4096]);
    assert_eq!(all[2].mem()[..4096], payload[4096..8192]);
    assert_eq!(all[0].mem()[4096..8192], payload[8192..12288]);
    assert_eq!(all[2].mem()[4096..8192], payload[12288..]);

    // Read back round-trips through the same layout.
    let buf = IoBuf::alloc(16 * 1024);
    top.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();
    assert_eq!(buf.to_vec(), payload);
}

#[test]
fn raid10_leaf_failure_offlines_only_the_struck_column_then_the_top() {
    let all = leaves(4, 64 * 1024);
    let pair_a = raid1::target(4096, handlers(&all[0..2]));
    let pair_b = raid1::target(4096, handlers(&all[2..4]));
    let pair_b_probe = Rc::clone(&pair_b);
    let top = raid0::target(4096, vec![pair_a as Rc<dyn RwHandler>, pair_b as Rc<dyn RwHandler>]);

    all[0].fail_with(IoError::Backing);
    top.submit_write(WriteQuery::new(IoBuf::from_vec(vec![1; 8192]), 0))
        .unwrap();

    // The error propagated through the whole tree.
    assert_eq!(top.state(), TargetState::Offline);
    // The untouched column is still healthy.
    assert_eq!(pair_b_probe.state(), TargetState::Online);
}

#[test]
fn raid50_round_trip_with_rotating_parity_in_each_column() {
    // RAID0 over two RAID5 triples, 512-byte strips.
    let all = leaves(6, 64 * 1024);
    let col_a = raid5::target(512, handlers(&all[0..3]));
    let col_b = raid5::target(512, handlers(&all[3..6]));
    let col_a_probe = Rc::clone(&col_a);
    let top = raid0::target(4096, vec![col_a as Rc<dyn RwHandler>, col_b as Rc<dyn RwHandler>]);

    let payload: Vec<u8> = (0..32 * 1024u32).map(|i| (i ^ 0xa5) as u8).collect();
    top.submit_write(WriteQuery::new(IoBuf::from_vec(payload.clone()), 0))
        .unwrap();

    let buf = IoBuf::alloc(32 * 1024);
    top.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();
    assert_eq!(buf.to_vec(), payload);

    // A full column strip (4 KiB = 4 stripes of N=2) became coherent.
    for stripe in 0..4 {
        assert!(col_a_probe.is_stripe_parity_coherent(stripe));
    }
}

#[test]
fn raid40_flush_fans_out_to_every_leaf() {
    let all = leaves(6, 16 * 1024);
    let col_a = raid4::target(512, handlers(&all[0..3]));
    let col_b = raid4::target(512, handlers(&all[3..6]));
    let top = raid0::target(4096, vec![col_a as Rc<dyn RwHandler>, col_b as Rc<dyn RwHandler>]);

    top.submit_flush(FlushQuery::new()).unwrap();
    for leaf in &all {
        assert_eq!(leaf.flushes(), 1);
    }
}

#[test]
fn cached_raid5_round_trip_and_leaf_traffic_shape() {
    let all = leaves(3, 64 * 1024);
    let array = raid5::target(512, handlers(&all));
    let cached = cache::cached(array, 32, 4096, true);

    let payload: Vec<u8> = (0..8192u32).map(|i| (i * 11) as u8).collect();
    cached
        .submit_write(WriteQuery::new(IoBuf::from_vec(payload.clone()), 0))
        .unwrap();

    // Full-chunk writes: no read-modify-write against the array.
    assert!(all.iter().all(|l| l.reads().is_empty()));

    // Cache hit: the read never reaches the leaves.
    let buf = IoBuf::alloc(8192);
    cached.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();
    assert_eq!(buf.to_vec(), payload);
    assert!(all.iter().all(|l| l.reads().is_empty()));
}

#[test]
fn shared_mirror_leaves_see_every_write_once_per_holder() {
    // Both RAID1 pairs hold the SAME two leaves (handlers are shared).
    let all = leaves(2, 64 * 1024);
    let pair_a = raid1::target(4096, handlers(&all));
    let pair_b = raid1::target(4096, handlers(&all));
    let top = raid0::target(4096, vec![pair_a as Rc<dyn RwHandler>, pair_b as Rc<dyn RwHandler>]);

    top.submit_write(WriteQuery::new(IoBuf::from_vec(vec![9; 8192]), 0))
        .unwrap();

    // Two stripes, each mirrored to both shared leaves.
    assert_eq!(all[0].writes().len(), 2);
    assert_eq!(all[1].writes().len(), 2);
}
