//! Stripe/leaf coordinate translation for the parity topologies.
//!
//! The backend exposes the *data-skip-parity view*: for a given stripe, the
//! leaves are enumerated with the parity leaf skipped, so data strip `k` of
//! stripe `s` always means "the `k`-th non-parity leaf of `s`". No locking
//! and no parity math here: ordering belongs to the acceptor, XOR to the
//! parity module.

use crate::error::IoResult;
use crate::handler::RwHandler;
use crate::query::{FlushQuery, ReadQuery, WriteQuery};
use crate::SECTOR_SZ;
use std::rc::Rc;

/// Per-target constants derived from the strip size and leaf count.
#[derive(Debug, Clone, Copy)]
pub struct StaticCfg {
    pub strip_sz: u64,
    /// `N * strip_sz`, the data capacity of one stripe.
    pub stripe_data_sz: u64,
    /// `(N + 1) * strip_sz`, data plus parity.
    pub stripe_sz: u64,
}

/// Maps a stripe id to the index of its parity leaf.
pub type ParityMap = Box<dyn Fn(u64) -> usize>;

pub struct Backend {
    hs: Vec<Rc<dyn RwHandler>>,
    parity_map: ParityMap,
    cfg: StaticCfg,
}

impl Backend {
    pub fn new(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>, parity_map: ParityMap) -> Self {
        assert!(strip_sz.is_power_of_two());
        assert_eq!(strip_sz % SECTOR_SZ, 0);
        assert!(hs.len() >= 3);
        let cfg = StaticCfg {
            strip_sz,
            stripe_data_sz: strip_sz * (hs.len() as u64 - 1),
            stripe_sz: strip_sz * hs.len() as u64,
        };
        Self {
            hs,
            parity_map,
            cfg,
        }
    }

    #[inline]
    pub fn cfg(&self) -> &StaticCfg {
        &self.cfg
    }

    #[inline]
    pub fn parity_leaf(&self, stripe_id: u64) -> usize {
        let id = (self.parity_map)(stripe_id);
        debug_assert!(id < self.hs.len());
        id
    }

    /// Leaf indices of `stripe_id` in the data-skip-parity order: the data
    /// leaves first, the parity leaf last.
    fn leaf_order(&self, stripe_id: u64) -> Vec<usize> {
        let parity = self.parity_leaf(stripe_id);
        let mut order: Vec<usize> = (0..self.hs.len()).filter(|&h| h != parity).collect();
        order.push(parity);
        order
    }

    /// Reads from the data strips, starting at `rq.offset()` within the
    /// data space of `stripe_id_from` and running across stripes as needed.
    pub fn data_read(&self, stripe_id_from: u64, rq: Rc<ReadQuery>) -> IoResult {
        assert!(!rq.buf().is_empty());
        assert!(rq.offset() < self.cfg.stripe_data_sz);

        let total = rq.buf().len();
        let mut stripe_id = stripe_id_from;
        let mut stripe_off = rq.offset();
        let mut rb = 0usize;

        while rb < total {
            let mut left = ((self.cfg.stripe_data_sz - stripe_off) as usize).min(total - rb);
            let order = self.leaf_order(stripe_id);
            let data_leaves = order.len() - 1;

            let mut hid = (stripe_off / self.cfg.strip_sz) as usize;
            let mut strip_off = stripe_off % self.cfg.strip_sz;
            while left > 0 && hid < data_leaves {
                let leaf_off = stripe_id * self.cfg.strip_sz + strip_off;
                let piece_len = ((self.cfg.strip_sz - strip_off) as usize).min(left);
                self.hs[order[hid]].submit_read(rq.chained(rb, piece_len, leaf_off))?;
                rb += piece_len;
                left -= piece_len;
                hid += 1;
                strip_off = 0;
            }
            debug_assert_eq!(left, 0);

            stripe_id += 1;
            stripe_off = 0;
        }

        Ok(())
    }

    /// Reads the parity strip of `stripe_id` (or a prefix of it).
    pub fn parity_read(&self, stripe_id: u64, rq: Rc<ReadQuery>) -> IoResult {
        assert!(!rq.buf().is_empty());
        assert!(rq.offset() + rq.buf().len() as u64 <= self.cfg.strip_sz);

        let len = (self.cfg.strip_sz as usize).min(rq.buf().len());
        let sub = rq.chained(0, len, stripe_id * self.cfg.strip_sz);
        self.hs[self.parity_leaf(stripe_id)].submit_read(sub)
    }

    /// Submits the data slice `wqd` and the parity slice `wqp` of one
    /// stripe. `wqd.offset()` is stripe-data-relative; `wqp.offset()` is
    /// parity-strip-relative.
    pub fn stripe_write(
        &self,
        stripe_id: u64,
        wqd: Rc<WriteQuery>,
        wqp: Rc<WriteQuery>,
    ) -> IoResult {
        assert!(wqd.offset() + wqd.buf().len() as u64 <= self.cfg.stripe_data_sz);
        assert!(wqp.offset() + wqp.buf().len() as u64 <= self.cfg.strip_sz);

        let order = self.leaf_order(stripe_id);
        let data_leaves = order.len() - 1;
        let total = wqd.buf().len();

        let mut hid = (wqd.offset() / self.cfg.strip_sz) as usize;
        let mut strip_off = wqd.offset() % self.cfg.strip_sz;
        let mut wb = 0usize;
        while wb < total && hid < data_leaves {
            let leaf_off = stripe_id * self.cfg.strip_sz + strip_off;
            let piece_len = ((self.cfg.strip_sz - strip_off) as usize).min(total - wb);
            self.hs[order[hid]].submit_write(wqd.chained(wb, piece_len, leaf_off))?;
            wb += piece_len;
            hid += 1;
            strip_off = 0;
        }
        debug_assert_eq!(wb, total);

        let parity_len = wqp.buf().len();
        let parity_off = stripe_id * self.cfg.strip_sz + wqp.offset();
        self.hs[order[data_leaves]].submit_write(wqp.chained(0, parity_len, parity_off))
    }

    /// Forwards a flush to every leaf.
    pub fn flush(&self, fq: &Rc<FlushQuery>) -> IoResult {
        for h in &self.hs {
            h.submit_flush(fq.chained())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::IoBuf;
    use crate::testing::MockLeaf;

    fn backend(n_plus_1: usize, strip_sz: u64, raid5: bool) -> (Backend, Vec<Rc<MockLeaf>>) {
        let leaves: Vec<Rc<MockLeaf>> = (0..n_plus_1)
            .map(|_| MockLeaf::with_pattern(64 * 1024))
            .collect();
        let hs = leaves
            .iter()
            .map(|l| Rc::clone(l) as Rc<dyn RwHandler>)
            .collect();
        let map: ParityMap = if raid5 {
            Box::new(move |stripe_id| n_plus_1 - (stripe_id as usize % n_plus_1) - 1)
        } else {
            Box::new(move |_| n_plus_1 - 1)
        };
        (Backend::new(strip_sz, hs, map), leaves)
    }

    #[test]
    fn data_read_skips_the_parity_leaf() {
        // RAID5, 3 leaves: stripe 0 parity on leaf 2, stripe 1 on leaf 1.
        let (be, leaves) = backend(3, 512, true);

        let rq = ReadQuery::new(IoBuf::alloc(2048), 0);
        be.data_read(0, rq).unwrap();

        // Stripe 0: data on leaves 0,1 at 0; stripe 1: data on leaves 0,2 at 512.
        assert_eq!(leaves[0].reads(), vec![(0, 512), (512, 512)]);
        assert_eq!(leaves[1].reads(), vec![(0, 512)]);
        assert_eq!(leaves[2].reads(), vec![(512, 512)]);
    }

    #[test]
    fn raid4_parity_stays_on_the_last_leaf() {
        let (be, leaves) = backend(3, 512, false);

        be.data_read(0, ReadQuery::new(IoBuf::alloc(4096), 0)).unwrap();
        assert!(leaves[2].reads().is_empty(), "parity leaf untouched by data reads");
        assert_eq!(leaves[0].reads().len(), 4);
        assert_eq!(leaves[1].reads().len(), 4);
    }

    #[test]
    fn parity_read_targets_the_rotated_leaf() {
        let (be, leaves) = backend(3, 512, true);

        be.parity_read(1, ReadQuery::new(IoBuf::alloc(512), 0)).unwrap();
        assert_eq!(leaves[1].reads(), vec![(512, 512)]);
    }

    #[test]
    fn stripe_write_places_data_and_parity() {
        let (be, leaves) = backend(3, 512, true);

        let wqd = WriteQuery::new(IoBuf::from_vec(vec![0xd0; 512]), 512);
        let wqp = WriteQuery::new(IoBuf::from_vec(vec![0xee; 512]), 0);
        be.stripe_write(0, wqd, wqp).unwrap();

        // Data offset 512 within stripe 0 -> second data leaf (leaf 1).
        assert_eq!(leaves[1].writes(), vec![(0, 512)]);
        assert_eq!(leaves[2].writes(), vec![(0, 512)]);
        assert!(leaves[0].writes().is_empty());
        assert_eq!(leaves[1].mem()[..512], vec![0xd0; 512][..]);
        assert_eq!(leaves[2].mem()[..512], vec![0xee; 512][..]);
    }
}
