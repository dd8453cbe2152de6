//! RAID0: strip-mapped fan-out across `N` leaves.
//!
//! Strip `g` of the device lives on leaf `g mod N` at leaf-local strip
//! `g / N`. A request is split at strip boundaries; every piece becomes a
//! chained subquery against its leaf, and the parent completes when the
//! last piece does.

use crate::error::IoResult;
use crate::fsm::Gated;
use crate::handler::RwHandler;
use crate::query::{FlushQuery, Query, ReadQuery, WriteQuery};
use crate::SECTOR_SZ;
use std::rc::Rc;

/// FSM-gated RAID0 target.
pub type Target = Gated<Backend>;

/// Builds a ready-to-use RAID0 target.
pub fn target(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>) -> Rc<Target> {
    Rc::new(Gated::new(Backend::new(strip_sz, hs)))
}

/// The strip-mapping dispatcher itself, without the FSM gate.
pub struct Backend {
    strip_sz: u64,
    hs: Vec<Rc<dyn RwHandler>>,
}

impl Backend {
    pub fn new(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>) -> Self {
        assert!(strip_sz.is_power_of_two());
        assert_eq!(strip_sz % SECTOR_SZ, 0);
        assert!(!hs.is_empty());
        Self { strip_sz, hs }
    }

    fn for_each_piece<M: 'static>(
        &self,
        query: &Rc<Query<M>>,
        submit: impl Fn(&Rc<dyn RwHandler>, Rc<Query<M>>) -> IoResult,
    ) -> IoResult {
        let n = self.hs.len() as u64;
        let total = query.buf().len();

        let mut strip_id = query.offset() / self.strip_sz;
        let mut strip_off = query.offset() % self.strip_sz;
        let mut sb = 0usize;

        while sb < total {
            let leaf_id = (strip_id % n) as usize;
            let leaf_strip = strip_id / n;
            let piece_off = leaf_strip * self.strip_sz + strip_off;
            let piece_len = ((self.strip_sz - strip_off) as usize).min(total - sb);

            submit(&self.hs[leaf_id], query.chained(sb, piece_len, piece_off))?;

            strip_id += 1;
            strip_off = 0;
            sb += piece_len;
        }

        Ok(())
    }
}

impl RwHandler for Backend {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        self.for_each_piece(&rq, |h, sub| h.submit_read(sub))
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        self.for_each_piece(&wq, |h, sub| h.submit_write(sub))
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        for h in &self.hs {
            h.submit_flush(fq.chained())?;
        }
        Ok(())
    }
}
