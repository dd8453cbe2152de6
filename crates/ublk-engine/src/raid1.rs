//! RAID1: mirrored leaves.
//!
//! Reads walk the request in read-strip increments, each piece going to the
//! next mirror in round-robin order. The cursor advances per piece, not per
//! request, so one large read is spread across all mirrors. Writes carry the
//! same shared query to every mirror; the write completes when the last
//! mirror does, and any mirror error fails it.

use crate::error::IoResult;
use crate::fsm::Gated;
use crate::handler::RwHandler;
use crate::query::{FlushQuery, ReadQuery, WriteQuery};
use crate::SECTOR_SZ;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// What to do when a mirror fails a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Fail the read on the first mirror error (the target goes offline).
    #[default]
    FailFast,
    /// Retry the failed strip on the remaining mirrors; only when every
    /// mirror has failed does the error propagate.
    Failover,
}

/// FSM-gated RAID1 target.
pub type Target = Gated<Backend>;

/// Builds a ready-to-use RAID1 target with the default read policy.
pub fn target(read_strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>) -> Rc<Target> {
    target_with_policy(read_strip_sz, hs, ReadPolicy::default())
}

/// Builds a RAID1 target with an explicit read policy.
pub fn target_with_policy(
    read_strip_sz: u64,
    hs: Vec<Rc<dyn RwHandler>>,
    policy: ReadPolicy,
) -> Rc<Target> {
    Rc::new(Gated::new(Backend::new(read_strip_sz, hs, policy)))
}

/// The mirroring dispatcher itself, without the FSM gate.
pub struct Backend {
    state: Rc<MirrorSet>,
}

struct MirrorSet {
    read_strip_sz: u64,
    hs: Vec<Rc<dyn RwHandler>>,
    next: Cell<usize>,
    policy: ReadPolicy,
    /// Mirrors that already failed a read under [`ReadPolicy::Failover`];
    /// skipped as retry candidates from then on.
    suspect: RefCell<Vec<bool>>,
}

impl Backend {
    pub fn new(read_strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>, policy: ReadPolicy) -> Self {
        assert_eq!(read_strip_sz % SECTOR_SZ, 0);
        assert!(hs.len() >= 2);
        let mirrors = hs.len();
        Self {
            state: Rc::new(MirrorSet {
                read_strip_sz,
                hs,
                next: Cell::new(0),
                policy,
                suspect: RefCell::new(vec![false; mirrors]),
            }),
        }
    }

    /// Round-robin cursor position (tests pin scheduling with this).
    pub fn next_mirror(&self) -> usize {
        self.state.next.get()
    }
}

impl MirrorSet {
    /// Submits one read piece to `hid`, wiring the policy's completer.
    fn submit_piece(
        self: &Rc<Self>,
        parent: &Rc<ReadQuery>,
        buf_off: usize,
        len: usize,
        offset: u64,
        hid: usize,
        attempts: usize,
    ) -> IoResult {
        let sub = match self.policy {
            ReadPolicy::FailFast => parent.chained(buf_off, len, offset),
            ReadPolicy::Failover => {
                let mirrors = Rc::clone(self);
                let retry_parent = Rc::clone(parent);
                parent.subquery(buf_off, len, offset, move |piece| {
                    let Some(err) = piece.err() else { return };
                    mirrors.suspect.borrow_mut()[hid] = true;
                    if attempts + 1 < mirrors.hs.len() {
                        let retry_hid = mirrors.pick_mirror((hid + 1) % mirrors.hs.len());
                        let _ = mirrors.submit_piece(
                            &retry_parent,
                            buf_off,
                            len,
                            offset,
                            retry_hid,
                            attempts + 1,
                        );
                    } else {
                        retry_parent.set_err(err);
                    }
                })
            }
        };
        self.hs[hid].submit_read(sub)
    }

    /// First non-suspect mirror at or after `from` (wrapping); falls back to
    /// `from` itself when everything is suspect.
    fn pick_mirror(&self, from: usize) -> usize {
        let suspect = self.suspect.borrow();
        (0..self.hs.len())
            .map(|step| (from + step) % self.hs.len())
            .find(|&hid| !suspect[hid])
            .unwrap_or(from)
    }
}

impl RwHandler for Backend {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        let mirrors = &self.state;
        let total = rq.buf().len();
        let mut rb = 0usize;

        while rb < total {
            let piece_len = (mirrors.read_strip_sz as usize).min(total - rb);
            let hid = match mirrors.policy {
                ReadPolicy::FailFast => mirrors.next.get(),
                ReadPolicy::Failover => mirrors.pick_mirror(mirrors.next.get()),
            };
            mirrors.submit_piece(&rq, rb, piece_len, rq.offset() + rb as u64, hid, 0)?;
            mirrors.next.set((mirrors.next.get() + 1) % mirrors.hs.len());
            rb += piece_len;
        }

        Ok(())
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        for h in &self.state.hs {
            h.submit_write(Rc::clone(&wq))?;
        }
        Ok(())
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        for h in &self.state.hs {
            h.submit_flush(fq.chained())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::IoBuf;
    use crate::error::IoError;
    use crate::fsm::TargetState;
    use crate::testing::MockLeaf;

    fn mirrors(n: usize, size: usize) -> Vec<Rc<MockLeaf>> {
        (0..n).map(|_| MockLeaf::with_pattern(size)).collect()
    }

    fn as_handlers(leaves: &[Rc<MockLeaf>]) -> Vec<Rc<dyn RwHandler>> {
        leaves
            .iter()
            .map(|l| Rc::clone(l) as Rc<dyn RwHandler>)
            .collect()
    }

    #[test]
    fn sixteen_kib_read_alternates_mirrors_and_cursor_wraps() {
        let leaves = mirrors(2, 64 * 1024);
        let be = Backend::new(4096, as_handlers(&leaves), ReadPolicy::FailFast);

        let buf = IoBuf::alloc(16 * 1024);
        be.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();

        // Mirror 0 serves strips 0 and 2; mirror 1 serves strips 1 and 3.
        assert_eq!(leaves[0].reads(), vec![(0, 4096), (8192, 4096)]);
        assert_eq!(leaves[1].reads(), vec![(4096, 4096), (12288, 4096)]);
        assert_eq!(be.next_mirror(), 0);
        assert_eq!(buf.to_vec(), leaves[0].expected(0, 16 * 1024));
    }

    #[test]
    fn cursor_advances_across_requests() {
        let leaves = mirrors(2, 8192);
        let be = Backend::new(4096, as_handlers(&leaves), ReadPolicy::FailFast);

        be.submit_read(ReadQuery::new(IoBuf::alloc(4096), 0)).unwrap();
        assert_eq!(be.next_mirror(), 1);
        be.submit_read(ReadQuery::new(IoBuf::alloc(4096), 0)).unwrap();
        assert_eq!(leaves[0].reads().len(), 1);
        assert_eq!(leaves[1].reads().len(), 1);
    }

    #[test]
    fn writes_reach_every_mirror_with_identical_bytes() {
        let leaves = mirrors(3, 16 * 1024);
        let target = target(4096, as_handlers(&leaves));

        let payload = IoBuf::from_vec((0..8192u32).map(|i| i as u8).collect());
        target.submit_write(WriteQuery::new(payload, 4096)).unwrap();

        let reference = leaves[0].mem();
        for leaf in &leaves {
            assert_eq!(leaf.writes(), vec![(4096, 8192)]);
            assert_eq!(leaf.mem(), reference, "mirrors hold identical bytes");
        }
    }

    #[test]
    fn fail_fast_read_error_offlines_the_target() {
        let leaves = mirrors(2, 8192);
        leaves[1].fail_with(IoError::Backing);
        let target = target(4096, as_handlers(&leaves));

        // Second strip goes to the failing mirror.
        target
            .submit_read(ReadQuery::new(IoBuf::alloc(8192), 0))
            .unwrap();
        assert_eq!(target.state(), TargetState::Offline);
    }

    #[test]
    fn failover_retries_the_strip_on_the_other_mirror() {
        let leaves = mirrors(2, 8192);
        leaves[0].fail_with(IoError::Backing);
        let target = target_with_policy(4096, as_handlers(&leaves), ReadPolicy::Failover);

        let buf = IoBuf::alloc(4096);
        target.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();

        // Mirror 0 failed; the strip was re-read from mirror 1.
        assert_eq!(leaves[0].reads(), vec![(0, 4096)]);
        assert_eq!(leaves[1].reads(), vec![(0, 4096)]);
        assert_eq!(buf.to_vec(), leaves[1].expected(0, 4096));
        assert_eq!(target.state(), TargetState::Online);
    }

    #[test]
    fn failover_with_all_mirrors_failing_propagates_the_error() {
        let leaves = mirrors(2, 8192);
        leaves[0].fail_with(IoError::Backing);
        leaves[1].fail_with(IoError::Backing);
        let target = target_with_policy(4096, as_handlers(&leaves), ReadPolicy::Failover);

        target
            .submit_read(ReadQuery::new(IoBuf::alloc(4096), 0))
            .unwrap();
        assert_eq!(target.state(), TargetState::Offline);
    }
}
