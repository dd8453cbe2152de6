//! Command dispatch: raw ring records in, typed engine queries out, one ack
//! per command when its last reference drops.

use crate::ack::AckSink;
use std::cell::Cell;
use std::rc::Rc;

use ublk_ring::proto::{Cmd, CmdOp};
use ublk_ring::CellChain;

use ublk_engine::{
    DiscardQuery, FlushQuery, IoBuf, IoError, ReadQuery, RwHandler, WriteQuery,
};

/// Per-command completion state: collects the first error and emits the ack
/// exactly once, when every subquery spawned for the command has finished.
struct CmdCompletion {
    id: u16,
    errno: Cell<u16>,
    ack: Rc<dyn AckSink>,
}

impl CmdCompletion {
    fn new(id: u16, ack: Rc<dyn AckSink>) -> Rc<Self> {
        Rc::new(Self {
            id,
            errno: Cell::new(0),
            ack,
        })
    }

    fn observe(&self, err: Option<IoError>) {
        if let Some(err) = err {
            if self.errno.get() == 0 {
                self.errno.set(err.errno());
            }
        }
    }
}

impl Drop for CmdCompletion {
    fn drop(&mut self) {
        self.ack.complete(self.id, self.errno.get());
    }
}

/// Routes decoded commands into the target tree.
pub struct Dispatcher {
    cellds: Rc<Vec<ublk_ring::proto::CellDesc>>,
    cells: IoBuf,
    target: Rc<dyn RwHandler>,
    ack: Rc<dyn AckSink>,
}

impl Dispatcher {
    pub fn new(
        cellds: Vec<ublk_ring::proto::CellDesc>,
        cells: IoBuf,
        target: Rc<dyn RwHandler>,
        ack: Rc<dyn AckSink>,
    ) -> Self {
        Self {
            cellds: Rc::new(cellds),
            cells,
            target,
            ack,
        }
    }

    /// Handles one command. Never fails the loop: every outcome, including
    /// an unknown opcode, becomes an ack.
    pub fn handle(&self, cmd: Cmd) {
        let done = CmdCompletion::new(cmd.id, Rc::clone(&self.ack));
        match CmdOp::from_raw(cmd.op) {
            Some(CmdOp::Read) => self.handle_read(&cmd, &done),
            Some(CmdOp::Write) => self.handle_write(&cmd, &done),
            Some(CmdOp::Flush) => self.handle_flush(&done),
            Some(CmdOp::Discard) => self.handle_discard(&cmd, &done),
            None => {
                log::warn!("cmd: id={} unknown op {}", cmd.id, cmd.op);
                done.observe(Some(IoError::Unsupported));
            }
        }
    }

    fn handle_read(&self, cmd: &Cmd, done: &Rc<CmdCompletion>) {
        let rw = cmd.rw();
        log::debug!(
            "cmd: READ [ id={} fcdn={} cds_nr={} off={} ]",
            cmd.id,
            rw.fcdn,
            rw.cds_nr,
            rw.offset
        );

        let mut offset = rw.offset;
        for segment in CellChain::new(rw.fcdn, rw.cds_nr, &self.cellds, self.cells.len()) {
            let Ok(range) = segment else {
                done.observe(Some(IoError::BadCells));
                return;
            };
            let buf = self.cells.slice(range.start, range.len());
            let len = buf.len() as u64;
            let done = Rc::clone(done);
            let rq = ReadQuery::with_completer(buf, offset, move |q| done.observe(q.err()));
            // Synchronous rejections land in the query and flow through the
            // completer like any other error.
            let _ = self.target.submit_read(rq);
            offset += len;
        }
    }

    fn handle_write(&self, cmd: &Cmd, done: &Rc<CmdCompletion>) {
        let rw = cmd.rw();
        log::debug!(
            "cmd: WRITE [ id={} fcdn={} cds_nr={} off={} ]",
            cmd.id,
            rw.fcdn,
            rw.cds_nr,
            rw.offset
        );

        let mut offset = rw.offset;
        for segment in CellChain::new(rw.fcdn, rw.cds_nr, &self.cellds, self.cells.len()) {
            let Ok(range) = segment else {
                done.observe(Some(IoError::BadCells));
                return;
            };
            let buf = self.cells.slice(range.start, range.len());
            let len = buf.len() as u64;
            let done = Rc::clone(done);
            let wq = WriteQuery::with_completer(buf, offset, move |q| done.observe(q.err()));
            let _ = self.target.submit_write(wq);
            offset += len;
        }
    }

    fn handle_flush(&self, done: &Rc<CmdCompletion>) {
        log::debug!("cmd: FLUSH [ id={} ]", done.id);
        let done = Rc::clone(done);
        let fq = FlushQuery::with_completer(move |q| done.observe(q.err()));
        let _ = self.target.submit_flush(fq);
    }

    fn handle_discard(&self, cmd: &Cmd, done: &Rc<CmdCompletion>) {
        let payload = cmd.discard();
        log::debug!(
            "cmd: DISCARD [ id={} off={} sz={} ]",
            cmd.id,
            payload.offset,
            payload.len
        );
        let done = Rc::clone(done);
        let dq = DiscardQuery::with_completer(payload.offset, payload.len, move |q| {
            done.observe(q.err())
        });
        if let Err(err) = self.target.submit_discard(Rc::clone(&dq)) {
            dq.set_err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use ublk_ring::proto::CellDesc;

    use ublk_engine::inmem::InmemTarget;
    use ublk_engine::testing::MockLeaf;

    /// Records acks instead of pushing them at a kernel.
    #[derive(Default)]
    struct AckLog {
        acks: RefCell<Vec<(u16, u16)>>,
    }

    impl AckSink for AckLog {
        fn complete(&self, id: u16, errno: u16) {
            self.acks.borrow_mut().push((id, errno));
        }
    }

    struct Rig {
        dispatcher: Dispatcher,
        arena: IoBuf,
        acks: Rc<AckLog>,
    }

    fn rig_with_target(target: Rc<dyn RwHandler>) -> Rig {
        // Two chained cells: 512 bytes at arena offset 0, 512 at 1024.
        let cellds = vec![
            CellDesc {
                offset: 0,
                data_sz: 512,
                ncelld: 1,
            },
            CellDesc {
                offset: 1024,
                data_sz: 512,
                ncelld: 0,
            },
        ];
        let arena = IoBuf::alloc(2048);
        let acks = Rc::new(AckLog::default());
        let dispatcher = Dispatcher::new(
            cellds,
            arena.clone(),
            target,
            Rc::clone(&acks) as Rc<dyn AckSink>,
        );
        Rig {
            dispatcher,
            arena,
            acks,
        }
    }

    fn rig() -> Rig {
        rig_with_target(Rc::new(InmemTarget::new(1 << 20)))
    }

    #[test]
    fn write_then_read_through_the_cell_chain() {
        let rig = rig();

        // Payload in the two cells; write 1 KiB at device offset 4096.
        rig.arena.slice(0, 512).copy_from(&[0xaa; 512]);
        rig.arena.slice(1024, 512).copy_from(&[0xbb; 512]);
        rig.dispatcher.handle(Cmd::write(1, 0, 2, 4096));
        assert_eq!(rig.acks.acks.borrow()[..], [(1, 0)]);

        // Scramble the arena, read it back through the same chain.
        rig.arena.fill_zero();
        rig.dispatcher.handle(Cmd::read(2, 0, 2, 4096));
        assert_eq!(rig.acks.acks.borrow()[..], [(1, 0), (2, 0)]);
        assert_eq!(rig.arena.slice(0, 512).to_vec(), vec![0xaa; 512]);
        assert_eq!(rig.arena.slice(1024, 512).to_vec(), vec![0xbb; 512]);
    }

    #[test]
    fn bad_cell_chain_acks_einval() {
        let rig = rig();
        // cds_nr exceeds the table.
        rig.dispatcher.handle(Cmd::read(7, 0, 5, 0));
        assert_eq!(rig.acks.acks.borrow()[..], [(7, libc::EINVAL as u16)]);
    }

    #[test]
    fn unknown_opcode_acks_enotsup() {
        let rig = rig();
        rig.dispatcher.handle(Cmd::raw(9, 42));
        assert_eq!(rig.acks.acks.borrow()[..], [(9, libc::ENOTSUP as u16)]);
    }

    #[test]
    fn flush_and_discard_ack_success_on_inmem() {
        let rig = rig();
        rig.dispatcher.handle(Cmd::flush(3));
        rig.dispatcher.handle(Cmd::discard_cmd(4, 0, 4096));
        assert_eq!(rig.acks.acks.borrow()[..], [(3, 0), (4, 0)]);
    }

    #[test]
    fn out_of_range_read_acks_einval() {
        let rig = rig();
        rig.dispatcher.handle(Cmd::read(5, 0, 2, u64::MAX - 8192));
        assert_eq!(rig.acks.acks.borrow()[..], [(5, libc::EINVAL as u16)]);
    }

    #[test]
    fn offline_target_acks_eio_and_keeps_draining() {
        let leaf = MockLeaf::new(1 << 20);
        let target = ublk_engine::raid0::target(
            4096,
            vec![Rc::clone(&leaf) as Rc<dyn RwHandler>],
        );
        let rig = rig_with_target(target);

        leaf.fail_with(IoError::Backing);
        rig.dispatcher.handle(Cmd::read(1, 0, 1, 0));
        leaf.heal();

        // Offline is absorbing: the healthy leaf never sees command 2.
        rig.dispatcher.handle(Cmd::write(2, 0, 1, 0));
        assert_eq!(
            rig.acks.acks.borrow()[..],
            [(1, libc::EIO as u16), (2, libc::EIO as u16)]
        );
        assert_eq!(leaf.writes().len(), 0);
    }
}
