//! Whole-pipeline test with a simulated kernel side: commands come in
//! through a real ring, payloads through a cell arena, the engine serves a
//! cached RAID5 array, and acks leave through the ack ring.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use ublk_ring::proto::{CellDesc, Cmd, CmdAck};
use ublk_ring::{Popper, Pusher};

use ublk_engine::{cache, raid5, IoBuf, RwHandler};
use ublkd::ack::AckSink;
use ublkd::dispatch::Dispatcher;

const RING_LEN: usize = 16;

/// The four "shared regions", owned by the test, kernel role played inline.
struct FakeKernel {
    cmd_tail: Box<AtomicU32>,
    cmd_slots: Box<[Cmd]>,
    ack_head: Box<AtomicU32>,
    ack_tail: Box<AtomicU32>,
    ack_slots: Box<[CmdAck]>,
}

impl FakeKernel {
    fn new() -> Self {
        Self {
            cmd_tail: Box::new(AtomicU32::new(0)),
            cmd_slots: vec![Cmd::flush(0); RING_LEN].into_boxed_slice(),
            ack_head: Box::new(AtomicU32::new(0)),
            ack_tail: Box::new(AtomicU32::new(0)),
            ack_slots: vec![CmdAck::new(0, 0); RING_LEN].into_boxed_slice(),
        }
    }

    fn submit(&self, cmd: Cmd) {
        let tail = self.cmd_tail.load(Ordering::Relaxed);
        unsafe {
            self.cmd_slots
                .as_ptr()
                .cast_mut()
                .add(tail as usize)
                .write(cmd);
        }
        self.cmd_tail
            .store((tail + 1) % RING_LEN as u32, Ordering::Release);
    }

    fn reap(&self) -> Vec<CmdAck> {
        let mut out = Vec::new();
        loop {
            let head = self.ack_head.load(Ordering::Relaxed);
            if head == self.ack_tail.load(Ordering::Acquire) {
                return out;
            }
            out.push(self.ack_slots[head as usize]);
            self.ack_head
                .store((head + 1) % RING_LEN as u32, Ordering::Release);
        }
    }

    fn popper(&self) -> Popper<Cmd> {
        unsafe {
            Popper::new(
                NonNull::from(self.cmd_tail.as_ref()).cast(),
                NonNull::from(&self.cmd_slots[0]),
                RING_LEN as u32,
                0,
            )
        }
    }

    fn pusher(&self) -> Pusher<CmdAck> {
        unsafe {
            Pusher::new(
                NonNull::from(self.ack_head.as_ref()).cast(),
                NonNull::from(self.ack_tail.as_ref()).cast(),
                NonNull::from(&self.ack_slots[0]),
                RING_LEN as u32,
            )
        }
    }
}

/// Ack sink that pushes straight onto the ack ring (no UIO fd in a test).
struct RingAckSink {
    pusher: Pusher<CmdAck>,
    pushed: RefCell<Vec<u16>>,
}

impl AckSink for RingAckSink {
    fn complete(&self, id: u16, errno: u16) {
        assert!(self.pusher.push(CmdAck::new(id, errno)), "ack ring full");
        self.pushed.borrow_mut().push(id);
    }
}

#[test]
fn commands_flow_ring_to_engine_to_ack_ring() {
    let kernel = FakeKernel::new();
    let popper = kernel.popper();

    // Cached RAID5 over three in-memory leaves.
    let leaves: Vec<Rc<dyn RwHandler>> = (0..3)
        .map(|_| Rc::new(ublk_engine::inmem::InmemTarget::new(1 << 20)) as Rc<dyn RwHandler>)
        .collect();
    let target = cache::cached(raid5::target(4096, leaves), 64, 16 * 1024, true);

    // Cell arena: one 4 KiB segment at 0, a two-cell chain at 8 KiB.
    let arena = IoBuf::alloc(64 * 1024);
    let cellds = vec![
        CellDesc {
            offset: 0,
            data_sz: 4096,
            ncelld: 0,
        },
        CellDesc {
            offset: 8192,
            data_sz: 2048,
            ncelld: 2,
        },
        CellDesc {
            offset: 16384,
            data_sz: 2048,
            ncelld: 0,
        },
    ];

    let ack = Rc::new(RingAckSink {
        pusher: kernel.pusher(),
        pushed: RefCell::new(Vec::new()),
    });
    let ack_probe = Rc::clone(&ack);
    let dispatcher = Dispatcher::new(cellds, arena.clone(), target, ack);

    // Kernel writes a payload into cell 0 and submits WRITE id=1.
    arena.slice(0, 4096).copy_from(&[0xc3; 4096]);
    kernel.submit(Cmd::write(1, 0, 1, 0));
    // And a scattered 4 KiB WRITE id=2 at device offset 4096.
    arena.slice(8192, 2048).copy_from(&[0x11; 2048]);
    arena.slice(16384, 2048).copy_from(&[0x22; 2048]);
    kernel.submit(Cmd::write(2, 1, 2, 4096));
    // Flush id=3 and a READ id=4 of the first 4 KiB back into cell 0.
    kernel.submit(Cmd::flush(3));
    kernel.submit(Cmd::read(4, 0, 1, 0));

    // The worker loop: pop everything, dispatch inline.
    while let Some(cmd) = popper.pop() {
        dispatcher.handle(cmd);
    }

    let acks = kernel.reap();
    assert_eq!(acks.len(), 4);
    assert_eq!(ack_probe.pushed.borrow().len(), 4);
    assert!(acks.iter().all(|a| a.err == 0), "all commands succeeded");
    let mut ids: Vec<u16> = acks.iter().map(|a| a.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    // The read-back observed command 1's payload.
    assert_eq!(arena.slice(0, 4096).to_vec(), vec![0xc3; 4096]);
}

#[test]
fn einval_and_eio_flow_back_as_acks() {
    let kernel = FakeKernel::new();
    let popper = kernel.popper();

    let target = Rc::new(ublk_engine::inmem::InmemTarget::new(8192));
    let arena = IoBuf::alloc(4096);
    let cellds = vec![CellDesc {
        offset: 0,
        data_sz: 4096,
        ncelld: 9, // dangling, only harmful for chains longer than one
    }];

    let ack = Rc::new(RingAckSink {
        pusher: kernel.pusher(),
        pushed: RefCell::new(Vec::new()),
    });
    let dispatcher = Dispatcher::new(cellds, arena.clone(), target, ack);

    // Chain of two descriptors where only one exists -> EINVAL.
    kernel.submit(Cmd::write(1, 0, 2, 0));
    // Write past the 8 KiB device -> EINVAL from the in-memory target.
    kernel.submit(Cmd::write(2, 0, 1, 1 << 20));
    // A well-formed write still succeeds afterwards.
    kernel.submit(Cmd::write(3, 0, 1, 0));

    while let Some(cmd) = popper.pop() {
        dispatcher.handle(cmd);
    }

    let acks = kernel.reap();
    assert_eq!(acks.len(), 3);
    let errs: Vec<(u16, u16)> = acks.iter().map(|a| (a.id, a.err)).collect();
    assert!(errs.contains(&(1, libc::EINVAL as u16)));
    assert!(errs.contains(&(2, libc::EINVAL as u16)));
    assert!(errs.contains(&(3, 0)));
}
