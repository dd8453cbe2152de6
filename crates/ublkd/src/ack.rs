//! The command acknowledger: the only writer of the ack ring.

use crate::uio::{AckQueue, Notifier};
use std::rc::Rc;
use ublk_ring::proto::CmdAck;

/// Where completed commands report their outcome. Abstract so the
/// dispatcher can be exercised without a kernel on the other side.
pub trait AckSink {
    fn complete(&self, id: u16, errno: u16);
}

/// Pushes acks on the shared ring and signals the kernel through the
/// user→kernel UIO fd.
pub struct Acknowledger {
    acks: AckQueue,
    notifier: Rc<Notifier>,
}

impl Acknowledger {
    pub fn new(acks: AckQueue, notifier: Rc<Notifier>) -> Self {
        Self { acks, notifier }
    }
}

impl AckSink for Acknowledger {
    fn complete(&self, id: u16, errno: u16) {
        log::debug!("ack: id={id} err={errno}");
        // The ack ring matches the command ring in depth, so fullness is a
        // transient ordering window; wait it out.
        self.acks.pusher().push_spin(CmdAck::new(id, errno));
        if let Err(err) = self.notifier.notify() {
            log::error!("ack notification failed: {err}");
        }
    }
}
