//! Striped parity topologies (RAID4/RAID5 share everything but the parity
//! placement).

mod acceptor;
mod backend;
pub mod parity;

pub use acceptor::Acceptor;
pub use backend::{Backend, ParityMap, StaticCfg};

use crate::error::IoResult;
use crate::fsm::{Gated, TargetState};
use crate::handler::RwHandler;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::rc::Rc;

/// FSM-gated parity target. [`crate::raid4`] and [`crate::raid5`] supply
/// the parity placement.
pub struct Target {
    gated: Gated<Acceptor>,
}

impl Target {
    pub fn new(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>, parity_map: ParityMap) -> Self {
        Self {
            gated: Gated::new(Acceptor::new(strip_sz, hs, parity_map)),
        }
    }

    pub fn state(&self) -> TargetState {
        self.gated.state()
    }

    /// Coherence query, gated like everything else: an offline target
    /// vouches for nothing.
    pub fn is_stripe_parity_coherent(&self, stripe_id: u64) -> bool {
        self.gated.is_online() && self.gated.backend().is_stripe_parity_coherent(stripe_id)
    }
}

impl RwHandler for Target {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        self.gated.submit_read(rq)
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        self.gated.submit_write(wq)
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        self.gated.submit_flush(fq)
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        self.gated.submit_discard(dq)
    }
}
