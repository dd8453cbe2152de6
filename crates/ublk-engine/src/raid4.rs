//! RAID4: striped parity with the parity strip pinned to the last leaf.

use crate::handler::RwHandler;
use crate::raidsp;
use std::rc::Rc;

pub use crate::raidsp::Target;

/// Builds a RAID4 target over `hs`; `hs.len() - 1` data leaves plus the
/// dedicated parity leaf at the end.
pub fn target(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>) -> Rc<Target> {
    let parity_leaf = hs.len() - 1;
    Rc::new(raidsp::Target::new(
        strip_sz,
        hs,
        Box::new(move |_stripe_id| parity_leaf),
    ))
}
