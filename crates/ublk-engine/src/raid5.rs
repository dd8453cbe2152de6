//! RAID5: striped parity rotated across the leaves.

use crate::handler::RwHandler;
use crate::raidsp;
use std::rc::Rc;

pub use crate::raidsp::Target;

/// Builds a RAID5 target over `hs`; stripe `s` keeps its parity on leaf
/// `len - (s mod len) - 1`, walking backwards one leaf per stripe.
pub fn target(strip_sz: u64, hs: Vec<Rc<dyn RwHandler>>) -> Rc<Target> {
    let leaves = hs.len();
    Rc::new(raidsp::Target::new(
        strip_sz,
        hs,
        Box::new(move |stripe_id| leaves - (stripe_id as usize % leaves) - 1),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::IoBuf;
    use crate::query::WriteQuery;
    use crate::testing::MockLeaf;

    #[test]
    fn parity_walks_backwards_one_leaf_per_stripe() {
        let leaves: Vec<Rc<MockLeaf>> = (0..3).map(|_| MockLeaf::new(16 * 1024)).collect();
        let hs = leaves
            .iter()
            .map(|l| Rc::clone(l) as Rc<dyn RwHandler>)
            .collect();
        let target = target(512, hs);

        // Three full stripes; parity leaves must be 2, 1, 0 in turn.
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(vec![0x5c; 3072]), 0))
            .unwrap();

        for (stripe, parity_leaf) in [(0usize, 2usize), (1, 1), (2, 0)] {
            let lo = stripe * 512;
            let hi = lo + 512;
            // Two identical data strips XOR to zero.
            assert_eq!(leaves[parity_leaf].mem()[lo..hi], vec![0u8; 512][..]);
            assert!(target.is_stripe_parity_coherent(stripe as u64));
        }
    }
}
