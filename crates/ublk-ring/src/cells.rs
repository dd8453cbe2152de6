use crate::proto::CellDesc;
use std::ops::Range;
use thiserror::Error;

/// Errors produced while walking a cell chain.
///
/// Both map to `EINVAL` at the command boundary: the chain came from the
/// kernel, so a malformed one is a validation failure of the single command,
/// never a device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CellsError {
    /// A descriptor index escaped the descriptor table.
    #[error("cell descriptor {index} outside table of {table_len}")]
    BadIndex { index: u32, table_len: usize },
    /// A segment escaped the byte arena.
    #[error("cell segment [{offset}, +{len}) escapes arena of {arena_len} bytes")]
    OutOfArena { offset: u32, len: u32, arena_len: usize },
}

/// Iterator over the arena segments of one command's cell chain.
///
/// Yields the byte range of each segment inside the `cells` arena, in chain
/// order. The caller pairs the ranges with the running device offset; the
/// chain itself carries only arena coordinates.
pub struct CellChain<'a> {
    cellds: &'a [CellDesc],
    arena_len: usize,
    next: u32,
    remaining: u32,
}

impl<'a> CellChain<'a> {
    /// Starts a walk at descriptor `fcdn`, visiting `cds_nr` descriptors.
    pub fn new(fcdn: u32, cds_nr: u32, cellds: &'a [CellDesc], arena_len: usize) -> Self {
        Self {
            cellds,
            arena_len,
            next: fcdn,
            remaining: cds_nr,
        }
    }
}

impl Iterator for CellChain<'_> {
    type Item = Result<Range<usize>, CellsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let Some(celld) = self.cellds.get(self.next as usize) else {
            self.remaining = 0;
            return Some(Err(CellsError::BadIndex {
                index: self.next,
                table_len: self.cellds.len(),
            }));
        };

        let start = celld.offset as usize;
        let end = start + celld.data_sz as usize;
        if end > self.arena_len {
            self.remaining = 0;
            return Some(Err(CellsError::OutOfArena {
                offset: celld.offset,
                len: celld.data_sz,
                arena_len: self.arena_len,
            }));
        }

        self.remaining -= 1;
        self.next = celld.ncelld;
        Some(Ok(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(offset: u32, data_sz: u32, ncelld: u32) -> CellDesc {
        CellDesc {
            offset,
            data_sz,
            ncelld,
        }
    }

    #[test]
    fn walks_a_linked_chain_in_order() {
        // Chain 2 -> 0 -> 1, one stray descriptor unused.
        let cellds = [
            desc(100, 10, 1),
            desc(200, 20, 7),
            desc(0, 50, 0),
            desc(999, 1, 0),
        ];
        let segs: Result<Vec<_>, _> = CellChain::new(2, 3, &cellds, 4096).collect();
        assert_eq!(segs.unwrap(), vec![0..50, 100..110, 200..220]);
    }

    #[test]
    fn stops_after_cds_nr_descriptors() {
        let cellds = [desc(0, 8, 1), desc(8, 8, 0)];
        let segs: Result<Vec<_>, _> = CellChain::new(0, 1, &cellds, 64).collect();
        assert_eq!(segs.unwrap(), vec![0..8]);
    }

    #[test]
    fn rejects_a_segment_escaping_the_arena() {
        let cellds = [desc(0, 8, 1), desc(60, 8, 0)];
        let mut chain = CellChain::new(0, 2, &cellds, 64);
        assert_eq!(chain.next(), Some(Ok(0..8)));
        assert!(matches!(
            chain.next(),
            Some(Err(CellsError::OutOfArena { offset: 60, len: 8, .. }))
        ));
        // The walk is poisoned after an error.
        assert_eq!(chain.next(), None);
    }

    #[test]
    fn rejects_a_dangling_chain_index() {
        let cellds = [desc(0, 8, 9)];
        let mut chain = CellChain::new(0, 2, &cellds, 64);
        assert_eq!(chain.next(), Some(Ok(0..8)));
        assert!(matches!(
            chain.next(),
            Some(Err(CellsError::BadIndex { index: 9, .. }))
        ));
    }

    #[test]
    fn empty_chain_yields_nothing() {
        let cellds = [desc(0, 8, 0)];
        assert_eq!(CellChain::new(0, 0, &cellds, 64).count(), 0);
    }
}
