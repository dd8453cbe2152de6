//! The submission interface every layer of a target tree speaks.

use crate::error::{IoError, IoResult};
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::rc::Rc;

/// An asynchronous read/write handler: a leaf store, a RAID dispatcher, a
/// cache, or a whole nested target.
///
/// Submission is asynchronous: `Ok(())` means the query was accepted and its
/// completer will eventually fire exactly once, possibly with an error in
/// the query's slot; a synchronous `Err` means the query was rejected and
/// the completer may fire with that error as well. Handlers are shared —
/// several wrappers may hold the same handler, hence `Rc<dyn RwHandler>`
/// throughout.
pub trait RwHandler {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult;

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult;

    /// Flush everything written so far. Default: nothing staged, succeed.
    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        let _ = fq;
        Ok(())
    }

    /// Drop interest in a device range. Default: not supported.
    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        dq.set_err(IoError::Unsupported);
        Err(IoError::Unsupported)
    }
}
