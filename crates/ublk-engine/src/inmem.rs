//! In-memory leaf target.
//!
//! A flat byte store with the capacity fixed at construction. Completions
//! are synchronous; requests past the configured capacity are rejected with
//! a per-command validation error.

use crate::buf::IoBuf;
use crate::error::{IoError, IoResult};
use crate::handler::RwHandler;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::rc::Rc;

pub struct InmemTarget {
    mem: IoBuf,
}

impl InmemTarget {
    /// Zero-filled store of `size` bytes.
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            mem: IoBuf::alloc(size),
        }
    }

    fn range(&self, offset: u64, len: usize) -> Result<IoBuf, IoError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(IoError::OutOfBounds)?;
        if end > self.mem.len() as u64 {
            return Err(IoError::OutOfBounds);
        }
        Ok(self.mem.slice(offset as usize, len))
    }
}

impl RwHandler for InmemTarget {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        match self.range(rq.offset(), rq.buf().len()) {
            Ok(src) => {
                rq.buf().copy_from_buf(&src);
                Ok(())
            }
            Err(err) => {
                rq.set_err(err);
                Err(err)
            }
        }
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        match self.range(wq.offset(), wq.buf().len()) {
            Ok(dst) => {
                dst.copy_from_buf(wq.buf());
                Ok(())
            }
            Err(err) => {
                wq.set_err(err);
                Err(err)
            }
        }
    }

    fn submit_flush(&self, _fq: Rc<FlushQuery>) -> IoResult {
        Ok(())
    }

    /// Discarded ranges read back as zeroes.
    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        match self.range(dq.offset(), dq.len() as usize) {
            Ok(range) => {
                range.fill_zero();
                Ok(())
            }
            Err(err) => {
                dq.set_err(err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let target = InmemTarget::new(4096);
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(vec![0x42; 512]), 1024))
            .unwrap();

        let buf = IoBuf::alloc(512);
        target.submit_read(ReadQuery::new(buf.clone(), 1024)).unwrap();
        assert_eq!(buf.to_vec(), vec![0x42; 512]);
    }

    #[test]
    fn out_of_range_request_is_einval() {
        let target = InmemTarget::new(1024);
        let rq = ReadQuery::new(IoBuf::alloc(512), 768);
        assert_eq!(target.submit_read(Rc::clone(&rq)), Err(IoError::OutOfBounds));
        assert_eq!(rq.err(), Some(IoError::OutOfBounds));
        assert_eq!(IoError::OutOfBounds.errno(), libc::EINVAL as u16);
    }

    #[test]
    fn discard_zeroes_the_range() {
        let target = InmemTarget::new(2048);
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(vec![0xff; 2048]), 0))
            .unwrap();
        target.submit_discard(DiscardQuery::new(512, 1024)).unwrap();

        let buf = IoBuf::alloc(2048);
        target.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();
        let bytes = buf.to_vec();
        assert_eq!(bytes[..512], vec![0xff; 512][..]);
        assert_eq!(bytes[512..1536], vec![0; 1024][..]);
        assert_eq!(bytes[1536..], vec![0xff; 512][..]);
    }

    #[test]
    fn flush_is_a_no_op_success() {
        let target = InmemTarget::new(64);
        assert!(target.submit_flush(FlushQuery::new()).is_ok());
    }
}
