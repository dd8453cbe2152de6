//! Flat-file leaf target.
//!
//! Positional reads and writes against one backing file. Completion is
//! synchronous and inline: the query model only requires that the completer
//! fires exactly once, not that submission returns first. Reads past the
//! end of file zero-fill the remainder, so a sparse or freshly-created
//! backing file behaves like a zeroed device.

use crate::error::{IoError, IoResult};
use crate::handler::RwHandler;
use crate::query::{DiscardQuery, FlushQuery, ReadQuery, WriteQuery};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::rc::Rc;

pub struct FileTarget {
    file: File,
}

impl FileTarget {
    /// Opens (or creates) the backing file for read/write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    fn read_full_at(&self, buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset) {
                // EOF: the tail of a sparse device reads as zeroes.
                Ok(0) => {
                    buf[filled..].fill(0);
                    break;
                }
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn os_error(err: &io::Error) -> IoError {
    match err.raw_os_error() {
        Some(errno) => IoError::Os(errno),
        None => IoError::Backing,
    }
}

impl RwHandler for FileTarget {
    fn submit_read(&self, rq: Rc<ReadQuery>) -> IoResult {
        let offset = rq.offset();
        let result = rq.buf().with_mut(|buf| self.read_full_at(buf, offset));
        if let Err(err) = result {
            rq.set_err(os_error(&err));
        }
        Ok(())
    }

    fn submit_write(&self, wq: Rc<WriteQuery>) -> IoResult {
        let offset = wq.offset();
        let result = wq.buf().with(|buf| self.file.write_all_at(buf, offset));
        if let Err(err) = result {
            wq.set_err(os_error(&err));
        }
        Ok(())
    }

    fn submit_flush(&self, fq: Rc<FlushQuery>) -> IoResult {
        if let Err(err) = self.file.sync_all() {
            fq.set_err(os_error(&err));
        }
        Ok(())
    }

    fn submit_discard(&self, dq: Rc<DiscardQuery>) -> IoResult {
        dq.set_err(IoError::Unsupported);
        Err(IoError::Unsupported)
    }
}
