//! Error taxonomy of the engine.
//!
//! Errors are classified by kind, not by origin: everything a completer can
//! observe boils down to one of these, and the only thing the kernel ever
//! sees is the errno produced by [`IoError::errno`].

use thiserror::Error;

/// Error carried by queries and returned by submission paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    /// A backing store failed the I/O. Flips the owning target offline.
    #[error("backing store I/O failure")]
    Backing,

    /// The request falls outside the configured device capacity.
    #[error("request outside device bounds")]
    OutOfBounds,

    /// The command's cell chain was malformed.
    #[error("malformed cell chain")]
    BadCells,

    /// The operation is not supported by this target.
    #[error("operation not supported")]
    Unsupported,

    /// The target has absorbed a failure and rejects everything.
    #[error("target is offline")]
    Offline,

    /// Raw OS errno surfaced by a leaf file handler.
    #[error("os error {0}")]
    Os(i32),
}

impl IoError {
    /// Maps the error to the POSIX errno carried in an ack record.
    pub fn errno(self) -> u16 {
        match self {
            Self::Backing | Self::Offline => libc::EIO as u16,
            Self::OutOfBounds | Self::BadCells => libc::EINVAL as u16,
            Self::Unsupported => libc::ENOTSUP as u16,
            Self::Os(errno) => errno as u16,
        }
    }
}

/// Shorthand for the engine's submission results.
pub type IoResult<T = ()> = Result<T, IoError>;
