//! Structured error types for the capture loader
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open capture file {}", .path.display())]
    IoOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unexpected end of capture stream at byte {offset}")]
    IoShortRead { offset: u64 },

    #[error("i/o error reading capture stream")]
    Io(#[from] io::Error),

    #[error("capture header is malformed")]
    FormatMagic,

    #[error("unsupported capture version {high}.{low}")]
    VersionUnsupported { high: u8, low: u8 },

    #[error("corrupt record at byte {offset}: {what}")]
    CorruptRecord { offset: u64, what: String },

    #[error("global statistics failed verification")]
    Invariant,

    #[error("capture contains no valid operations")]
    NoOperations,
}

impl CaptureError {
    /// Map a mid-stream i/o failure: a short read gets its own variant
    /// carrying the stream offset.
    #[must_use]
    pub fn from_stream_io(err: io::Error, offset: u64) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CaptureError::IoShortRead { offset }
        } else {
            CaptureError::Io(err)
        }
    }
}

/// How a load ended when it did not fail outright.
///
/// `Partial` means the stream truncated or corrupted near its end but
/// enough operations were recovered to analyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Complete,
    Partial,
}
