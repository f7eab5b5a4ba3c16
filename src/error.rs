//! The error taxonomy shared by every layer of the engine (§7).
//!
//! Each variant maps to one of the error kinds spec'd for the core: I/O
//! failure, out-of-memory, out-of-space, corruption, exists, no-entry,
//! not-a-directory, is-a-directory, not-empty, invalid argument.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no free segment")]
    OutOfSpace,

    #[error("corrupt on-disk structure: {0}")]
    Corrupt(String),

    #[error("entry already exists")]
    Exists,

    #[error("no such file or directory")]
    NoEntry,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Maps an engine error to the POSIX errno the adapter should report.
    /// Kept here (rather than duplicated in the adapter) so there is one
    /// place that knows the mapping; uses `libc`'s constants rather than
    /// hand-written literals so the value is correct for whatever target
    /// the crate is actually built for.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(_) => libc::EIO,
            Error::OutOfMemory => libc::ENOMEM,
            Error::OutOfSpace => libc::ENOSPC,
            Error::Corrupt(_) => libc::EIO,
            Error::Exists => libc::EEXIST,
            Error::NoEntry => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::InvalidArgument(_) => libc::EINVAL,
        }
    }
}
