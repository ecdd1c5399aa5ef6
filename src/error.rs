//! Error kinds returned by the engine.
//!
//! Mirrors the POSIX-shaped error surface the original filesystem exposes to
//! its VFS layer, plus a handful of index/allocator specific kinds that are
//! non-fatal to the caller.

use thiserror::Error;

/// Crate-wide result alias, the `bfs` equivalent of the teacher's `IOResult<T>`.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    BadValue,

    #[error("on-disk structure failed an invariant check")]
    BadData,

    #[error("block device I/O error")]
    IoError,

    #[error("allocation failure")]
    NoMemory,

    #[error("entry not found")]
    EntryNotFound,

    #[error("name already in use")]
    NameInUse,

    #[error("is a directory")]
    IsADirectory,

    #[error("not a directory")]
    NotADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("file exists")]
    FileExists,

    #[error("operation not allowed")]
    NotAllowed,

    #[error("device is read-only")]
    ReadOnlyDevice,

    #[error("device is full")]
    DeviceFull,

    #[error("buffer overflow")]
    BufferOverflow,

    #[error("index has the wrong key type")]
    BadType,

    #[error("no such index")]
    BadIndex,
}

impl Error {
    /// True for the two index-layer errors that §7 says must be swallowed:
    /// the namespace operation that triggered them still succeeds.
    pub fn is_index_non_fatal(&self) -> bool {
        matches!(self, Error::BadIndex | Error::EntryNotFound)
    }
}
