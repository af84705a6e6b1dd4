//! Durable storage stack: sector cache, inode file system, write-ahead log.
//!
//! Five layers, top to bottom:
//!   + Files: byte-oriented handles with positions and write-deny.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Inodes: length, block map, link count.
//!   + Free-map: persistent allocation bitmap, one bit per sector.
//!   + Sector cache: write-back, clock eviction, load coalescing.
//!
//! A write-ahead log runs beside the stack on a bypass path straight to the
//! device. Every mutating file operation logs old and new bytes before the
//! cache sees the new ones; commit flushes the log, and recovery replays
//! committed transactions forward and uncommitted ones backward. After any
//! crash the persistent image reflects exactly the committed set.
//!
//! All shared state hangs off a single [`FileSys`] value; there are no
//! process-wide globals.

pub mod bio;
pub mod disk;
pub mod file;
pub mod fs;
pub mod lock;
pub mod param;

pub use bio::{Bcache, CacheStats};
pub use disk::{BlockDevice, MemDisk};
pub use file::File;
pub use fs::dir::Dir;
pub use fs::wal::{Wal, WalStats};
pub use fs::{FileSys, Tx};

/// Errors surfaced by storage operations.
///
/// Programming faults (lock misuse, double release, bad magic on a sector
/// the stack itself wrote) are not represented here; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No space left on the device.
    NoSpace,
    /// No such file or directory entry.
    NotFound,
    /// A directory entry with this name already exists.
    AlreadyExists,
    /// The operation requires a directory.
    NotDirectory,
    /// The operation does not apply to a directory.
    IsDirectory,
    /// The directory still has entries besides "." and "..".
    DirectoryNotEmpty,
    /// Name longer than [`param::NAME_MAX`].
    NameTooLong,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoSpace => write!(f, "no space left on device"),
            Error::NotFound => write!(f, "no such file or directory"),
            Error::AlreadyExists => write!(f, "file exists"),
            Error::NotDirectory => write!(f, "not a directory"),
            Error::IsDirectory => write!(f, "is a directory"),
            Error::DirectoryNotEmpty => write!(f, "directory not empty"),
            Error::NameTooLong => write!(f, "file name too long"),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
