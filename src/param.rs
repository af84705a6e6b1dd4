//! Storage stack parameters and the on-disk layout.
//!
//! Disk layout:
//! [ free-map inode | root dir inode | log ring | log metadata | data ]

use core::mem;
use core::time::Duration;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// First sector of the log ring.
pub const WAL_LOG_START: u32 = 2;

/// Log ring length in sectors (one record per sector).
pub const WAL_LOG_LEN: u32 = 64;

/// Sector of the log metadata.
pub const WAL_META_SECTOR: u32 = WAL_LOG_START + WAL_LOG_LEN;

/// First sector available to the free-map for file data.
pub const DATA_START_SECTOR: u32 = WAL_META_SECTOR + 1;

/// Size of the sector cache.
pub const NBUF: usize = 64;

/// Depth of the best-effort prefetch request queue.
pub const PREFETCH_DEPTH: usize = 16;

/// Interval between periodic cache flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Direct sector pointers per inode.
pub const NDIRECT: usize = 12;

/// Sector pointers per indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / mem::size_of::<u32>();

/// Sector pointers reachable through the double-indirect pointer.
pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;

/// Largest file, in sectors.
pub const MAXFILE_SECTORS: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// Maximum file name length, excluding the NUL terminator.
pub const NAME_MAX: usize = 30;

/// Payload capacity of one log record, in bytes.
pub const WAL_DATA_MAX: usize = 232;

/// In-memory log record buffer, in records.
pub const WAL_BUF_RECORDS: usize = 8;

/// Records written since the last checkpoint before one is requested
/// (75% of the ring).
pub const WAL_CHECKPOINT_THRESHOLD: u64 = (WAL_LOG_LEN as u64 / 4) * 3;

/// Max sectors one transaction may touch through the file API. Keeps a
/// transaction's record count well inside the ring so abort can always
/// find its records.
pub const MAX_TX_SECTORS: usize = 4;

/// Inode magic.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Log metadata magic.
pub const WAL_META_MAGIC: u32 = 0xDEAD_BEEF;
