//! Inodes.
//!
//! An inode describes a single unnamed file: its type, length, link count,
//! and the sectors holding its content. The on-disk inode is exactly one
//! sector, identified by its sector number, and carries a magic that is
//! validated on every load.
//!
//! The first NDIRECT content sectors are listed in the inode itself. The
//! next NINDIRECT are listed in the single-indirect sector, and the rest
//! hang off the double-indirect sector, one inner indirect at a time. A
//! zero pointer means the slot is unallocated, which is only meaningful
//! while a file is being extended.
//!
//! The in-memory side keeps a table of open inodes, keyed by sector, so
//! that two opens of the same inode share one instance. An entry carries
//! the open count, the removed flag, and the write-deny count; it is
//! created on first open and destroyed when the count drops to zero. If
//! the inode was removed meanwhile, the last close releases every sector
//! reachable from it, then the inode sector itself.
//!
//! Lock order: the table lock comes before any inode lock; both come
//! before the cache. Data copies run without the inode lock, after the
//! sector map for the request has been computed under it.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::{FileSys, Tx};
use crate::param::{INODE_MAGIC, MAXFILE_SECTORS, NDIRECT, NINDIRECT, SECTOR_SIZE};
use crate::{Error, Result};

fn acquire<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum InodeType {
    File = 1,
    Dir = 2,
    Symlink = 3,
}

impl InodeType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::File),
            2 => Some(Self::Dir),
            3 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// On-disk inode structure, exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    pub(crate) magic: u32,
    pub(crate) typ: u32,
    pub(crate) nlink: u32,
    /// File length in bytes.
    pub(crate) length: u32,
    pub(crate) direct: [u32; NDIRECT],
    pub(crate) indirect: u32,
    pub(crate) dindirect: u32,
    pub(crate) _unused: [u8; 440],
}

const_assert!(mem::size_of::<Dinode>() == SECTOR_SIZE);

impl Dinode {
    pub(crate) fn new(typ: InodeType) -> Self {
        Self {
            magic: INODE_MAGIC,
            typ: typ as u32,
            nlink: 0,
            length: 0,
            direct: [0; NDIRECT],
            indirect: 0,
            dindirect: 0,
            _unused: [0; 440],
        }
    }
}

pub(crate) struct InodeInner {
    pub open_cnt: u32,
    pub removed: bool,
    pub deny_write_cnt: u32,
    /// Cached copy of the on-disk inode.
    pub disk: Dinode,
}

/// An open inode.
pub struct Inode {
    pub sector: u32,
    inner: Mutex<InodeInner>,
}

/// The table of open inodes, keyed by sector number.
pub struct Itable {
    map: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the inode at `sector`. The first open reads it from the cache
    /// and validates its magic; reopening only bumps the open count.
    pub fn open(&self, fs: &FileSys, sector: u32) -> Arc<Inode> {
        let mut map = acquire(&self.map);
        if let Some(ip) = map.get(&sector) {
            acquire(&ip.inner).open_cnt += 1;
            return Arc::clone(ip);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        fs.cache().read(sector, &mut buf);
        let disk = Dinode::read_from(&buf[..]).expect("inode is one sector");
        assert_eq!(disk.magic, INODE_MAGIC, "inode: bad magic");
        let ip = Arc::new(Inode {
            sector,
            inner: Mutex::new(InodeInner {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
                disk,
            }),
        });
        map.insert(sector, Arc::clone(&ip));
        ip
    }

    /// Drops one open reference. The last close destroys the in-memory
    /// inode; if it was removed, its contents and its sector go back to
    /// the free-map.
    pub fn close(&self, fs: &FileSys, ip: Arc<Inode>) {
        let mut map = acquire(&self.map);
        let mut inner = acquire(&ip.inner);
        assert!(inner.open_cnt >= 1, "inode: close without open");
        inner.open_cnt -= 1;
        if inner.open_cnt > 0 {
            return;
        }
        map.remove(&ip.sector);
        let removed = inner.removed;
        let disk = inner.disk;
        drop(inner);
        drop(map);
        if removed {
            release_contents(fs, &disk);
            fs.freemap().release(fs, ip.sector, 1);
        }
    }

    /// Number of inodes currently open.
    pub fn open_inodes(&self) -> usize {
        acquire(&self.map).len()
    }
}

impl Inode {
    fn inner(&self) -> MutexGuard<'_, InodeInner> {
        acquire(&self.inner)
    }

    pub fn length(&self) -> u32 {
        self.inner().disk.length
    }

    pub fn typ(&self) -> InodeType {
        InodeType::from_raw(self.inner().disk.typ).expect("inode: bad type")
    }

    pub fn nlink(&self) -> u32 {
        self.inner().disk.nlink
    }

    /// Marks the inode for removal; its storage is released at last close.
    pub(crate) fn set_removed(&self) {
        self.inner().removed = true;
    }

    /// While the deny count is positive, writes return 0 bytes. Used to
    /// protect running executables.
    pub fn deny_write(&self) {
        self.inner().deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner();
        assert!(inner.deny_write_cnt > 0, "inode: allow without deny");
        inner.deny_write_cnt -= 1;
    }

    /// Adds `delta` to the link count, rewrites the inode sector, and
    /// returns the new count.
    pub(crate) fn adjust_nlink(&self, tx: &mut Tx<'_>, delta: i32) -> u32 {
        let mut inner = self.inner();
        let nlink = inner.disk.nlink as i64 + delta as i64;
        assert!(nlink >= 0, "inode: negative link count");
        inner.disk.nlink = nlink as u32;
        self.update(tx, &inner);
        inner.disk.nlink
    }

    /// Copies up to `buf.len()` bytes at `offset` into `buf`, stopping at
    /// end of file. Returns the number of bytes copied.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: u32) -> usize {
        let inner = self.inner();
        let length = inner.disk.length;
        if offset >= length || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min((length - offset) as usize);
        let chunks = map_range(fs, &inner.disk, offset, n);
        // Hint the sector after the last one this read touches.
        let next_block = (offset as usize + n) / SECTOR_SIZE;
        let readahead = (next_block * SECTOR_SIZE < length as usize)
            .then(|| byte_to_sector(fs, &inner.disk, next_block));
        drop(inner);

        let mut done = 0;
        for (sector, sector_off, len) in chunks {
            fs.cache().read_at(sector, &mut buf[done..done + len], sector_off);
            done += len;
        }
        if let Some(sector) = readahead {
            fs.cache().request_prefetch(sector);
        }
        done
    }

    /// Writes `buf` at `offset`, extending the file first when the write
    /// lands past end of file. Returns the number of bytes written: 0 when
    /// writes are denied or the extension ran out of space.
    pub fn write_at(&self, tx: &mut Tx<'_>, buf: &[u8], offset: u32) -> usize {
        let fs = tx.fs();
        let mut inner = self.inner();
        if inner.deny_write_cnt > 0 {
            return 0;
        }
        let end = offset as usize + buf.len();
        assert!(end <= MAXFILE_SECTORS * SECTOR_SIZE, "inode: file too large");
        if end as u32 > inner.disk.length && self.extend(tx, &mut inner, end as u32).is_err() {
            return 0;
        }
        let chunks = map_range(fs, &inner.disk, offset, buf.len());
        drop(inner);

        let mut done = 0;
        for (sector, sector_off, len) in chunks {
            tx.write_at(sector, sector_off, &buf[done..done + len]);
            done += len;
        }
        done
    }

    /// Grows the file to hold at least `new_len` bytes.
    pub(crate) fn extend_to(&self, tx: &mut Tx<'_>, new_len: u32) -> Result<()> {
        let mut inner = self.inner();
        if new_len <= inner.disk.length {
            return Ok(());
        }
        self.extend(tx, &mut inner, new_len)
    }

    /// Write path for the free-map file only: installs bytes straight into
    /// the cache, with no logging and no extension.
    pub(crate) fn write_at_raw(&self, fs: &FileSys, buf: &[u8], offset: u32) {
        let inner = self.inner();
        assert!(
            offset as usize + buf.len() <= inner.disk.length as usize,
            "raw write past end of file"
        );
        let chunks = map_range(fs, &inner.disk, offset, buf.len());
        drop(inner);
        let mut done = 0;
        for (sector, sector_off, len) in chunks {
            fs.cache().write(sector, &buf[done..done + len], sector_off);
            done += len;
        }
    }

    /// Rewrites the inode sector from the cached copy. Must run after every
    /// change to a field that lives on disk.
    pub(crate) fn update(&self, tx: &mut Tx<'_>, inner: &InodeInner) {
        tx.write_at(self.sector, 0, inner.disk.as_bytes());
    }

    /// Allocates and zero-fills sectors one at a time until the file holds
    /// `new_len` bytes, then updates the length and rewrites the inode
    /// sector. On failure nothing is rolled back: pointers already
    /// installed stay reachable and are released when the inode is
    /// removed.
    fn extend(&self, tx: &mut Tx<'_>, inner: &mut InodeInner, new_len: u32) -> Result<()> {
        let fs = tx.fs();
        let old_blocks = sectors_needed(inner.disk.length);
        let new_blocks = sectors_needed(new_len);
        for block in old_blocks..new_blocks {
            let sector = fs.freemap().allocate(fs, 1).ok_or(Error::NoSpace)?;
            tx.zero_sector(sector);
            if let Err(e) = self.install_block(tx, inner, block, sector) {
                // The data sector was never linked in; give it back.
                fs.freemap().release(fs, sector, 1);
                return Err(e);
            }
        }
        inner.disk.length = new_len;
        self.update(tx, inner);
        Ok(())
    }

    /// Links `sector` in as content block `block`: a remaining direct slot,
    /// then the indirect sector, then the double-indirect tree.
    fn install_block(
        &self,
        tx: &mut Tx<'_>,
        inner: &mut InodeInner,
        block: usize,
        sector: u32,
    ) -> Result<()> {
        let fs = tx.fs();
        if block < NDIRECT {
            inner.disk.direct[block] = sector;
            return Ok(());
        }
        let block = block - NDIRECT;
        if block < NINDIRECT {
            if inner.disk.indirect == 0 {
                inner.disk.indirect = alloc_ptr_sector(tx)?;
            }
            write_ptr(tx, inner.disk.indirect, block, sector);
            return Ok(());
        }
        let block = block - NINDIRECT;
        if inner.disk.dindirect == 0 {
            inner.disk.dindirect = alloc_ptr_sector(tx)?;
        }
        let mut ind = read_ptr(fs, inner.disk.dindirect, block / NINDIRECT);
        if ind == 0 {
            ind = alloc_ptr_sector(tx)?;
            write_ptr(tx, inner.disk.dindirect, block / NINDIRECT, ind);
        }
        write_ptr(tx, ind, block % NINDIRECT, sector);
        Ok(())
    }
}

fn sectors_needed(len: u32) -> usize {
    (len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Translates a content block index to its sector. Every pointer on the
/// way must already be allocated.
fn byte_to_sector(fs: &FileSys, disk: &Dinode, block: usize) -> u32 {
    assert!(block < MAXFILE_SECTORS, "inode: block out of range");
    let sector = if block < NDIRECT {
        disk.direct[block]
    } else if block < NDIRECT + NINDIRECT {
        assert_ne!(disk.indirect, 0, "inode: missing indirect sector");
        read_ptr(fs, disk.indirect, block - NDIRECT)
    } else {
        let block = block - NDIRECT - NINDIRECT;
        assert_ne!(disk.dindirect, 0, "inode: missing double-indirect sector");
        let ind = read_ptr(fs, disk.dindirect, block / NINDIRECT);
        assert_ne!(ind, 0, "inode: missing inner indirect sector");
        read_ptr(fs, ind, block % NINDIRECT)
    };
    assert_ne!(sector, 0, "inode: unallocated block");
    sector
}

/// Splits a byte range into per-sector chunks `(sector, offset, len)`.
fn map_range(fs: &FileSys, disk: &Dinode, offset: u32, n: usize) -> Vec<(u32, usize, usize)> {
    let mut chunks = Vec::new();
    let mut off = offset as usize;
    let mut remaining = n;
    while remaining > 0 {
        let sector_off = off % SECTOR_SIZE;
        let len = remaining.min(SECTOR_SIZE - sector_off);
        chunks.push((byte_to_sector(fs, disk, off / SECTOR_SIZE), sector_off, len));
        off += len;
        remaining -= len;
    }
    chunks
}

fn read_ptr(fs: &FileSys, sector: u32, idx: usize) -> u32 {
    let mut buf = [0u8; 4];
    fs.cache().read_at(sector, &mut buf, idx * 4);
    u32::from_ne_bytes(buf)
}

fn write_ptr(tx: &mut Tx<'_>, sector: u32, idx: usize, value: u32) {
    tx.write_at(sector, idx * 4, &value.to_ne_bytes());
}

fn alloc_ptr_sector(tx: &mut Tx<'_>) -> Result<u32> {
    let fs = tx.fs();
    let sector = fs.freemap().allocate(fs, 1).ok_or(Error::NoSpace)?;
    tx.zero_sector(sector);
    Ok(sector)
}

/// Releases every sector reachable from the inode: direct pointers, both
/// indirect levels, and the pointer sectors themselves.
fn release_contents(fs: &FileSys, disk: &Dinode) {
    for &sector in &disk.direct {
        if sector != 0 {
            fs.freemap().release(fs, sector, 1);
        }
    }
    if disk.indirect != 0 {
        release_indirect(fs, disk.indirect);
    }
    if disk.dindirect != 0 {
        for i in 0..NINDIRECT {
            let ind = read_ptr(fs, disk.dindirect, i);
            if ind != 0 {
                release_indirect(fs, ind);
            }
        }
        fs.freemap().release(fs, disk.dindirect, 1);
    }
}

fn release_indirect(fs: &FileSys, sector: u32) {
    for i in 0..NINDIRECT {
        let ptr = read_ptr(fs, sector, i);
        if ptr != 0 {
            fs.freemap().release(fs, ptr, 1);
        }
    }
    fs.freemap().release(fs, sector, 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dinode_is_one_sector() {
        assert_eq!(mem::size_of::<Dinode>(), SECTOR_SIZE);
        let d = Dinode::new(InodeType::File);
        assert_eq!(d.magic, INODE_MAGIC);
        assert_eq!(InodeType::from_raw(d.typ), Some(InodeType::File));
    }

    #[test]
    fn sectors_needed_rounds_up() {
        assert_eq!(sectors_needed(0), 0);
        assert_eq!(sectors_needed(1), 1);
        assert_eq!(sectors_needed(512), 1);
        assert_eq!(sectors_needed(513), 2);
        assert_eq!(sectors_needed(514), 2);
    }
}
