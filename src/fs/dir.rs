//! Directories.
//!
//! A directory is an inode whose content is a sequence of fixed-size
//! entries (inode sector, name, in-use flag). "." and ".." are ordinary
//! entries installed at creation; the root's ".." names the root itself.
//! Entry lookup is a linear scan, and lookup-then-add is deliberately not
//! atomic.

use std::mem;
use std::sync::Arc;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::inode::{Dinode, Inode, InodeType};
use crate::fs::{FileSys, Tx};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};
use crate::{Error, Result};

/// Size of one directory entry on disk.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct Dirent {
    sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const_assert!(mem::size_of::<Dirent>() == 36);

impl Dirent {
    fn new(sector: u32, name: &str) -> Self {
        debug_assert!(name.len() <= NAME_MAX);
        let mut entry = Self {
            sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    /// The name bytes, without the NUL padding.
    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn is_dot(&self) -> bool {
        self.name_bytes() == b"." || self.name_bytes() == b".."
    }
}

fn validate(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::NotFound);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(name)
}

/// A handle on an open directory, with a cursor for [`Dir::readdir`].
pub struct Dir {
    inode: Arc<Inode>,
    pos: u32,
}

impl Dir {
    /// Wraps an already-open inode. The handle owns the open reference and
    /// must be closed.
    pub(crate) fn new(inode: Arc<Inode>) -> Result<Self> {
        if inode.typ() != InodeType::Dir {
            return Err(Error::NotDirectory);
        }
        Ok(Self { inode, pos: 0 })
    }

    pub fn open_root(fs: &FileSys) -> Dir {
        Dir::new(fs.itable().open(fs, ROOT_DIR_SECTOR)).expect("root is a directory")
    }

    /// Opens the directory whose inode lives at `sector`.
    pub fn open(fs: &FileSys, sector: u32) -> Result<Dir> {
        let inode = fs.itable().open(fs, sector);
        Dir::new(Arc::clone(&inode)).map_err(|e| {
            fs.itable().close(fs, inode);
            e
        })
    }

    pub fn close(self, fs: &FileSys) {
        fs.itable().close(fs, self.inode);
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Finds the in-use entry with exactly this name and returns its inode
    /// sector.
    pub fn lookup(&self, fs: &FileSys, name: &str) -> Option<u32> {
        self.scan(fs, |entry| {
            (entry.in_use != 0 && entry.name_bytes() == name.as_bytes()).then_some(entry.sector)
        })
        .map(|(_, sector)| sector)
    }

    /// Adds an entry, rejecting duplicate names. The entry lands in the
    /// first not-in-use slot, or at end of file. The target gains a link.
    pub fn add(&self, fs: &FileSys, tx: &mut Tx<'_>, name: &str, sector: u32) -> Result<()> {
        let name = validate(name)?;
        if self.lookup(fs, name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let slot = self
            .scan(fs, |entry| (entry.in_use == 0).then_some(()))
            .map(|(idx, ())| idx)
            .unwrap_or(self.entry_count());

        let entry = Dirent::new(sector, name);
        if self.write_entry(tx, slot, &entry) != DIRENT_SIZE {
            return Err(Error::NoSpace);
        }
        let target = fs.itable().open(fs, sector);
        target.adjust_nlink(tx, 1);
        fs.itable().close(fs, target);
        Ok(())
    }

    /// Clears the entry's in-use flag and drops the target's link. At link
    /// count zero the target is marked for removal; its storage goes when
    /// the last open reference does.
    pub fn remove(&self, fs: &FileSys, tx: &mut Tx<'_>, name: &str) -> Result<()> {
        let name = validate(name)?;
        if name == "." || name == ".." {
            return Err(Error::NotFound);
        }
        let (idx, mut entry) = self
            .scan(fs, |entry| {
                (entry.in_use != 0 && entry.name_bytes() == name.as_bytes()).then_some(*entry)
            })
            .ok_or(Error::NotFound)?;

        let target = fs.itable().open(fs, entry.sector);
        if target.typ() == InodeType::Dir && !is_dir_empty(fs, &target) {
            fs.itable().close(fs, target);
            return Err(Error::DirectoryNotEmpty);
        }

        entry.in_use = 0;
        let written = self.write_entry(tx, idx, &entry);
        assert_eq!(written, DIRENT_SIZE, "dir: entry rewrite");
        if target.adjust_nlink(tx, -1) == 0 {
            target.set_removed();
        }
        fs.itable().close(fs, target);
        Ok(())
    }

    /// Returns the next entry name, skipping "." and "..".
    pub fn readdir(&mut self, fs: &FileSys) -> Option<String> {
        while self.pos < self.entry_count() {
            let idx = self.pos;
            self.pos += 1;
            if let Some(entry) = self.entry_at(fs, idx) {
                if entry.in_use != 0 && !entry.is_dot() {
                    return Some(String::from_utf8_lossy(entry.name_bytes()).into_owned());
                }
            }
        }
        None
    }

    /// True iff only "." and ".." remain.
    pub fn is_empty(&self, fs: &FileSys) -> bool {
        is_dir_empty(fs, &self.inode)
    }

    /// Creates a directory inode at `sector` with "." and ".." installed,
    /// and room preallocated for `entry_cnt` more entries. The caller links
    /// it into its parent (the root is never linked anywhere).
    pub fn create_with_parent(
        fs: &FileSys,
        tx: &mut Tx<'_>,
        sector: u32,
        parent: u32,
        entry_cnt: u32,
    ) -> Result<()> {
        let dinode = Dinode::new(InodeType::Dir);
        tx.write_at(sector, 0, dinode.as_bytes());

        let inode = fs.itable().open(fs, sector);
        let result = (|| {
            // No link count for either dot entry, so a directory cannot
            // keep itself alive through ".".
            let dot = Dirent::new(sector, ".");
            let dotdot = Dirent::new(parent, "..");
            if inode.write_at(tx, dot.as_bytes(), 0) != DIRENT_SIZE
                || inode.write_at(tx, dotdot.as_bytes(), DIRENT_SIZE as u32) != DIRENT_SIZE
            {
                return Err(Error::NoSpace);
            }
            let total = (2 + entry_cnt) * DIRENT_SIZE as u32;
            inode.extend_to(tx, total)
        })();
        fs.itable().close(fs, inode);
        result
    }

    fn entry_count(&self) -> u32 {
        self.inode.length() / DIRENT_SIZE as u32
    }

    fn entry_at(&self, fs: &FileSys, idx: u32) -> Option<Dirent> {
        let mut buf = [0u8; DIRENT_SIZE];
        let n = self
            .inode
            .read_at(fs, &mut buf, idx * DIRENT_SIZE as u32);
        (n == DIRENT_SIZE).then(|| Dirent::read_from(&buf[..]).expect("entry size"))
    }

    fn write_entry(&self, tx: &mut Tx<'_>, idx: u32, entry: &Dirent) -> usize {
        self.inode
            .write_at(tx, entry.as_bytes(), idx * DIRENT_SIZE as u32)
    }

    /// Linear scan; returns the first entry for which `f` yields a value,
    /// with its slot index.
    fn scan<T>(&self, fs: &FileSys, f: impl Fn(&Dirent) -> Option<T>) -> Option<(u32, T)> {
        (0..self.entry_count()).find_map(|idx| {
            let entry = self.entry_at(fs, idx)?;
            f(&entry).map(|v| (idx, v))
        })
    }
}

fn is_dir_empty(fs: &FileSys, inode: &Arc<Inode>) -> bool {
    let count = inode.length() / DIRENT_SIZE as u32;
    for idx in 0..count {
        let mut buf = [0u8; DIRENT_SIZE];
        if inode.read_at(fs, &mut buf, idx * DIRENT_SIZE as u32) != DIRENT_SIZE {
            break;
        }
        let entry = Dirent::read_from(&buf[..]).expect("entry size");
        if entry.in_use != 0 && !entry.is_dot() {
            return false;
        }
    }
    true
}
