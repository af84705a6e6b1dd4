//! File system implementation. Five layers:
//!   + Sector cache: write-back caching of the device, with the log
//!     running beside it on a bypass path.
//!   + Free-map: allocator for raw sectors.
//!   + Inodes: reading, writing, extension, metadata.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Files: byte-oriented handles in `crate::file`.
//!
//! Everything hangs off one [`FileSys`] value: the device, the cache, the
//! log manager, the free-map, and the open-inode table. `init` brings the
//! stack up (running log recovery before the free-map is read, so the
//! free-map sees recovered sector contents), `done` shuts it down cleanly.
//!
//! Mutations run under a [`Tx`]: its `write_at` logs old and new bytes
//! before the cache sees the new ones, which is the integration contract
//! the whole stack leans on. Commit makes the transaction durable; abort,
//! or dropping the transaction early, rolls it back.

use std::sync::Arc;

use zerocopy::AsBytes;

use crate::bio::Bcache;
use crate::disk::BlockDevice;
use crate::file::File;
use crate::fs::dir::Dir;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{Dinode, InodeType, Itable};
use crate::fs::wal::{TxnHandle, Wal};
use crate::param::{
    DATA_START_SECTOR, FREE_MAP_SECTOR, MAX_TX_SECTORS, NDIRECT, NINDIRECT, ROOT_DIR_SECTOR,
    SECTOR_SIZE,
};
use crate::{Error, Result};

pub mod dir;
pub mod freemap;
pub mod inode;
pub mod wal;

/// Entry slots preallocated in a fresh root directory.
const ROOT_DIR_PREALLOC: u32 = 16;

/// The mounted file system.
pub struct FileSys {
    dev: Arc<dyn BlockDevice>,
    cache: Arc<Bcache>,
    wal: Arc<Wal>,
    freemap: FreeMap,
    itable: Itable,
}

impl FileSys {
    /// Mounts the stack. With `format` the device is initialized from
    /// scratch: fresh log counters, reserved layout, free-map file, root
    /// directory. Without it, the log metadata decides whether recovery
    /// runs; the free-map is read only afterwards.
    pub fn init(dev: Arc<dyn BlockDevice>, format: bool) -> Arc<FileSys> {
        let capacity = dev.capacity();
        assert!(capacity > DATA_START_SECTOR, "fs: device too small");

        let cache = Bcache::new(Arc::clone(&dev));
        let wal = Arc::new(Wal::new(Arc::clone(&dev), format));
        // Steal policy: logged history must reach the device before the
        // data it describes, so every dirty writeback flushes the log
        // first.
        cache.set_pre_writeback(Box::new({
            let wal = Arc::clone(&wal);
            move || wal.flush_all()
        }));
        let fs = Arc::new(FileSys {
            dev,
            cache,
            wal,
            freemap: FreeMap::new(capacity),
            itable: Itable::new(),
        });
        if format {
            fs.format();
        } else {
            fs.freemap.load(&fs);
        }
        fs
    }

    /// Clean shutdown: final cache flush, then log flush and clean
    /// metadata.
    pub fn done(&self) {
        self.cache.shutdown();
        self.wal.shutdown();
    }

    /// Simulated power loss, for crash tests: background threads stop,
    /// nothing is flushed, and the log metadata stays unclean so the next
    /// mount recovers.
    pub fn crash(&self) {
        self.cache.shutdown_unclean();
    }

    /// Creates a file of `initial_size` zero bytes in the root directory.
    /// On failure no file is left behind.
    pub fn create(&self, name: &str, initial_size: u32) -> Result<()> {
        let root = Dir::open_root(self);
        let result = self.create_in(&root, name, initial_size);
        root.close(self);
        result
    }

    /// Removes the named file from the root directory. Its storage is
    /// reclaimed once the last open handle goes away.
    pub fn remove(&self, name: &str) -> Result<()> {
        let root = Dir::open_root(self);
        let mut tx = self.begin_tx();
        let result = root.remove(self, &mut tx, name);
        match result {
            Ok(()) => tx.commit(),
            Err(_) => tx.abort(),
        }
        root.close(self);
        result
    }

    /// Opens the named file in the root directory.
    pub fn open(self: &Arc<Self>, name: &str) -> Result<File> {
        let root = Dir::open_root(self);
        let sector = root.lookup(self, name);
        root.close(self);
        let sector = sector.ok_or(Error::NotFound)?;
        let inode = self.itable.open(self, sector);
        if inode.typ() == InodeType::Dir {
            self.itable.close(self, inode);
            return Err(Error::IsDirectory);
        }
        Ok(File::new(Arc::clone(self), inode))
    }

    pub fn open_root(&self) -> Dir {
        Dir::open_root(self)
    }

    /// Starts a transaction. A thread holds at most one at a time.
    pub fn begin_tx(&self) -> Tx<'_> {
        Tx {
            fs: self,
            txn: Some(self.wal.txn_begin()),
        }
    }

    pub fn cache(&self) -> &Bcache {
        &self.cache
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    fn create_in(&self, dir: &Dir, name: &str, initial_size: u32) -> Result<()> {
        let sector = {
            let mut tx = self.begin_tx();
            let Some(sector) = self.freemap.allocate(self, 1) else {
                tx.abort();
                return Err(Error::NoSpace);
            };
            let release_on_fail = scopeguard::guard((), |()| {
                self.freemap.release(self, sector, 1);
            });
            let dinode = Dinode::new(InodeType::File);
            tx.write_at(sector, 0, dinode.as_bytes());
            if let Err(e) = dir.add(self, &mut tx, name, sector) {
                tx.abort();
                return Err(e);
            }
            tx.commit();
            scopeguard::ScopeGuard::into_inner(release_on_fail);
            sector
        };

        // Extension runs in follow-up transactions, a few sectors each, so
        // no single transaction outgrows the log ring.
        if initial_size > 0 {
            let inode = self.itable.open(self, sector);
            let mut length = 0u32;
            while length < initial_size {
                let target = (length + (MAX_TX_SECTORS * SECTOR_SIZE) as u32).min(initial_size);
                let mut tx = self.begin_tx();
                if inode.extend_to(&mut tx, target).is_err() {
                    tx.abort();
                    self.itable.close(self, inode);
                    let _ = self.remove(name);
                    return Err(Error::NoSpace);
                }
                tx.commit();
                length = target;
            }
            self.itable.close(self, inode);
        }
        Ok(())
    }

    fn format(&self) {
        log::info!("fs: formatting device");
        self.freemap.reserve_metadata();
        self.build_freemap_file();

        {
            let mut tx = self.begin_tx();
            Dir::create_with_parent(
                self,
                &mut tx,
                ROOT_DIR_SECTOR,
                ROOT_DIR_SECTOR,
                ROOT_DIR_PREALLOC,
            )
            .expect("format: root directory");
            // The root is not named anywhere, so it holds its single link
            // itself.
            let root = self.itable.open(self, ROOT_DIR_SECTOR);
            root.adjust_nlink(&mut tx, 1);
            self.itable.close(self, root);
            tx.commit();
        }

        let file = self.itable.open(self, FREE_MAP_SECTOR);
        self.freemap.attach_file(self, file);
        self.cache.flush();
    }

    /// Builds the free-map file by hand: its own sectors come out of the
    /// still in-memory bitmap, so the file records its own allocation.
    fn build_freemap_file(&self) {
        let bitmap_len = self.freemap.bitmap_len();
        let file_sectors = (bitmap_len + SECTOR_SIZE - 1) / SECTOR_SIZE;
        assert!(
            file_sectors <= NDIRECT + NINDIRECT,
            "fs: device too large for the free-map file"
        );

        let mut dinode = Dinode::new(InodeType::File);
        dinode.nlink = 1;
        dinode.length = bitmap_len as u32;
        let zero = [0u8; SECTOR_SIZE];
        let mut indirect = [0u32; NINDIRECT];
        for i in 0..file_sectors {
            let sector = self
                .freemap
                .allocate_in_memory(1)
                .expect("format: no room for the free-map file");
            self.cache.write(sector, &zero, 0);
            if i < NDIRECT {
                dinode.direct[i] = sector;
            } else {
                indirect[i - NDIRECT] = sector;
            }
        }
        if file_sectors > NDIRECT {
            let sector = self
                .freemap
                .allocate_in_memory(1)
                .expect("format: no room for the free-map file");
            dinode.indirect = sector;
            let mut buf = [0u8; SECTOR_SIZE];
            for (i, ptr) in indirect.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&ptr.to_ne_bytes());
            }
            self.cache.write(sector, &buf, 0);
        }
        self.cache.write(FREE_MAP_SECTOR, dinode.as_bytes(), 0);
    }
}

/// A transaction handle. Scoped to one thread and one operation; ending it
/// by [`Tx::commit`] is the durability point, while [`Tx::abort`] or an
/// early drop rolls every logged write back.
pub struct Tx<'s> {
    fs: &'s FileSys,
    txn: Option<TxnHandle>,
}

impl<'s> Tx<'s> {
    pub(crate) fn fs(&self) -> &'s FileSys {
        self.fs
    }

    /// Log-before-write: reads the bytes being replaced, logs (old, new),
    /// then installs the new bytes in the cache.
    pub fn write_at(&mut self, sector: u32, offset: usize, new: &[u8]) {
        let txn = self.txn.as_mut().expect("tx: already ended");
        let mut old = vec![0u8; new.len()];
        self.fs.cache.read_at(sector, &mut old, offset);
        self.fs.wal.log_write(txn, sector, offset, &old, new);
        self.fs.cache.write(sector, new, offset);
    }

    /// Logged zero-fill of a whole sector.
    pub fn zero_sector(&mut self, sector: u32) {
        self.write_at(sector, 0, &[0u8; SECTOR_SIZE]);
    }

    /// Commits; on return the transaction is durable. Runs a deferred
    /// checkpoint if one came due, here at top level rather than inside
    /// any write path.
    pub fn commit(mut self) {
        let txn = self.txn.take().expect("tx: already ended");
        if self.fs.wal.txn_commit(txn) {
            self.fs.wal.checkpoint(&self.fs.cache);
        }
    }

    /// Rolls back every write this transaction logged.
    pub fn abort(mut self) {
        let txn = self.txn.take().expect("tx: already ended");
        self.fs.wal.txn_abort(txn, &self.fs.cache);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // A transaction abandoned without an explicit end rolls back.
        if let Some(txn) = self.txn.take() {
            self.fs.wal.txn_abort(txn, &self.fs.cache);
        }
    }
}
