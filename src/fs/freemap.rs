//! The free-map.
//!
//! One bit per device sector; set means allocated. Sectors 0 through the
//! log metadata are permanently set. The bitmap lives in memory and is
//! persisted through the free-map file (the inode at sector 0), so its
//! writes pass through the cache like any file's but never through the
//! log: persistence is synchronous at every allocate and release instead.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fs::inode::Inode;
use crate::fs::FileSys;
use crate::param::{DATA_START_SECTOR, FREE_MAP_SECTOR};

fn acquire<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FreeMapInner {
    bits: Vec<u8>,
    capacity: u32,
    /// The free-map file. None only during format, before the file exists.
    file: Option<Arc<Inode>>,
}

impl FreeMapInner {
    fn test(&self, sector: u32) -> bool {
        self.bits[sector as usize / 8] & (1 << (sector % 8)) != 0
    }

    fn set(&mut self, sector: u32) {
        self.bits[sector as usize / 8] |= 1 << (sector % 8);
    }

    fn clear(&mut self, sector: u32) {
        self.bits[sector as usize / 8] &= !(1 << (sector % 8));
    }

    /// First-fit scan for `n` consecutive clear bits.
    fn scan(&self, n: u32) -> Option<u32> {
        let mut run = 0;
        for sector in 0..self.capacity {
            if self.test(sector) {
                run = 0;
            } else {
                run += 1;
                if run == n {
                    return Some(sector + 1 - n);
                }
            }
        }
        None
    }
}

/// The allocation bitmap.
pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

impl FreeMap {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(FreeMapInner {
                bits: vec![0; (capacity as usize + 7) / 8],
                capacity,
                file: None,
            }),
        }
    }

    /// Marks the fixed on-disk layout (both inodes, the log ring, the log
    /// metadata) allocated. Format-time only.
    pub(crate) fn reserve_metadata(&self) {
        let mut inner = acquire(&self.inner);
        for sector in 0..DATA_START_SECTOR {
            inner.set(sector);
        }
    }

    /// Allocation without persistence, for building the free-map file
    /// itself during format.
    pub(crate) fn allocate_in_memory(&self, n: u32) -> Option<u32> {
        let mut inner = acquire(&self.inner);
        let start = inner.scan(n)?;
        for sector in start..start + n {
            inner.set(sector);
        }
        Some(start)
    }

    /// Allocates `n` consecutive sectors and persists the bitmap before
    /// returning.
    pub fn allocate(&self, fs: &FileSys, n: u32) -> Option<u32> {
        let mut inner = acquire(&self.inner);
        let start = inner.scan(n)?;
        for sector in start..start + n {
            inner.set(sector);
        }
        write_back(fs, &inner);
        Some(start)
    }

    /// Releases `n` sectors starting at `start`. Releasing a free sector is
    /// a programming fault.
    pub fn release(&self, fs: &FileSys, start: u32, n: u32) {
        let mut inner = acquire(&self.inner);
        for sector in start..start + n {
            assert!(inner.test(sector), "freemap: releasing a free sector");
            inner.clear(sector);
        }
        write_back(fs, &inner);
    }

    pub fn is_allocated(&self, sector: u32) -> bool {
        acquire(&self.inner).test(sector)
    }

    /// Free sectors remaining.
    pub fn free_count(&self) -> u32 {
        let inner = acquire(&self.inner);
        (0..inner.capacity).filter(|&s| !inner.test(s)).count() as u32
    }

    pub(crate) fn bitmap_len(&self) -> usize {
        acquire(&self.inner).bits.len()
    }

    /// Hands the free-map its backing file and persists the current bits.
    pub(crate) fn attach_file(&self, fs: &FileSys, file: Arc<Inode>) {
        let mut inner = acquire(&self.inner);
        inner.file = Some(file);
        write_back(fs, &inner);
    }

    /// Normal-boot path: reads the bitmap back out of the free-map file.
    pub(crate) fn load(&self, fs: &FileSys) {
        let file = fs.itable().open(fs, FREE_MAP_SECTOR);
        let mut inner = acquire(&self.inner);
        assert_eq!(
            file.length() as usize,
            inner.bits.len(),
            "freemap: file does not match device size"
        );
        let mut bits = vec![0u8; inner.bits.len()];
        let n = file.read_at(fs, &mut bits, 0);
        assert_eq!(n, bits.len(), "freemap: short read");
        inner.bits = bits;
        inner.file = Some(file);
    }
}

/// Synchronous persistence: the bitmap goes through the file into the
/// cache, then straight to the device.
fn write_back(fs: &FileSys, inner: &FreeMapInner) {
    let Some(file) = &inner.file else { return };
    file.write_at_raw(fs, &inner.bits, 0);
    fs.cache().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_runs() {
        let map = FreeMap::new(64);
        map.reserve_metadata();
        // Everything below the data region is taken; 64-sector device has
        // nothing above it except what we free up here.
        assert_eq!(map.allocate_in_memory(1), None);

        let map = FreeMap::new(128);
        map.reserve_metadata();
        assert_eq!(map.allocate_in_memory(2), Some(DATA_START_SECTOR));
        assert_eq!(map.allocate_in_memory(1), Some(DATA_START_SECTOR + 2));
        assert!(map.is_allocated(DATA_START_SECTOR));
    }

    #[test]
    fn bit_ops_roundtrip() {
        let map = FreeMap::new(128);
        let mut inner = acquire(&map.inner);
        assert!(!inner.test(70));
        inner.set(70);
        assert!(inner.test(70));
        inner.clear(70);
        assert!(!inner.test(70));
    }

    #[test]
    fn scan_skips_allocated_gaps() {
        let map = FreeMap::new(256);
        map.reserve_metadata();
        let a = map.allocate_in_memory(3).unwrap();
        assert_eq!(a, DATA_START_SECTOR);
        let mut inner = acquire(&map.inner);
        inner.clear(a + 1);
        // A single free sector between two allocated ones cannot satisfy a
        // two-sector request.
        assert_eq!(inner.scan(2), Some(a + 3));
        assert_eq!(inner.scan(1), Some(a + 1));
    }
}
