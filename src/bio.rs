//! Sector cache.
//!
//! The cache is a fixed table of slots holding copies of disk sector
//! contents. Caching sectors in memory reduces the number of device reads
//! and also provides a synchronization point for sectors used by multiple
//! threads.
//!
//! Interface:
//! * To read cached bytes, call `read` / `read_at`.
//! * To install bytes, call `write`; the slot turns dirty and the device is
//!   updated later (write-back).
//! * `flush` writes every dirty slot out; `shutdown` stops the background
//!   threads and performs one final flush.
//! * `request_prefetch` hints that a sector will be wanted soon.
//!
//! Two locks guard a slot. A cache-wide control lock covers lookup, victim
//! choice, and the sector/state table; each slot additionally has its own
//! lock over the payload plus a condition variable announcing that a load
//! finished. An access holds the control lock only until the slot lock is
//! in hand, and no lock at all across device I/O. A sector being loaded is
//! visible in the table as LOADING, so concurrent demand for it coalesces
//! onto the same slot instead of issuing a second read.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use array_macro::array;
use crossbeam_queue::ArrayQueue;

use crate::disk::BlockDevice;
use crate::lock::SleepableLock;
use crate::param::{FLUSH_INTERVAL, NBUF, PREFETCH_DEPTH, SECTOR_SIZE};

fn acquire<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BufState {
    /// Slot holds nothing; `sector` is meaningless.
    Invalid,
    /// Slot is reserved for `sector` and a load is in progress.
    Loading,
    /// Payload matches a disk snapshot or a later write.
    Valid,
}

/// Cache counters. Read them through [`Bcache::stats`].
#[derive(Clone, Copy, Default, Debug)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Clone, Copy)]
struct SlotMeta {
    sector: u32,
    state: BufState,
    accessed: bool,
}

struct CacheCtl {
    meta: [SlotMeta; NBUF],
    /// Clock hand. Advances past every slot it examines.
    hand: usize,
    stats: CacheStats,
}

struct SlotInner {
    /// Which sector the payload belongs to. Re-checked by waiters after a
    /// sleep, since the slot may have been repurposed meanwhile.
    sector: u32,
    /// Payload is usable. False while a load is in flight.
    ready: bool,
    dirty: bool,
    data: Box<[u8; SECTOR_SIZE]>,
}

struct BufSlot {
    inner: SleepableLock<SlotInner>,
}

impl BufSlot {
    fn new() -> Self {
        Self {
            inner: SleepableLock::new(SlotInner {
                sector: 0,
                ready: false,
                dirty: false,
                data: Box::new([0; SECTOR_SIZE]),
            }),
        }
    }
}

/// The sector cache.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    ctl: Mutex<CacheCtl>,
    slots: [BufSlot; NBUF],
    /// Serializes whole-cache flushes so their device writes do not
    /// interleave.
    flush_serial: Mutex<()>,
    /// Runs before any dirty payload is written back. The log registers
    /// itself here: records describing a change must be durable before the
    /// changed data is (steal policy).
    pre_writeback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    /// Shutdown flag; the flusher and prefetcher sleep on it.
    stop: SleepableLock<bool>,
    prefetch_q: ArrayQueue<u32>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Bcache {
    /// Creates the cache and starts the periodic flusher and the prefetch
    /// consumer.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        let cache = Arc::new(Self {
            dev,
            ctl: Mutex::new(CacheCtl {
                meta: [SlotMeta {
                    sector: 0,
                    state: BufState::Invalid,
                    accessed: false,
                }; NBUF],
                hand: 0,
                stats: CacheStats::default(),
            }),
            slots: array![_ => BufSlot::new(); NBUF],
            flush_serial: Mutex::new(()),
            pre_writeback: Mutex::new(None),
            stop: SleepableLock::new(false),
            prefetch_q: ArrayQueue::new(PREFETCH_DEPTH),
            threads: Mutex::new(Vec::new()),
        });

        let flusher = thread::Builder::new()
            .name("bcache-flusher".into())
            .spawn({
                let cache = Arc::clone(&cache);
                move || cache.flusher_main()
            })
            .expect("bcache: spawn flusher");
        let prefetcher = thread::Builder::new()
            .name("bcache-prefetch".into())
            .spawn({
                let cache = Arc::clone(&cache);
                move || cache.prefetch_main()
            })
            .expect("bcache: spawn prefetcher");
        acquire(&cache.threads).extend([flusher, prefetcher]);
        cache
    }

    /// Copies the whole sector into `buf`, loading it on a miss.
    pub fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.slot_op(sector, true, false, true, |data| {
            buf.copy_from_slice(data);
        });
    }

    /// Copies `buf.len()` cached bytes starting at `offset` within the
    /// sector.
    pub fn read_at(&self, sector: u32, buf: &mut [u8], offset: usize) {
        assert!(offset + buf.len() <= SECTOR_SIZE, "read_at: range");
        self.slot_op(sector, true, false, true, |data| {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        });
    }

    /// Installs `data` at `offset` within the sector and marks the slot
    /// dirty. A partial write to a sector not yet resident loads it first
    /// (read-modify-write); a full-sector write skips the load.
    pub fn write(&self, sector: u32, data: &[u8], offset: usize) {
        assert!(offset + data.len() <= SECTOR_SIZE, "write: range");
        let full = offset == 0 && data.len() == SECTOR_SIZE;
        self.slot_op(sector, !full, true, true, |payload| {
            payload[offset..offset + data.len()].copy_from_slice(data);
        });
    }

    /// Best-effort read-ahead request; dropped if the queue is full.
    pub fn request_prefetch(&self, sector: u32) {
        if self.prefetch_q.push(sector).is_ok() {
            self.stop.lock().wakeup();
        }
    }

    /// Writes every dirty slot to the device and clears its dirty bit.
    pub fn flush(&self) {
        let _serial = acquire(&self.flush_serial);
        for i in 0..NBUF {
            let ctl = acquire(&self.ctl);
            if ctl.meta[i].state != BufState::Valid {
                continue;
            }
            let mut inner = self.slots[i].inner.lock();
            drop(ctl);
            if !inner.ready || !inner.dirty {
                continue;
            }
            let sector = inner.sector;
            let data = inner.data.clone();
            inner.dirty = false;
            drop(inner);
            self.log_first();
            self.dev.write_sector(sector, &data);
            acquire(&self.ctl).stats.writebacks += 1;
        }
    }

    /// Stops the flusher and prefetcher, then performs one final flush.
    pub fn shutdown(&self) {
        self.stop_threads();
        self.flush();
    }

    /// Stops the threads without flushing. Dirty data is abandoned, as in a
    /// power loss.
    pub(crate) fn shutdown_unclean(&self) {
        self.stop_threads();
    }

    pub fn stats(&self) -> CacheStats {
        acquire(&self.ctl).stats
    }

    /// Number of slots holding a sector.
    pub fn cached_count(&self) -> usize {
        let ctl = acquire(&self.ctl);
        ctl.meta
            .iter()
            .filter(|m| m.state != BufState::Invalid)
            .count()
    }

    /// Number of dirty slots.
    pub fn dirty_count(&self) -> usize {
        (0..NBUF)
            .filter(|&i| {
                let inner = self.slots[i].inner.lock();
                inner.ready && inner.dirty
            })
            .count()
    }

    /// Registers the write-ahead hook. Called once at mount.
    pub(crate) fn set_pre_writeback(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *acquire(&self.pre_writeback) = Some(hook);
    }

    fn log_first(&self) {
        if let Some(hook) = &*acquire(&self.pre_writeback) {
            hook();
        }
    }

    fn stop_threads(&self) {
        let mut guard = self.stop.lock();
        *guard = true;
        guard.wakeup();
        drop(guard);
        let handles: Vec<_> = acquire(&self.threads).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn flusher_main(&self) {
        loop {
            let mut guard = self.stop.lock();
            if *guard {
                return;
            }
            guard.sleep_timeout(FLUSH_INTERVAL);
            if *guard {
                return;
            }
            drop(guard);
            log::debug!("bcache: periodic flush");
            self.flush();
        }
    }

    fn prefetch_main(&self) {
        loop {
            let sector = {
                let mut guard = self.stop.lock();
                loop {
                    if *guard {
                        return;
                    }
                    if let Some(sector) = self.prefetch_q.pop() {
                        break sector;
                    }
                    guard.sleep();
                }
            };
            self.do_prefetch(sector);
        }
    }

    /// Loads a sector like a read would, but leaves `accessed` clear so the
    /// data goes first when eviction comes around, and copies nothing.
    fn do_prefetch(&self, sector: u32) {
        self.slot_op(sector, true, false, false, |_| {});
    }

    fn lookup(ctl: &CacheCtl, sector: u32) -> Option<usize> {
        let found = ctl
            .meta
            .iter()
            .position(|m| m.state != BufState::Invalid && m.sector == sector);
        debug_assert!(
            ctl.meta
                .iter()
                .filter(|m| m.state != BufState::Invalid && m.sector == sector)
                .count()
                <= 1,
            "bcache: sector cached twice"
        );
        found
    }

    /// Clock sweep. Invalid slots are taken immediately, loading slots are
    /// skipped, and a valid slot gets a second chance through its accessed
    /// bit. The hand moves past every slot it examines.
    fn pick_victim(ctl: &mut CacheCtl) -> usize {
        for _ in 0..8 * NBUF {
            let i = ctl.hand;
            ctl.hand = (ctl.hand + 1) % NBUF;
            match ctl.meta[i].state {
                BufState::Invalid => return i,
                BufState::Loading => {}
                BufState::Valid => {
                    if ctl.meta[i].accessed {
                        ctl.meta[i].accessed = false;
                    } else {
                        return i;
                    }
                }
            }
        }
        panic!("bcache: no usable slots");
    }

    /// The access protocol. Finds or loads the slot for `sector`, then runs
    /// `f` on the payload under the slot lock.
    fn slot_op<F: FnOnce(&mut [u8; SECTOR_SIZE])>(
        &self,
        sector: u32,
        load: bool,
        mark_dirty: bool,
        mark_accessed: bool,
        f: F,
    ) {
        let mut f = Some(f);
        loop {
            let mut ctl = acquire(&self.ctl);

            if let Some(i) = Self::lookup(&ctl, sector) {
                // Hit, or a load in flight. Either way the slot lock and
                // the ready flag finish the job.
                ctl.stats.hits += 1;
                if mark_accessed {
                    ctl.meta[i].accessed = true;
                }
                let mut inner = self.slots[i].inner.lock();
                drop(ctl);
                while !inner.ready {
                    inner.sleep();
                }
                if inner.sector != sector {
                    // Repurposed while we slept; start over.
                    continue;
                }
                (f.take().expect("slot_op: f"))(&mut inner.data);
                if mark_dirty {
                    inner.dirty = true;
                }
                return;
            }

            // Miss. Reserve a victim slot while still holding the control
            // lock, so concurrent lookups for the same sector land on it.
            ctl.stats.misses += 1;
            let i = Self::pick_victim(&mut ctl);
            let old = ctl.meta[i];
            if old.state == BufState::Valid {
                ctl.stats.evictions += 1;
            }
            ctl.meta[i] = SlotMeta {
                sector,
                state: BufState::Loading,
                accessed: mark_accessed,
            };
            let mut inner = self.slots[i].inner.lock();
            drop(ctl);

            let writeback = if old.state == BufState::Valid && inner.dirty {
                Some((old.sector, inner.data.clone()))
            } else {
                None
            };
            inner.sector = sector;
            inner.ready = false;
            inner.dirty = false;
            drop(inner);

            // Device I/O with no lock held. Waiters for this sector are
            // parked on the slot's condition variable.
            if let Some((old_sector, old_data)) = writeback {
                self.log_first();
                self.dev.write_sector(old_sector, &old_data);
                acquire(&self.ctl).stats.writebacks += 1;
            }
            let mut fresh = Box::new([0u8; SECTOR_SIZE]);
            if load {
                self.dev.read_sector(sector, &mut fresh);
            }

            let mut inner = self.slots[i].inner.lock();
            debug_assert!(!inner.ready && inner.sector == sector);
            *inner.data = *fresh;
            inner.ready = true;
            (f.take().expect("slot_op: f"))(&mut inner.data);
            if mark_dirty {
                inner.dirty = true;
            }
            inner.wakeup();
            drop(inner);

            let mut ctl = acquire(&self.ctl);
            debug_assert_eq!(ctl.meta[i].state, BufState::Loading);
            ctl.meta[i].state = BufState::Valid;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn cache_with_disk(capacity: u32) -> (Arc<MemDisk>, Arc<Bcache>) {
        let disk = Arc::new(MemDisk::new(capacity));
        let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);
        (disk, cache)
    }

    #[test]
    fn second_read_hits() {
        let (_disk, cache) = cache_with_disk(256);
        let mut a = [0u8; SECTOR_SIZE];
        let mut b = [0u8; SECTOR_SIZE];
        cache.read(100, &mut a);
        cache.read(100, &mut b);
        let stats = cache.stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
        assert_eq!(a, b);
        cache.shutdown();
    }

    #[test]
    fn partial_write_read_modify_write() {
        let (disk, cache) = cache_with_disk(256);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 1;
        sector[511] = 2;
        disk.write_sector(70, &sector);

        cache.write(70, b"xy", 10);
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(70, &mut out);
        assert_eq!(out[0], 1);
        assert_eq!(&out[10..12], b"xy");
        assert_eq!(out[511], 2);
        // The partial write had to load the sector first.
        assert_eq!(disk.read_count(70), 1);
        cache.shutdown();
    }

    #[test]
    fn full_sector_write_skips_load() {
        let (disk, cache) = cache_with_disk(256);
        let payload = [7u8; SECTOR_SIZE];
        cache.write(80, &payload, 0);
        assert_eq!(disk.read_count(80), 0);
        cache.flush();
        assert_eq!(disk.write_count(80), 1);
        cache.shutdown();
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (disk, cache) = cache_with_disk(NBUF as u32 * 4 + 70);
        cache.write(67, &[9u8; SECTOR_SIZE], 0);
        // Touch enough distinct sectors to cycle the whole table.
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..(NBUF as u32 * 2) {
            cache.read(68 + s, &mut buf);
        }
        assert_eq!(disk.write_count(67), 1);
        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sector(67, &mut out);
        assert_eq!(out, [9u8; SECTOR_SIZE]);
        assert!(cache.stats().evictions > 0);
        cache.shutdown();
    }

    #[test]
    fn flush_clears_dirty() {
        let (_disk, cache) = cache_with_disk(256);
        cache.write(90, b"abc", 0);
        assert_eq!(cache.dirty_count(), 1);
        cache.flush();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.stats().writebacks, 1);
        cache.shutdown();
    }

    #[test]
    fn prefetch_populates_without_accessed() {
        let (disk, cache) = cache_with_disk(256);
        cache.request_prefetch(120);
        // Wait for the consumer to pick it up.
        for _ in 0..200 {
            if disk.read_count(120) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(disk.read_count(120), 1);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(120, &mut buf);
        // The explicit read found the prefetched copy.
        assert_eq!(disk.read_count(120), 1);
        assert_eq!(cache.stats().hits, 1);
        cache.shutdown();
    }
}
