//! End-to-end sector cache behavior.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use walfs::param::{NBUF, SECTOR_SIZE};
use walfs::{Bcache, BlockDevice, MemDisk};

/// A device whose reads take a while, so two threads can demand the same
/// sector while its load is still in flight.
struct SlowDisk {
    inner: Arc<MemDisk>,
    read_delay: Duration,
}

impl BlockDevice for SlowDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        thread::sleep(self.read_delay);
        self.inner.read_sector(sector, buf);
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.inner.write_sector(sector, buf);
    }

    fn capacity(&self) -> u32 {
        self.inner.capacity()
    }
}

#[test]
fn basic_hit_miss() {
    let disk = Arc::new(MemDisk::new(512));
    let mut seed = [0u8; SECTOR_SIZE];
    seed[..4].copy_from_slice(b"abcd");
    disk.write_sector(100, &seed);

    let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);
    let mut first = [0u8; SECTOR_SIZE];
    let mut second = [0u8; SECTOR_SIZE];
    cache.read(100, &mut first);
    cache.read(100, &mut second);

    let stats = cache.stats();
    assert_eq!((stats.misses, stats.hits), (1, 1));
    assert_eq!(first, second);
    assert_eq!(&first[..4], b"abcd");
    cache.shutdown();
}

#[test]
fn concurrent_miss_coalesces_to_one_read() {
    let disk = Arc::new(MemDisk::new(512));
    let mut seed = [0u8; SECTOR_SIZE];
    seed[0] = 0x5a;
    disk.write_sector(200, &seed);

    let slow = Arc::new(SlowDisk {
        inner: Arc::clone(&disk),
        read_delay: Duration::from_millis(50),
    });
    let cache = Bcache::new(Arc::clone(&slow) as Arc<dyn BlockDevice>);

    let barrier = Arc::new(Barrier::new(2));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut buf = [0u8; SECTOR_SIZE];
                barrier.wait();
                cache.read(200, &mut buf);
                buf
            })
        })
        .collect();
    let results: Vec<_> = readers.into_iter().map(|t| t.join().unwrap()).collect();

    // Exactly one device read was issued; both buffers match.
    assert_eq!(disk.read_count(200), 1);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0][0], 0x5a);
    cache.shutdown();
}

#[test]
fn shutdown_flushes_dirty_data() {
    let disk = Arc::new(MemDisk::new(512));
    let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);
    cache.write(300, b"persist me", 0);
    cache.shutdown();

    let mut out = [0u8; SECTOR_SIZE];
    disk.read_sector(300, &mut out);
    assert_eq!(&out[..10], b"persist me");
}

#[test]
fn prefetched_sector_is_evicted_before_read_data() {
    let disk = Arc::new(MemDisk::new(4096));
    let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);

    // Slot 0: an explicit read. Slot 1: a prefetch, accessed bit clear.
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(100, &mut buf);
    cache.request_prefetch(200);
    for _ in 0..500 {
        if disk.read_count(200) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(disk.read_count(200), 1);
    // Give the consumer a moment to finish installing the slot.
    thread::sleep(Duration::from_millis(20));

    // Fill the remaining slots with explicit reads.
    for s in 0..(NBUF as u32 - 2) {
        cache.read(1000 + s, &mut buf);
    }

    // The next miss must evict the prefetched sector, not any read one.
    cache.read(3000, &mut buf);
    cache.read(100, &mut buf);
    assert_eq!(disk.read_count(100), 1, "explicitly read data was evicted");
    cache.read(200, &mut buf);
    assert_eq!(disk.read_count(200), 2, "prefetched data was not evicted");
    cache.shutdown();
}

#[test]
fn many_threads_same_sectors_stay_consistent() {
    let disk = Arc::new(MemDisk::new(4096));
    let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);

    let writers: Vec<_> = (0..4u8)
        .map(|id| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..50u32 {
                    let sector = 100 + (round % 8);
                    cache.write(sector, &[id; 16], (id as usize) * 16);
                    let mut buf = [0u8; 16];
                    cache.read_at(sector, &mut buf, (id as usize) * 16);
                    // This thread's region is never touched by the others.
                    assert_eq!(buf, [id; 16]);
                }
            })
        })
        .collect();
    for t in writers {
        t.join().unwrap();
    }
    cache.flush();
    // Every sector's regions hold the last value each writer stored.
    for sector in 100..108 {
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(sector, &mut buf);
        for id in 0..4u8 {
            assert_eq!(&buf[id as usize * 16..(id as usize + 1) * 16], &[id; 16]);
        }
    }
    cache.shutdown();
}
