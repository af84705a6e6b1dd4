//! Crash consistency end to end: commit durability, abort rollback,
//! recovery of committed and uncommitted transactions, torn records,
//! checkpointing.

use std::mem;
use std::sync::Arc;

use walfs::param::{SECTOR_SIZE, WAL_LOG_LEN, WAL_LOG_START};
use walfs::{BlockDevice, FileSys, MemDisk};

const TARGET: u32 = 500;

fn mount_fresh(disk: &Arc<MemDisk>) -> Arc<FileSys> {
    let _ = env_logger::builder().is_test(true).try_init();
    FileSys::init(Arc::clone(disk) as Arc<dyn BlockDevice>, true)
}

fn remount(disk: &Arc<MemDisk>) -> Arc<FileSys> {
    FileSys::init(Arc::clone(disk) as Arc<dyn BlockDevice>, false)
}

/// Seeds byte 0 of the target sector with `b` and makes it durable.
fn seed_byte(fs: &FileSys, b: u8) {
    fs.cache().write(TARGET, &[b], 0);
    fs.cache().flush();
}

fn disk_byte(disk: &MemDisk, sector: u32) -> u8 {
    let mut buf = [0u8; SECTOR_SIZE];
    disk.read_sector(sector, &mut buf);
    buf[0]
}

#[test]
fn crash_after_commit_redoes() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'A');
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        tx.commit();
        // The new byte sits dirty in the cache; the crash throws it away.
        fs.crash();
    }
    assert_eq!(disk_byte(&disk, TARGET), b'A');

    let fs = remount(&disk);
    assert_eq!(fs.wal().stats().recoveries, 1);
    assert_eq!(disk_byte(&disk, TARGET), b'B');
    fs.done();
}

#[test]
fn crash_before_commit_undoes() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'A');
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        // Steal: the dirty byte is forced out before any commit.
        fs.cache().flush();
        assert_eq!(disk_byte(&disk, TARGET), b'B');
        mem::forget(tx);
        fs.crash();
    }
    let fs = remount(&disk);
    assert_eq!(disk_byte(&disk, TARGET), b'A');
    fs.done();
}

#[test]
fn abort_rolls_back_chain_of_writes() {
    let disk = Arc::new(MemDisk::new(4096));
    let fs = mount_fresh(&disk);
    seed_byte(&fs, b'A');

    let mut tx = fs.begin_tx();
    tx.write_at(TARGET, 0, b"B");
    tx.write_at(TARGET, 0, b"C");
    tx.write_at(TARGET, 0, b"D");
    tx.abort();

    let mut byte = [0u8; 1];
    fs.cache().read_at(TARGET, &mut byte, 0);
    assert_eq!(byte[0], b'A');
    fs.done();
    assert_eq!(disk_byte(&disk, TARGET), b'A');
}

#[test]
fn dropped_transaction_rolls_back() {
    let disk = Arc::new(MemDisk::new(4096));
    let fs = mount_fresh(&disk);
    seed_byte(&fs, b'A');
    {
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        // Dropped without an end: rolls back.
    }
    let mut byte = [0u8; 1];
    fs.cache().read_at(TARGET, &mut byte, 0);
    assert_eq!(byte[0], b'A');
    assert_eq!(fs.wal().stats().aborts, 1);
    assert_eq!(fs.wal().active_txn_count(), 0);
    fs.done();
}

#[test]
fn uncommitted_double_write_restores_earliest_preimage() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'A');
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        tx.write_at(TARGET, 0, b"C");
        // Flushing the cache forces the log out first, then the data.
        fs.cache().flush();
        assert_eq!(disk_byte(&disk, TARGET), b'C');
        mem::forget(tx);
        fs.crash();
    }
    let fs = remount(&disk);
    // Undo must apply (C -> B) then (B -> A), not stop at B.
    assert_eq!(disk_byte(&disk, TARGET), b'A');
    fs.done();
}

#[test]
fn torn_commit_record_means_uncommitted() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'A');
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        tx.commit();
        let commit_lsn = fs.wal().next_lsn() - 1;
        fs.cache().flush();
        assert_eq!(disk_byte(&disk, TARGET), b'B');
        fs.crash();

        // Tear the COMMIT record on the raw device.
        let ring = WAL_LOG_START + ((commit_lsn - 1) % WAL_LOG_LEN as u64) as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(ring, &mut buf);
        buf[40] ^= 0xff;
        disk.write_sector(ring, &buf);
    }
    let fs = remount(&disk);
    // The torn record fails its checksum, so the transaction counts as
    // uncommitted and its write is undone.
    assert_eq!(disk_byte(&disk, TARGET), b'A');
    fs.done();
}

#[test]
fn checkpoint_leaves_nothing_pending() {
    let disk = Arc::new(MemDisk::new(4096));
    let fs = mount_fresh(&disk);
    let mut tx = fs.begin_tx();
    tx.write_at(TARGET, 0, b"Q");
    tx.write_at(TARGET + 1, 0, b"R");
    tx.commit();

    fs.wal().checkpoint(fs.cache());
    assert_eq!(fs.cache().dirty_count(), 0);
    assert_eq!(fs.wal().flushed_lsn(), fs.wal().next_lsn() - 1);
    assert!(fs.wal().stats().checkpoints >= 1);
    fs.done();
}

#[test]
fn flushed_lsn_never_passes_next_lsn() {
    let disk = Arc::new(MemDisk::new(4096));
    let fs = mount_fresh(&disk);
    for i in 0..10u32 {
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET + i, 0, b"x");
        tx.commit();
        assert!(fs.wal().flushed_lsn() <= fs.wal().next_lsn() - 1);
    }
    fs.done();
}

#[test]
fn log_wraparound_survives_many_transactions() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'0');
        // Enough transactions to lap the 64-entry ring several times.
        for round in 0..200u8 {
            let mut tx = fs.begin_tx();
            tx.write_at(TARGET, 0, &[b'0' + (round % 10)]);
            tx.commit();
        }
        fs.crash();
    }
    let fs = remount(&disk);
    // Last committed value survives the crash.
    assert_eq!(disk_byte(&disk, TARGET), b'0' + (199 % 10));
    fs.done();
}

#[test]
fn recovery_is_idempotent_across_repeated_crashes() {
    let disk = Arc::new(MemDisk::new(4096));
    {
        let fs = mount_fresh(&disk);
        seed_byte(&fs, b'A');
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"B");
        tx.commit();
        fs.crash();
    }
    for _ in 0..3 {
        // Mount, recover, crash again without a clean shutdown.
        let fs = remount(&disk);
        assert_eq!(disk_byte(&disk, TARGET), b'B');
        fs.crash();
    }
    let fs = remount(&disk);
    assert_eq!(disk_byte(&disk, TARGET), b'B');
    fs.done();
}

#[test]
fn clean_shutdown_skips_recovery() {
    let disk = Arc::new(MemDisk::new(4096));
    let next_lsn = {
        let fs = mount_fresh(&disk);
        let mut tx = fs.begin_tx();
        tx.write_at(TARGET, 0, b"Z");
        tx.commit();
        let next = fs.wal().next_lsn();
        fs.done();
        next
    };
    let fs = remount(&disk);
    assert_eq!(fs.wal().stats().recoveries, 0);
    assert_eq!(fs.wal().next_lsn(), next_lsn);
    assert_eq!(disk_byte(&disk, TARGET), b'Z');
    fs.done();
}
