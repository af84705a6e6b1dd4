//! Write-ahead log.
//!
//! The log makes multi-sector updates atomic across crashes. Policy is
//! steal + undo/redo: dirty data sectors may reach the device before their
//! transaction commits, so every logged write carries both the old and the
//! new bytes. A transaction's records become durable when its COMMIT record
//! is flushed; that flush is the durability point of the whole stack.
//!
//! On-disk format: a ring of 64 sectors, one record per sector, preceded by
//! nothing and followed by one metadata sector. Record `lsn` maps to ring
//! sector `WAL_LOG_START + (lsn - 1) % WAL_LOG_LEN`; the LSN counter never
//! resets, so after wraparound a ring sector holds the most recent record
//! assigned to that position. Records bypass the sector cache in both
//! directions: caching them could defer persistence past a reported commit.
//!
//! Recovery sweeps the ring three times: analysis (validate checksums,
//! classify transactions), redo (committed WRITE records forward), undo
//! (unfinished WRITE records backward). A record that fails its checksum
//! does not exist; in particular a torn COMMIT leaves its transaction
//! uncommitted, which is the only reading consistent with the durability
//! contract.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::disk::BlockDevice;
use crate::lock::{SleepableLock, SleepableLockGuard};
use crate::param::{
    SECTOR_SIZE, WAL_BUF_RECORDS, WAL_CHECKPOINT_THRESHOLD, WAL_DATA_MAX, WAL_LOG_LEN,
    WAL_LOG_START, WAL_META_MAGIC, WAL_META_SECTOR,
};

/// Ring sector holding the record with this LSN.
fn wal_sector(lsn: u64) -> u32 {
    debug_assert!(lsn >= 1);
    WAL_LOG_START + ((lsn - 1) % WAL_LOG_LEN as u64) as u32
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum RecordKind {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Write = 4,
    Checkpoint = 5,
}

impl RecordKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Begin),
            2 => Some(Self::Commit),
            3 => Some(Self::Abort),
            4 => Some(Self::Write),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// One log record, exactly one sector.
///
/// The checksum covers every byte of the record with the checksum field
/// itself zeroed.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct WalRecord {
    lsn: u64,
    txn_id: u64,
    sector: u32,
    offset: u32,
    length: u32,
    kind: u32,
    checksum: u32,
    _pad0: u32,
    old_data: [u8; WAL_DATA_MAX],
    new_data: [u8; WAL_DATA_MAX],
    _pad1: [u8; 8],
}

const_assert!(mem::size_of::<WalRecord>() == SECTOR_SIZE);

impl WalRecord {
    fn control(kind: RecordKind, txn_id: u64) -> Self {
        Self {
            lsn: 0,
            txn_id,
            sector: 0,
            offset: 0,
            length: 0,
            kind: kind as u32,
            checksum: 0,
            _pad0: 0,
            old_data: [0; WAL_DATA_MAX],
            new_data: [0; WAL_DATA_MAX],
            _pad1: [0; 8],
        }
    }

    fn write(txn_id: u64, sector: u32, offset: u32, old: &[u8], new: &[u8]) -> Self {
        debug_assert_eq!(old.len(), new.len());
        debug_assert!(new.len() <= WAL_DATA_MAX);
        let mut rec = Self::control(RecordKind::Write, txn_id);
        rec.sector = sector;
        rec.offset = offset;
        rec.length = new.len() as u32;
        rec.old_data[..old.len()].copy_from_slice(old);
        rec.new_data[..new.len()].copy_from_slice(new);
        rec
    }

    fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        crc32fast::hash(copy.as_bytes())
    }

    fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// A record that fails this check does not exist: torn writes at the
    /// tail of the log land here.
    fn verify(&self) -> bool {
        RecordKind::from_raw(self.kind).is_some()
            && (self.length as usize) <= WAL_DATA_MAX
            && self.checksum == self.compute_checksum()
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_raw(self.kind)
    }

    fn as_sector(&self) -> &[u8; SECTOR_SIZE] {
        self.as_bytes().try_into().expect("record is one sector")
    }
}

/// The log metadata sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct WalMeta {
    magic: u32,
    clean_shutdown: u32,
    last_lsn: u64,
    last_txn_id: u64,
    _unused: [u8; 488],
}

const_assert!(mem::size_of::<WalMeta>() == SECTOR_SIZE);

fn read_meta(dev: &dyn BlockDevice) -> Option<WalMeta> {
    let mut buf = [0u8; SECTOR_SIZE];
    dev.read_sector(WAL_META_SECTOR, &mut buf);
    let meta = WalMeta::read_from(&buf[..]).expect("metadata is one sector");
    (meta.magic == WAL_META_MAGIC).then_some(meta)
}

fn write_meta(dev: &dyn BlockDevice, clean_shutdown: u32, last_lsn: u64, last_txn_id: u64) {
    let meta = WalMeta {
        magic: WAL_META_MAGIC,
        clean_shutdown,
        last_lsn,
        last_txn_id,
        _unused: [0; 488],
    };
    let buf: &[u8; SECTOR_SIZE] = meta.as_bytes().try_into().expect("metadata is one sector");
    dev.write_sector(WAL_META_SECTOR, buf);
}

/// Log counters. Read them through [`Wal::stats`].
#[derive(Clone, Copy, Default, Debug)]
pub struct WalStats {
    pub appends: u64,
    pub flushes: u64,
    pub commits: u64,
    pub aborts: u64,
    pub checkpoints: u64,
    pub recoveries: u64,
}

/// A thread-scoped transaction. A thread holds at most one at a time.
pub struct TxnHandle {
    pub(crate) txn_id: u64,
    pub(crate) first_lsn: u64,
    pub(crate) last_lsn: u64,
}

struct WalInner {
    next_lsn: u64,
    /// Every record with `lsn <= flushed_lsn` is on the device (or has been
    /// superseded at its ring position). Always `<= next_lsn - 1`.
    flushed_lsn: u64,
    next_txn_id: u64,
    buf: ArrayVec<WalRecord, WAL_BUF_RECORDS>,
    active_txns: Vec<u64>,
    checkpoint_lsn: u64,
    checkpointing: bool,
    checkpoint_pending: bool,
    /// A flush has drained records and is writing them with the lock
    /// released.
    flushing: bool,
    stats: WalStats,
}

/// The log manager.
pub struct Wal {
    dev: Arc<dyn BlockDevice>,
    inner: SleepableLock<WalInner>,
}

impl Wal {
    /// Brings the log up. `format` starts from fresh counters and writes
    /// clean metadata; otherwise the metadata sector decides: a bad magic
    /// reinitializes (the caller must assume a fresh file system), a clean
    /// flag restores counters, anything else runs recovery. Either way the
    /// metadata is then rewritten unclean, so a crash during this session
    /// demands recovery on the next boot.
    pub fn new(dev: Arc<dyn BlockDevice>, format: bool) -> Self {
        let mut inner = WalInner {
            next_lsn: 1,
            flushed_lsn: 0,
            next_txn_id: 1,
            buf: ArrayVec::new(),
            active_txns: Vec::new(),
            checkpoint_lsn: 0,
            checkpointing: false,
            checkpoint_pending: false,
            flushing: false,
            stats: WalStats::default(),
        };

        if format {
            write_meta(&*dev, 1, 0, 0);
        } else {
            match read_meta(&*dev) {
                Some(meta) if meta.clean_shutdown == 1 => {
                    inner.next_lsn = meta.last_lsn + 1;
                    inner.flushed_lsn = meta.last_lsn;
                    inner.next_txn_id = meta.last_txn_id + 1;
                    log::info!("wal: clean shutdown, next lsn {}", inner.next_lsn);
                }
                Some(_) => {
                    let (max_lsn, max_txn_id) = recover(&*dev);
                    inner.next_lsn = max_lsn + 1;
                    inner.flushed_lsn = max_lsn;
                    inner.next_txn_id = max_txn_id + 1;
                    inner.stats.recoveries += 1;
                }
                None => {
                    log::warn!("wal: bad metadata magic, reinitializing");
                }
            }
        }

        write_meta(&*dev, 0, inner.next_lsn - 1, inner.next_txn_id - 1);
        Self {
            dev,
            inner: SleepableLock::new(inner),
        }
    }

    /// Starts a transaction: assigns an id, appends its BEGIN record, and
    /// registers it active.
    pub fn txn_begin(&self) -> TxnHandle {
        let mut guard = self.inner.lock();
        let txn_id = guard.next_txn_id;
        guard.next_txn_id += 1;
        let lsn = self.append_locked(&mut guard, WalRecord::control(RecordKind::Begin, txn_id));
        guard.active_txns.push(txn_id);
        TxnHandle {
            txn_id,
            first_lsn: lsn,
            last_lsn: lsn,
        }
    }

    /// Logs a write of `new` over `old` at `offset` within `sector`,
    /// splitting the payload into record-sized chunks.
    pub fn log_write(
        &self,
        txn: &mut TxnHandle,
        sector: u32,
        offset: usize,
        old: &[u8],
        new: &[u8],
    ) {
        assert_eq!(old.len(), new.len(), "wal: old/new length mismatch");
        assert!(offset + new.len() <= SECTOR_SIZE, "wal: range");
        let mut guard = self.inner.lock();
        for start in (0..new.len()).step_by(WAL_DATA_MAX) {
            let end = (start + WAL_DATA_MAX).min(new.len());
            let rec = WalRecord::write(
                txn.txn_id,
                sector,
                (offset + start) as u32,
                &old[start..end],
                &new[start..end],
            );
            txn.last_lsn = self.append_locked(&mut guard, rec);
        }
        assert!(
            txn.last_lsn - txn.first_lsn < WAL_LOG_LEN as u64,
            "wal: transaction too large"
        );
    }

    /// Commits: appends the COMMIT record and flushes the log through it
    /// before returning. Returns true if a checkpoint has come due; the
    /// caller runs it after the commit, never from inside a write path.
    pub fn txn_commit(&self, txn: TxnHandle) -> bool {
        let mut guard = self.inner.lock();
        let lsn = self.append_locked(&mut guard, WalRecord::control(RecordKind::Commit, txn.txn_id));
        self.flush_locked(&mut guard, lsn);
        guard.active_txns.retain(|&t| t != txn.txn_id);
        guard.stats.commits += 1;
        if guard.checkpoint_pending && !guard.checkpointing {
            guard.checkpoint_pending = false;
            true
        } else {
            false
        }
    }

    /// Aborts: replays the transaction's own WRITE records backward through
    /// the cache, restoring old data, then appends an ABORT record.
    pub fn txn_abort(&self, txn: TxnHandle, cache: &Bcache) {
        let mut guard = self.inner.lock();
        let up_to = guard.next_lsn - 1;
        self.flush_locked(&mut guard, up_to);
        let next_lsn = guard.next_lsn;
        drop(guard);

        // The ring holds the last WAL_LOG_LEN records; anything older is
        // gone, which the size assertion in log_write rules out for a
        // single transaction.
        let low = txn
            .first_lsn
            .max(next_lsn.saturating_sub(WAL_LOG_LEN as u64));
        let mut writes = Vec::new();
        for lsn in low..next_lsn {
            let mut buf = [0u8; SECTOR_SIZE];
            self.dev.read_sector(wal_sector(lsn), &mut buf);
            let rec = WalRecord::read_from(&buf[..]).expect("record is one sector");
            if rec.verify()
                && rec.lsn == lsn
                && rec.txn_id == txn.txn_id
                && rec.kind() == Some(RecordKind::Write)
            {
                writes.push(rec);
            }
        }
        // Descending order: the earliest pre-image of a region wins.
        for rec in writes.iter().rev() {
            cache.write(
                rec.sector,
                &rec.old_data[..rec.length as usize],
                rec.offset as usize,
            );
        }
        cache.flush();

        let mut guard = self.inner.lock();
        let _ = self.append_locked(&mut guard, WalRecord::control(RecordKind::Abort, txn.txn_id));
        guard.active_txns.retain(|&t| t != txn.txn_id);
        guard.stats.aborts += 1;
    }

    /// Flushes buffered records with `lsn <= up_to` to the ring.
    pub fn flush(&self, up_to: u64) {
        let mut guard = self.inner.lock();
        self.flush_locked(&mut guard, up_to);
    }

    /// Flushes everything buffered. The cache calls this before writing
    /// any dirty sector back, so logged history always reaches the device
    /// before the data it describes.
    pub fn flush_all(&self) {
        let mut guard = self.inner.lock();
        let up_to = guard.next_lsn - 1;
        self.flush_locked(&mut guard, up_to);
    }

    /// Bounds future recovery work: flushes all data, flushes the log, and
    /// marks the position with a CHECKPOINT record. Afterwards no redo work
    /// exists at or below `checkpoint_lsn`.
    pub fn checkpoint(&self, cache: &Bcache) {
        {
            let mut guard = self.inner.lock();
            if guard.checkpointing {
                return;
            }
            guard.checkpointing = true;
        }
        let _reset = scopeguard::guard((), |()| {
            self.inner.lock().checkpointing = false;
        });

        log::info!("wal: checkpoint");
        cache.flush();
        let mut guard = self.inner.lock();
        let up_to = guard.next_lsn - 1;
        self.flush_locked(&mut guard, up_to);
        let lsn = self.append_locked(&mut guard, WalRecord::control(RecordKind::Checkpoint, 0));
        self.flush_locked(&mut guard, lsn);
        guard.stats.checkpoints += 1;
    }

    /// Flushes the log and writes clean metadata.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let up_to = guard.next_lsn - 1;
        self.flush_locked(&mut guard, up_to);
        let last_lsn = guard.next_lsn - 1;
        let last_txn_id = guard.next_txn_id - 1;
        guard.buf.clear();
        guard.reacquire_after(|| write_meta(&*self.dev, 1, last_lsn, last_txn_id));
    }

    pub fn stats(&self) -> WalStats {
        self.inner.lock().stats
    }

    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    pub fn flushed_lsn(&self) -> u64 {
        self.inner.lock().flushed_lsn
    }

    pub fn active_txn_count(&self) -> usize {
        self.inner.lock().active_txns.len()
    }

    /// Assigns the next LSN, seals the record, and buffers it, flushing
    /// first if the buffer is full.
    fn append_locked(&self, guard: &mut SleepableLockGuard<'_, WalInner>, mut rec: WalRecord) -> u64 {
        while guard.buf.is_full() {
            let up_to = guard.buf.last().expect("full buffer").lsn;
            self.flush_locked(guard, up_to);
        }
        let lsn = guard.next_lsn;
        guard.next_lsn += 1;
        rec.lsn = lsn;
        rec.seal();
        if rec.kind() == Some(RecordKind::Checkpoint) {
            guard.checkpoint_lsn = lsn;
        }
        guard.buf.push(rec);
        guard.stats.appends += 1;
        if !guard.checkpointing
            && lsn.saturating_sub(guard.checkpoint_lsn) >= WAL_CHECKPOINT_THRESHOLD
        {
            guard.checkpoint_pending = true;
        }
        lsn
    }

    /// Advances `flushed_lsn` to at least `up_to`, writing drained records
    /// to their ring sectors with the lock released. Concurrent flushes
    /// wait their turn on the condition variable.
    fn flush_locked(&self, guard: &mut SleepableLockGuard<'_, WalInner>, up_to: u64) {
        let up_to = up_to.min(guard.next_lsn - 1);
        while guard.flushed_lsn < up_to {
            if guard.flushing {
                guard.sleep();
                continue;
            }
            let take = guard.buf.iter().take_while(|r| r.lsn <= up_to).count();
            let batch: Vec<WalRecord> = guard.buf.drain(..take).collect();
            debug_assert!(!batch.is_empty(), "unflushed records must be buffered");
            let last = batch.last().expect("nonempty batch").lsn;
            guard.flushing = true;
            guard.reacquire_after(|| {
                for rec in &batch {
                    self.dev.write_sector(wal_sector(rec.lsn), rec.as_sector());
                }
            });
            guard.flushing = false;
            guard.flushed_lsn = guard.flushed_lsn.max(last);
            guard.stats.flushes += 1;
            guard.wakeup();
        }
    }
}

/// Three-phase recovery against the raw device. Returns the largest valid
/// LSN and transaction id observed.
fn recover(dev: &dyn BlockDevice) -> (u64, u64) {
    // Analysis: sweep the ring, dropping torn records, and classify every
    // transaction seen.
    let mut records = Vec::new();
    for i in 0..WAL_LOG_LEN {
        let mut buf = [0u8; SECTOR_SIZE];
        dev.read_sector(WAL_LOG_START + i, &mut buf);
        let rec = WalRecord::read_from(&buf[..]).expect("record is one sector");
        if rec.verify() {
            records.push(rec);
        } else {
            log::debug!("wal: recovery skips ring slot {}", i);
        }
    }
    records.sort_by_key(|r| r.lsn);

    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    let mut max_lsn = 0;
    let mut max_txn_id = 0;
    let mut checkpoint_lsn = 0;
    for rec in &records {
        max_lsn = max_lsn.max(rec.lsn);
        max_txn_id = max_txn_id.max(rec.txn_id);
        match rec.kind() {
            Some(RecordKind::Commit) => {
                committed.insert(rec.txn_id);
            }
            Some(RecordKind::Abort) => {
                aborted.insert(rec.txn_id);
            }
            Some(RecordKind::Checkpoint) => checkpoint_lsn = rec.lsn,
            _ => {}
        }
    }
    log::info!(
        "wal: recovery found {} records, {} committed txns, max lsn {}",
        records.len(),
        committed.len(),
        max_lsn
    );

    // Redo: committed writes forward. Work at or below the checkpoint is
    // already on disk; redo is idempotent anyway.
    for rec in &records {
        if rec.kind() == Some(RecordKind::Write)
            && committed.contains(&rec.txn_id)
            && rec.lsn > checkpoint_lsn
        {
            log::debug!("wal: redo lsn {} sector {}", rec.lsn, rec.sector);
            apply(dev, rec.sector, rec.offset, &rec.new_data[..rec.length as usize]);
        }
    }

    // Undo: unfinished writes backward, so the earliest pre-image of a
    // twice-written region is the one that sticks.
    for rec in records.iter().rev() {
        if rec.kind() == Some(RecordKind::Write)
            && !committed.contains(&rec.txn_id)
            && !aborted.contains(&rec.txn_id)
        {
            log::debug!("wal: undo lsn {} sector {}", rec.lsn, rec.sector);
            apply(dev, rec.sector, rec.offset, &rec.old_data[..rec.length as usize]);
        }
    }

    (max_lsn, max_txn_id)
}

/// Read-overlay-write of one region of one sector.
fn apply(dev: &dyn BlockDevice, sector: u32, offset: u32, data: &[u8]) {
    let mut buf = [0u8; SECTOR_SIZE];
    dev.read_sector(sector, &mut buf);
    buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    dev.write_sector(sector, &buf);
}
