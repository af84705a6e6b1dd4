//! File handles.
//!
//! A `File` is a shared handle on an open inode with a byte position. A
//! handle duplicated with `dup` shares its position and its reference
//! count with the original (fork-style descriptor duplication); `reopen`
//! gets an independent handle with its own position instead. The handle's
//! own lock serializes the position against dup/close races. The last
//! handle to go closes the inode.
//!
//! Writes run a few sectors per transaction so no single transaction
//! outgrows the log ring.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fs::inode::Inode;
use crate::fs::FileSys;
use crate::param::{MAX_TX_SECTORS, SECTOR_SIZE};

struct FileState {
    inode: Option<Arc<Inode>>,
    pos: u32,
    /// This handle is holding a write-deny on the inode.
    denied: bool,
}

struct FileShared {
    fs: Arc<FileSys>,
    state: Mutex<FileState>,
}

/// An open file handle.
#[derive(Clone)]
pub struct File {
    shared: Arc<FileShared>,
}

impl File {
    pub(crate) fn new(fs: Arc<FileSys>, inode: Arc<Inode>) -> File {
        File {
            shared: Arc::new(FileShared {
                fs,
                state: Mutex::new(FileState {
                    inode: Some(inode),
                    pos: 0,
                    denied: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads from the current position, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state();
        let inode = Arc::clone(state.inode.as_ref().expect("file: closed"));
        let n = inode.read_at(&self.shared.fs, buf, state.pos);
        state.pos += n as u32;
        n
    }

    /// Writes at the current position, advancing it by the bytes written.
    /// Returns less than `buf.len()` when space runs out, and 0 when
    /// writes are denied.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut state = self.state();
        let inode = Arc::clone(state.inode.as_ref().expect("file: closed"));
        let fs = &self.shared.fs;
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(MAX_TX_SECTORS * SECTOR_SIZE);
            let mut tx = fs.begin_tx();
            let n = inode.write_at(&mut tx, &buf[done..done + want], state.pos);
            if n == 0 {
                tx.abort();
                break;
            }
            tx.commit();
            state.pos += n as u32;
            done += n;
            if n < want {
                break;
            }
        }
        done
    }

    pub fn seek(&self, pos: u32) {
        self.state().pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.state().pos
    }

    pub fn length(&self) -> u32 {
        let state = self.state();
        state.inode.as_ref().expect("file: closed").length()
    }

    /// Blocks writes through any handle of this inode until allowed again.
    /// Idempotent per handle; the deny is dropped at close.
    pub fn deny_write(&self) {
        let mut state = self.state();
        if !state.denied {
            state.denied = true;
            state.inode.as_ref().expect("file: closed").deny_write();
        }
    }

    pub fn allow_write(&self) {
        let mut state = self.state();
        if state.denied {
            state.denied = false;
            state.inode.as_ref().expect("file: closed").allow_write();
        }
    }

    /// Duplicates the handle; position and reference count are shared.
    pub fn dup(&self) -> File {
        self.clone()
    }

    /// A fresh handle on the same inode with its own position.
    pub fn reopen(&self) -> File {
        let state = self.state();
        let fs = &self.shared.fs;
        let sector = state.inode.as_ref().expect("file: closed").sector;
        let inode = fs.itable().open(fs, sector);
        drop(state);
        File::new(Arc::clone(fs), inode)
    }

    /// Explicit close; equivalent to dropping the last duplicate.
    pub fn close(self) {}
}

impl Drop for FileShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(inode) = state.inode.take() {
            if state.denied {
                inode.allow_write();
            }
            self.fs.itable().close(&self.fs, inode);
        }
    }
}
