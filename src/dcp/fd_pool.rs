//! Bounded pool of append-only file handles shared by all bin writers.
//!
//! At most `capacity` files are open at once; opening one more closes the
//! least-recently-used handle, which is transparently reopened in append
//! mode on its next write. Appends to the same filename are serialized by a
//! per-entry lock; the pool itself buffers nothing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct FdPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    slots: HashMap<PathBuf, Slot>,
    clock: u64,
    open_count: usize,
}

struct Slot {
    entry: Arc<PoolEntry>,
    last_used: u64,
    open: bool,
}

struct PoolEntry {
    /// Mirrors the slot's `open` flag so an appender can detect that it was
    /// evicted between admission and acquiring the io lock.
    open: AtomicBool,
    io: Mutex<Option<File>>,
}

impl FdPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                clock: 0,
                open_count: 0,
            }),
        })
    }

    /// Register a filename and get back its append handle. Registering the
    /// same filename twice returns handles to the same underlying entry.
    pub fn register(self: &Arc<Self>, path: &Path) -> FdHandle {
        let mut state = self.state.lock().expect("fd pool state poisoned");
        state.slots.entry(path.to_path_buf()).or_insert_with(|| Slot {
            entry: Arc::new(PoolEntry {
                open: AtomicBool::new(false),
                io: Mutex::new(None),
            }),
            last_used: 0,
            open: false,
        });
        FdHandle {
            pool: self.clone(),
            path: path.to_path_buf(),
        }
    }

    /// Close and forget a filename. Pending appenders finish first.
    pub fn deregister(&self, path: &Path) {
        let entry = {
            let mut state = self.state.lock().expect("fd pool state poisoned");
            match state.slots.remove(path) {
                Some(slot) => {
                    if slot.open {
                        state.open_count -= 1;
                    }
                    slot.entry
                }
                None => return,
            }
        };
        entry.open.store(false, Ordering::SeqCst);
        *entry.io.lock().expect("fd entry poisoned") = None;
    }

    fn append(&self, path: &Path, buf: &[u8]) -> io::Result<usize> {
        loop {
            let (entry, victims) = self.admit(path)?;
            for victim in victims {
                *victim.io.lock().expect("fd entry poisoned") = None;
            }

            let mut io = entry.io.lock().expect("fd entry poisoned");
            if !entry.open.load(Ordering::SeqCst) {
                // evicted between admission and lock; go around again
                continue;
            }
            if io.is_none() {
                *io = Some(OpenOptions::new().append(true).create(true).open(path)?);
            }
            let file = io.as_mut().expect("file opened above");
            return file.write(buf);
        }
    }

    /// Mark the entry open, evicting least-recently-used entries while over
    /// capacity. Victim files are closed by the caller outside this lock.
    fn admit(&self, path: &Path) -> io::Result<(Arc<PoolEntry>, Vec<Arc<PoolEntry>>)> {
        let mut guard = self.state.lock().expect("fd pool state poisoned");
        let state = &mut *guard;
        state.clock += 1;
        let clock = state.clock;

        let slot = state.slots.get_mut(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file {} is not registered with the pool", path.display()),
            )
        })?;
        slot.last_used = clock;
        let entry = slot.entry.clone();
        let newly_opened = !slot.open;
        if newly_opened {
            slot.open = true;
            slot.entry.open.store(true, Ordering::SeqCst);
            state.open_count += 1;
        }

        let mut victims = Vec::new();
        while newly_opened && state.open_count > self.capacity {
            let lru = state
                .slots
                .iter()
                .filter(|(p, s)| s.open && p.as_path() != path)
                .min_by_key(|(_, s)| s.last_used)
                .map(|(p, _)| p.clone());
            let Some(lru_path) = lru else { break };
            let lru_slot = state.slots.get_mut(&lru_path).expect("lru slot exists");
            lru_slot.open = false;
            lru_slot.entry.open.store(false, Ordering::SeqCst);
            victims.push(lru_slot.entry.clone());
            state.open_count -= 1;
        }

        Ok((entry, victims))
    }
}

/// Append callback for one registered filename.
pub struct FdHandle {
    pool: Arc<FdPool>,
    path: PathBuf,
}

impl FdHandle {
    pub fn append(&self, buf: &[u8]) -> io::Result<usize> {
        self.pool.append(&self.path, buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn deregister(self) {
        self.pool.deregister(&self.path);
    }
}
