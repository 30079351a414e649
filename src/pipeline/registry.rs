//! Lock-count registry for hardware buffers handed to consumers

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use tracing::{trace, warn};

use crate::engine::{HwFrameDescriptor, VideoMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

/// Handle to a decoded frame living in VPU memory
///
/// Cheap to clone; every clone refers to the same buffer. The descriptor is
/// immutable for as long as any lock on the buffer is outstanding. Clones
/// may outlive the memory: once freed, the buffer can never be locked again.
#[derive(Clone)]
pub struct HwBuffer {
    id: BufferId,
    descriptor: Arc<HwFrameDescriptor>,
    /// Set, under the registry lock, when the memory is freed.
    retired: Arc<AtomicBool>,
}

impl HwBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The video memory behind this handle has been freed.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> &HwFrameDescriptor {
        &self.descriptor
    }

    pub fn physical_address(&self) -> u32 {
        self.descriptor.mem.phys_addr
    }

    pub fn virtual_address(&self) -> u64 {
        self.descriptor.mem.vir_addr
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.descriptor.frame_width, self.descriptor.frame_height)
    }

    pub fn display_size(&self) -> (u32, u32) {
        (self.descriptor.display_width, self.descriptor.display_height)
    }
}

impl fmt::Debug for HwBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwBuffer")
            .field("id", &self.id)
            .field("phys", &format_args!("{:#x}", self.descriptor.mem.phys_addr))
            .field("frame", &self.frame_size())
            .field("display", &self.display_size())
            .finish()
    }
}

/// Result of releasing one lock on a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// That was the last lock; the video memory is gone.
    Freed,
    /// Other holders remain.
    StillLocked(usize),
    /// The buffer held no locks. Reported, never double-freed.
    NotTracked,
}

impl Release {
    /// True when the caller may forget the buffer.
    pub fn is_freed(self) -> bool {
        !matches!(self, Release::StillLocked(_))
    }
}

struct BusyEntry {
    buffer: HwBuffer,
    locks: usize,
}

impl BusyEntry {
    /// Only called with the registry lock held.
    fn retire(self) -> HwBuffer {
        self.buffer.retired.store(true, Ordering::Release);
        self.buffer
    }
}

#[derive(Default)]
struct Stats {
    locks: AtomicUsize,
    releases: AtomicUsize,
    frees: AtomicUsize,
    untracked_releases: AtomicUsize,
    refused_locks: AtomicUsize,
}

/// Snapshot of the registry counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub locks: usize,
    pub releases: usize,
    pub frees: usize,
    /// Releases of buffers holding no locks.
    pub untracked_releases: usize,
    /// Locks refused because the buffer was already freed.
    pub refused_locks: usize,
}

/// Tracks which hardware buffers are in use and by how many holders.
pub struct BufferRegistry {
    busy: Mutex<HashMap<BufferId, BusyEntry>>,
    memory: Arc<dyn VideoMemory>,
    next_id: AtomicU64,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl BufferRegistry {
    pub fn new(memory: Arc<dyn VideoMemory>) -> Self {
        Self {
            busy: Mutex::new(HashMap::new()),
            memory,
            next_id: AtomicU64::new(1),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Wrap a descriptor whose video memory reference now belongs to the
    /// registry. It is not locked yet.
    pub fn register(&self, descriptor: HwFrameDescriptor) -> HwBuffer {
        HwBuffer {
            id: BufferId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            descriptor: Arc::new(descriptor),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a descriptor and take its first lock.
    pub fn track(&self, descriptor: HwFrameDescriptor) -> HwBuffer {
        let buffer = self.register(descriptor);
        self.insert_lock(&mut self.busy(), &buffer);
        buffer
    }

    /// Add one lock on `buffer`.
    ///
    /// Returns false, and changes nothing, if the buffer's memory has already
    /// been freed.
    pub fn lock(&self, buffer: &HwBuffer) -> bool {
        let mut busy = self.busy();
        if buffer.is_retired() {
            warn!(id = ?buffer.id, "lock of a buffer that was already freed");
            self.stats.refused_locks.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.insert_lock(&mut busy, buffer);
        true
    }

    fn insert_lock(&self, busy: &mut HashMap<BufferId, BusyEntry>, buffer: &HwBuffer) {
        let entry = busy.entry(buffer.id).or_insert_with(|| BusyEntry {
            buffer: buffer.clone(),
            locks: 0,
        });
        entry.locks += 1;
        trace!(id = ?buffer.id, locks = entry.locks, "locked buffer");
        self.stats.locks.fetch_add(1, Ordering::Relaxed);
    }

    fn busy(&self) -> MutexGuard<'_, HashMap<BufferId, BusyEntry>> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one lock on `buffer`, freeing its memory with the last one.
    pub fn release(&self, buffer: &HwBuffer) -> Release {
        let freed = {
            let mut busy = self.busy();
            let Some(entry) = busy.get_mut(&buffer.id) else {
                warn!(id = ?buffer.id, "release of a buffer holding no locks");
                self.stats.untracked_releases.fetch_add(1, Ordering::Relaxed);
                return Release::NotTracked;
            };

            entry.locks -= 1;
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
            if entry.locks > 0 {
                return Release::StillLocked(entry.locks);
            }
            busy.remove(&buffer.id).map(|entry| entry.retire())
        };

        if let Some(buffer) = freed {
            self.free(&buffer);
        }
        Release::Freed
    }

    /// Free every busy buffer regardless of its lock count.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = {
            let mut busy = self.busy();
            busy.drain().map(|(_, entry)| entry.retire()).collect()
        };

        for buffer in &drained {
            self.free(buffer);
        }
        drained.len()
    }

    pub fn lock_count(&self, buffer: &HwBuffer) -> usize {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&buffer.id)
            .map_or(0, |entry| entry.locks)
    }

    /// Number of distinct buffers with at least one lock.
    pub fn busy_count(&self) -> usize {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            locks: self.stats.locks.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
            untracked_releases: self.stats.untracked_releases.load(Ordering::Relaxed),
            refused_locks: self.stats.refused_locks.load(Ordering::Relaxed),
        }
    }

    fn free(&self, buffer: &HwBuffer) {
        trace!(id = ?buffer.id, "freeing buffer");
        if buffer.descriptor.mem.vir_addr != 0 {
            self.memory.free(&buffer.descriptor.mem);
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }
}
