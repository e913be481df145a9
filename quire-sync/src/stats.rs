//! Lock-free counters shared by the registry and its sessions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the sync counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub loads: u64,
    pub changes_applied: u64,
    pub renames_applied: u64,
    pub content_writes: u64,
    pub name_writes: u64,
    pub failed_writes: u64,
}

#[derive(Default)]
pub(crate) struct AtomicSyncStats {
    pub sessions_created: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub loads: AtomicU64,
    pub changes_applied: AtomicU64,
    pub renames_applied: AtomicU64,
    pub content_writes: AtomicU64,
    pub name_writes: AtomicU64,
    pub failed_writes: AtomicU64,
}

impl AtomicSyncStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            changes_applied: self.changes_applied.load(Ordering::Relaxed),
            renames_applied: self.renames_applied.load(Ordering::Relaxed),
            content_writes: self.content_writes.load(Ordering::Relaxed),
            name_writes: self.name_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }
}
