//! Per-domain tables of primitive records.

use super::condvar::CondvarState;
use super::deadlock::{OwnerInfo, OwnerRef};
use super::mutex::MutexState;
use super::rwlock::RwLockState;
use super::semaphore::SemaphoreState;
use crate::types::{FibrilId, MutexId, RwLockId};
use crate::util::Arena;

#[derive(Debug, Default)]
pub(crate) struct SyncTables {
    pub(crate) mutexes: Arena<MutexState>,
    pub(crate) rwlocks: Arena<RwLockState>,
    pub(crate) condvars: Arena<CondvarState>,
    pub(crate) semaphores: Arena<SemaphoreState>,
}

impl SyncTables {
    /// Ownership record of a mutex or rwlock, `None` once it is gone.
    pub(crate) fn owner_info(&self, target: OwnerRef) -> Option<&OwnerInfo> {
        match target {
            OwnerRef::Mutex(id) => self.mutexes.get(id.arena_index()).map(|m| &m.owner),
            OwnerRef::RwLock(id) => self.rwlocks.get(id.arena_index()).map(|rw| &rw.owner),
        }
    }

    /// Every ownership primitive currently (nominally) owned by `fibril`.
    pub(crate) fn owned_by(&self, fibril: FibrilId) -> Vec<OwnerRef> {
        let mutexes = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner.owned_by == Some(fibril))
            .map(|(idx, _)| OwnerRef::Mutex(MutexId::from_arena(idx)));
        let rwlocks = self
            .rwlocks
            .iter()
            .filter(|(_, rw)| rw.owner.owned_by == Some(fibril))
            .map(|(idx, _)| OwnerRef::RwLock(RwLockId::from_arena(idx)));
        mutexes.chain(rwlocks).collect()
    }
}
