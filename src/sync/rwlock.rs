//! Fibril reader-writer lock with nominal ownership.
//!
//! Many readers or a single writer. Ownership tracking is approximate for
//! readers: only one of them (the *nominal owner*) is recorded, since
//! tracking every reader would need per-reader linkage.
//!
//! # Reader-Preference Fairness
//!
//! This lock uses a **reader-preference** policy: while readers hold the
//! lock, new readers are admitted immediately even if a writer is queued.
//!
//! ## Fairness Characteristics
//!
//! | Scenario                      | Behavior                                         |
//! |-------------------------------|--------------------------------------------------|
//! | No writer holds the lock      | Readers acquire immediately                      |
//! | Readers hold, writer queued   | New readers still acquire immediately            |
//! | Writer holds                  | Everyone queues in arrival order                 |
//! | Last holder leaves            | Leading readers are granted together, or the     |
//! |                               | leading writer alone                             |
//!
//! ## Starvation Analysis
//!
//! - **Writer starvation**: Possible under continuous read pressure.
//! - **Reader starvation**: Prevented. A writer is granted at most once per
//!   release pass, and readers queued behind it go next.
//!
//! ## Ownership Tracking
//!
//! The reader that takes the lock from zero readers becomes the nominal
//! owner. A departing reader clears the owner only if it was the nominal
//! owner. When the lock is handed over by a release pass, every granted
//! fibril becomes the owner in turn, so the last one granted remains.
//!
//! # Example
//!
//! ```
//! use fibril_sync::runtime::{Runtime, RuntimeConfig};
//! use fibril_sync::sync::RwLock;
//!
//! let mut runtime = Runtime::new(RuntimeConfig::new());
//! runtime
//!     .block_on("main", |cx| async move {
//!         let lock = RwLock::new(cx.domain());
//!         lock.read_lock(&cx).await;
//!         assert!(lock.is_read_locked());
//!         lock.read_unlock(&cx);
//!
//!         lock.write_lock(&cx).await;
//!         assert!(lock.is_write_locked(&cx));
//!         lock.write_unlock(&cx);
//!     })
//!     .unwrap();
//! ```

use super::deadlock::{self, OwnerInfo, OwnerRef};
use super::fatal;
use super::wait::{Ticket, WaitQueue, Waiter};
use crate::cx::Cx;
use crate::error::ContractViolation;
use crate::runtime::Domain;
use crate::runtime::domain::DomainState;
use crate::runtime::park::{ParkDeadline, poll_park};
use crate::types::{FibrilId, RwLockId};
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct RwLockState {
    pub(crate) owner: OwnerInfo,
    pub(crate) readers: u32,
    pub(crate) writers: u32,
    pub(crate) waiters: WaitQueue,
}

impl RwLockState {
    fn new() -> Self {
        Self {
            owner: OwnerInfo::default(),
            readers: 0,
            writers: 0,
            waiters: WaitQueue::new(),
        }
    }

    fn try_acquire(&mut self, mode: AccessMode, caller: FibrilId) -> bool {
        match mode {
            AccessMode::Read if self.writers == 0 => {
                if self.readers == 0 {
                    self.owner.owned_by = Some(caller);
                }
                self.readers += 1;
                true
            }
            AccessMode::Write if self.readers == 0 && self.writers == 0 => {
                self.owner.owned_by = Some(caller);
                self.writers = 1;
                true
            }
            _ => false,
        }
    }
}

/// Requested access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Drops one hold of `id` and runs the release pass if it was the last.
///
/// Counters must already have been validated by the caller.
fn common_unlock(state: &mut DomainState, id: RwLockId, caller: FibrilId) {
    {
        let Some(rw) = state.sync.rwlocks.get_mut(id.arena_index()) else {
            return;
        };
        if rw.readers > 0 {
            rw.readers -= 1;
            if rw.readers > 0 {
                if rw.owner.owned_by == Some(caller) {
                    rw.owner.owned_by = None;
                }
                trace!(rwlock = %id, fibril = %caller, readers = rw.readers, "reader left");
                return;
            }
        } else {
            rw.writers = rw.writers.saturating_sub(1);
        }
        rw.owner.owned_by = None;
    }

    let granted = grant_waiters(state, id);
    trace!(rwlock = %id, fibril = %caller, granted, "rwlock released");
}

/// Admits waiters from the front of the queue for as long as the lock
/// allows: readers until a writer is reached, or a single writer.
fn grant_waiters(state: &mut DomainState, id: RwLockId) -> usize {
    let mut granted: SmallVec<[Waiter; 4]> = SmallVec::new();
    {
        let DomainState { fibrils, sync, .. } = &mut *state;
        let Some(rw) = sync.rwlocks.get_mut(id.arena_index()) else {
            return 0;
        };
        if rw.writers > 0 {
            return 0;
        }
        while let Some(front) = rw.waiters.front().copied() {
            let is_writer = fibrils
                .get(front.fibril.arena_index())
                .is_some_and(|rec| rec.is_writer);
            if is_writer {
                if rw.readers > 0 {
                    break;
                }
                rw.writers += 1;
            } else {
                rw.readers += 1;
            }
            rw.waiters.pop_front();
            rw.owner.owned_by = Some(front.fibril);
            granted.push(front);
            if rw.writers > 0 {
                break;
            }
        }
    }

    let count = granted.len();
    for waiter in granted {
        state.set_waits_for(waiter.fibril, None);
        state.notify(waiter);
    }
    count
}

fn release(
    state: &mut DomainState,
    id: RwLockId,
    caller: FibrilId,
    mode: AccessMode,
) -> Result<(), ContractViolation> {
    let primitive = OwnerRef::RwLock(id);
    let Some(rw) = state.sync.rwlocks.get(id.arena_index()) else {
        return Err(ContractViolation::StalePrimitive {
            primitive: primitive.to_string(),
        });
    };
    match mode {
        AccessMode::Read if rw.readers == 0 => {
            return Err(ContractViolation::ReadUnlockWithoutReaders { primitive, caller });
        }
        AccessMode::Write if rw.writers != 1 || rw.owner.owned_by != Some(caller) => {
            return Err(ContractViolation::WriteUnlockNotHeld {
                primitive,
                caller,
                writers: rw.writers,
                owner: rw.owner.owned_by,
            });
        }
        _ => {}
    }
    common_unlock(state, id, caller);
    Ok(())
}

/// A fibril reader-writer lock. Share it between fibrils with an [`Arc`].
#[derive(Debug)]
pub struct RwLock {
    domain: Arc<Domain>,
    id: RwLockId,
}

impl RwLock {
    /// Creates an unlocked reader-writer lock in `domain`.
    #[must_use]
    pub fn new(domain: &Arc<Domain>) -> Self {
        let id = RwLockId::from_arena(domain.lock().sync.rwlocks.insert(RwLockState::new()));
        trace!(rwlock = %id, "rwlock created");
        Self {
            domain: Arc::clone(domain),
            id,
        }
    }

    /// Handle of this lock's record.
    #[must_use]
    pub fn id(&self) -> RwLockId {
        self.id
    }

    /// Acquires shared access.
    pub fn read_lock<'a>(&'a self, cx: &'a Cx) -> RwLockFuture<'a> {
        self.acquire(cx, AccessMode::Read)
    }

    /// Acquires exclusive access.
    pub fn write_lock<'a>(&'a self, cx: &'a Cx) -> RwLockFuture<'a> {
        self.acquire(cx, AccessMode::Write)
    }

    fn acquire<'a>(&'a self, cx: &'a Cx, mode: AccessMode) -> RwLockFuture<'a> {
        RwLockFuture {
            rwlock: self,
            cx,
            mode,
            phase: AcquirePhase::Init,
        }
    }

    /// Acquires shared access only if that needs no waiting.
    #[must_use]
    pub fn try_read_lock(&self, cx: &Cx) -> bool {
        self.try_acquire(cx, AccessMode::Read)
    }

    /// Acquires exclusive access only if that needs no waiting.
    #[must_use]
    pub fn try_write_lock(&self, cx: &Cx) -> bool {
        self.try_acquire(cx, AccessMode::Write)
    }

    fn try_acquire(&self, cx: &Cx, mode: AccessMode) -> bool {
        self.check_domain(cx, "RwLock::try_lock");
        let caller = cx.fibril_id();
        let mut cs = self.domain.lock();
        let Some(rw) = cs.sync.rwlocks.get_mut(self.id.arena_index()) else {
            return fatal::violation(cs, &self.domain, caller, self.stale());
        };
        rw.try_acquire(mode, caller)
    }

    /// Releases shared access.
    ///
    /// Aborts the process if no reader holds the lock.
    pub fn read_unlock(&self, cx: &Cx) {
        self.unlock(cx, AccessMode::Read);
    }

    /// Releases exclusive access.
    ///
    /// Aborts the process unless the caller holds the write lock.
    pub fn write_unlock(&self, cx: &Cx) {
        self.unlock(cx, AccessMode::Write);
    }

    fn unlock(&self, cx: &Cx, mode: AccessMode) {
        self.check_domain(cx, "RwLock::unlock");
        let caller = cx.fibril_id();
        let mut cs = self.domain.lock();
        if let Err(violation) = release(&mut cs, self.id, caller, mode) {
            fatal::violation(cs, &self.domain, caller, violation);
        }
    }

    /// True if at least one reader holds the lock.
    #[must_use]
    pub fn is_read_locked(&self) -> bool {
        self.readers() > 0
    }

    /// True if the calling fibril holds the write lock.
    #[must_use]
    pub fn is_write_locked(&self, cx: &Cx) -> bool {
        let cs = self.domain.lock();
        cs.sync
            .rwlocks
            .get(self.id.arena_index())
            .is_some_and(|rw| rw.writers > 0 && rw.owner.owned_by == Some(cx.fibril_id()))
    }

    /// True if the lock is read-held by anyone or write-held by the caller.
    #[must_use]
    pub fn is_locked(&self, cx: &Cx) -> bool {
        self.is_read_locked() || self.is_write_locked(cx)
    }

    /// Number of readers holding the lock.
    #[must_use]
    pub fn readers(&self) -> u32 {
        self.domain
            .lock()
            .sync
            .rwlocks
            .get(self.id.arena_index())
            .map_or(0, |rw| rw.readers)
    }

    /// Nominal owner.
    #[must_use]
    pub fn owner(&self) -> Option<FibrilId> {
        self.domain.lock().owner_of(OwnerRef::RwLock(self.id))
    }

    /// Number of fibrils queued for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.domain
            .lock()
            .sync
            .rwlocks
            .get(self.id.arena_index())
            .map_or(0, |rw| rw.waiters.len())
    }

    fn stale(&self) -> ContractViolation {
        ContractViolation::StalePrimitive {
            primitive: OwnerRef::RwLock(self.id).to_string(),
        }
    }

    fn check_domain(&self, cx: &Cx, operation: &'static str) {
        if !Arc::ptr_eq(cx.domain(), &self.domain) {
            fatal::violation(
                self.domain.lock(),
                &self.domain,
                cx.fibril_id(),
                ContractViolation::ForeignDomain { operation },
            );
        }
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        let mut cs = self.domain.lock();
        if let Some(state) = cs.sync.rwlocks.remove(self.id.arena_index()) {
            if state.readers > 0 || state.writers > 0 || !state.waiters.is_empty() {
                warn!(
                    rwlock = %self.id,
                    readers = state.readers,
                    writers = state.writers,
                    waiters = state.waiters.len(),
                    "rwlock dropped while in use"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquirePhase {
    Init,
    Waiting(Ticket),
    Done,
}

/// Future returned by [`RwLock::read_lock`] and [`RwLock::write_lock`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct RwLockFuture<'a> {
    rwlock: &'a RwLock,
    cx: &'a Cx,
    mode: AccessMode,
    phase: AcquirePhase,
}

impl Future for RwLockFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        let rwlock = self.rwlock;
        let cx = self.cx;
        let mode = self.mode;
        let caller = cx.fibril_id();
        let domain = &rwlock.domain;

        match self.phase {
            AcquirePhase::Init => {
                rwlock.check_domain(cx, "RwLock::lock");
                let target = OwnerRef::RwLock(rwlock.id);
                let mut cs = domain.lock();
                let Some(rw) = cs.sync.rwlocks.get_mut(rwlock.id.arena_index()) else {
                    return fatal::violation(cs, domain, caller, rwlock.stale());
                };
                if rw.try_acquire(mode, caller) {
                    drop(cs);
                    trace!(rwlock = %rwlock.id, fibril = %caller, ?mode, "rwlock acquired");
                    self.phase = AcquirePhase::Done;
                    return Poll::Ready(());
                }

                cs.set_is_writer(caller, mode == AccessMode::Write);
                deadlock::check_for_deadlock(&mut cs, domain, target, caller);
                let ticket = cs.next_ticket();
                if let Some(rw) = cs.sync.rwlocks.get_mut(rwlock.id.arena_index()) {
                    rw.waiters.push_back(Waiter {
                        ticket,
                        fibril: caller,
                    });
                }
                cs.set_waits_for(caller, Some(target));
                cs.register_waker(caller, task.waker());
                drop(cs);
                trace!(rwlock = %rwlock.id, fibril = %caller, ?mode, "rwlock contended, queued");
                self.phase = AcquirePhase::Waiting(ticket);
                Poll::Pending
            }
            AcquirePhase::Waiting(ticket) => {
                let now = domain.now();
                let mut cs = domain.lock();
                let mut deadline = ParkDeadline::never();
                match poll_park(&mut cs, now, caller, ticket, &mut deadline, task) {
                    Poll::Ready(_) => {
                        drop(cs);
                        self.phase = AcquirePhase::Done;
                        Poll::Ready(())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            AcquirePhase::Done => Poll::Ready(()),
        }
    }
}

impl Drop for RwLockFuture<'_> {
    fn drop(&mut self) {
        let AcquirePhase::Waiting(ticket) = self.phase else {
            return;
        };
        let caller = self.cx.fibril_id();
        let id = self.rwlock.id;
        let mut cs = self.rwlock.domain.lock();
        if cs.take_notification(caller, ticket) {
            // Already granted by a release pass; give it back.
            if let Err(violation) = release(&mut cs, id, caller, self.mode) {
                warn!(rwlock = %id, %violation, "abandoned grant not released");
            }
            return;
        }
        let removed = cs
            .sync
            .rwlocks
            .get_mut(id.arena_index())
            .is_some_and(|rw| rw.waiters.remove(ticket));
        cs.set_waits_for(caller, None);
        // Waiters queued behind the abandoned one may now be admissible.
        let granted = if removed { grant_waiters(&mut cs, id) } else { 0 };
        trace!(rwlock = %id, fibril = %caller, granted, "pending rwlock acquire abandoned");
    }
}
