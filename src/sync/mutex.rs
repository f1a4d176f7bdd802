//! Fibril mutex with ownership tracking and FIFO hand-off.
//!
//! The record keeps a token counter: `tokens > 0` means unlocked,
//! `tokens <= 0` means locked with `-tokens` fibrils queued. Unlocking with
//! waiters hands ownership directly to the oldest one; the lock is never
//! observably free in between, so a fibril arriving later cannot barge in.
//!
//! Every contended `lock` runs the ownership-chain check before queueing.
//! Locking a mutex the caller already owns is therefore reported as a
//! deadlock rather than hanging.
//!
//! # Example
//!
//! ```
//! use fibril_sync::runtime::{Runtime, RuntimeConfig};
//! use fibril_sync::sync::Mutex;
//! use std::sync::Arc;
//!
//! let mut runtime = Runtime::new(RuntimeConfig::new());
//! let mutex = Arc::new(Mutex::new(runtime.domain()));
//! let worker = Arc::clone(&mutex);
//! runtime.spawn("worker", move |cx| async move {
//!     worker.lock(&cx).await;
//!     worker.unlock(&cx);
//! });
//! runtime.run().unwrap();
//! assert!(!mutex.is_locked());
//! ```

use super::deadlock::{self, OwnerInfo, OwnerRef};
use super::fatal;
use super::wait::{Ticket, WaitQueue, Waiter};
use crate::cx::Cx;
use crate::error::ContractViolation;
use crate::runtime::Domain;
use crate::runtime::domain::DomainState;
use crate::runtime::park::{ParkDeadline, poll_park};
use crate::types::{FibrilId, MutexId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct MutexState {
    pub(crate) owner: OwnerInfo,
    pub(crate) tokens: i64,
    pub(crate) waiters: WaitQueue,
}

impl MutexState {
    pub(crate) fn new() -> Self {
        Self {
            owner: OwnerInfo::default(),
            tokens: 1,
            waiters: WaitQueue::new(),
        }
    }
}

/// Releases `id` on behalf of `caller`, handing ownership to the oldest
/// waiter if there is one.
///
/// Shared by [`Mutex::unlock`], condition-variable waits and abandoned
/// lock futures.
pub(crate) fn release(
    state: &mut DomainState,
    id: MutexId,
    caller: FibrilId,
) -> Result<(), ContractViolation> {
    let Some(mutex) = state.sync.mutexes.get_mut(id.arena_index()) else {
        return Err(ContractViolation::StalePrimitive {
            primitive: OwnerRef::Mutex(id).to_string(),
        });
    };
    if mutex.owner.owned_by != Some(caller) {
        return Err(ContractViolation::UnlockByNonOwner {
            primitive: OwnerRef::Mutex(id),
            caller,
            owner: mutex.owner.owned_by,
        });
    }

    let previous = mutex.tokens;
    mutex.tokens += 1;
    if previous < 0 {
        let Some(next) = mutex.waiters.pop_front() else {
            return Err(ContractViolation::CorruptQueue {
                primitive: OwnerRef::Mutex(id).to_string(),
            });
        };
        mutex.owner.owned_by = Some(next.fibril);
        state.set_waits_for(next.fibril, None);
        state.notify(next);
        trace!(mutex = %id, from = %caller, to = %next.fibril, "mutex handed off");
    } else {
        mutex.owner.owned_by = None;
        trace!(mutex = %id, fibril = %caller, "mutex released");
    }
    Ok(())
}

/// A fibril mutex.
///
/// The mutex guards no data of its own; it serializes fibrils. Share it
/// between fibrils with an [`Arc`].
#[derive(Debug)]
pub struct Mutex {
    domain: Arc<Domain>,
    id: MutexId,
}

impl Mutex {
    /// Creates an unlocked mutex in `domain`.
    #[must_use]
    pub fn new(domain: &Arc<Domain>) -> Self {
        let id = MutexId::from_arena(domain.lock().sync.mutexes.insert(MutexState::new()));
        trace!(mutex = %id, "mutex created");
        Self {
            domain: Arc::clone(domain),
            id,
        }
    }

    /// Handle of this mutex's record.
    #[must_use]
    pub fn id(&self) -> MutexId {
        self.id
    }

    pub(crate) fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Locks the mutex, waiting in FIFO order if it is held.
    ///
    /// Aborts the process if waiting would close an ownership cycle,
    /// including the caller already owning this mutex.
    pub fn lock<'a>(&'a self, cx: &'a Cx) -> LockFuture<'a> {
        LockFuture {
            mutex: self,
            cx,
            phase: LockPhase::Init,
        }
    }

    /// Locks the mutex only if it is free right now.
    #[must_use]
    pub fn try_lock(&self, cx: &Cx) -> bool {
        self.check_domain(cx, "Mutex::try_lock");
        let caller = cx.fibril_id();
        let mut cs = self.domain.lock();
        let Some(mutex) = cs.sync.mutexes.get_mut(self.id.arena_index()) else {
            return fatal::violation(cs, &self.domain, caller, self.stale());
        };
        if mutex.tokens > 0 {
            mutex.tokens -= 1;
            mutex.owner.owned_by = Some(caller);
            trace!(mutex = %self.id, fibril = %caller, "mutex try_lock acquired");
            true
        } else {
            false
        }
    }

    /// Unlocks the mutex.
    ///
    /// Aborts the process if the caller is not the owner.
    pub fn unlock(&self, cx: &Cx) {
        self.check_domain(cx, "Mutex::unlock");
        let caller = cx.fibril_id();
        let mut cs = self.domain.lock();
        if let Err(violation) = release(&mut cs, self.id, caller) {
            fatal::violation(cs, &self.domain, caller, violation);
        }
    }

    /// True if the calling fibril owns the mutex.
    #[must_use]
    pub fn is_locked_by_caller(&self, cx: &Cx) -> bool {
        self.owner() == Some(cx.fibril_id())
    }

    /// True if any fibril owns the mutex.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.domain
            .lock()
            .sync
            .mutexes
            .get(self.id.arena_index())
            .is_some_and(|m| m.tokens <= 0)
    }

    /// Current owner.
    #[must_use]
    pub fn owner(&self) -> Option<FibrilId> {
        self.domain.lock().owner_of(OwnerRef::Mutex(self.id))
    }

    /// Number of fibrils queued for the mutex.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.domain
            .lock()
            .sync
            .mutexes
            .get(self.id.arena_index())
            .map_or(0, |m| m.waiters.len())
    }

    fn stale(&self) -> ContractViolation {
        ContractViolation::StalePrimitive {
            primitive: OwnerRef::Mutex(self.id).to_string(),
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

impl Drop for Mutex {
    fn drop(&mut self) {
        let mut cs = self.domain.lock();
        if let Some(state) = cs.sync.mutexes.remove(self.id.arena_index()) {
            if state.owner.owned_by.is_some() || !state.waiters.is_empty() {
                warn!(
                    mutex = %self.id,
                    owner = ?state.owner.owned_by,
                    waiters = state.waiters.len(),
                    "mutex dropped while in use"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockPhase {
    Init,
    Waiting(Ticket),
    Done,
}

/// Future returned by [`Mutex::lock`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'a> {
    mutex: &'a Mutex,
    cx: &'a Cx,
    phase: LockPhase,
}

impl Future for LockFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        let mutex = self.mutex;
        let cx = self.cx;
        let caller = cx.fibril_id();
        let domain = &mutex.domain;

        match self.phase {
            LockPhase::Init => {
                mutex.check_domain(cx, "Mutex::lock");
                let target = OwnerRef::Mutex(mutex.id);
                let mut cs = domain.lock();
                let Some(state) = cs.sync.mutexes.get_mut(mutex.id.arena_index()) else {
                    return fatal::violation(cs, domain, caller, mutex.stale());
                };
                let previous = state.tokens;
                state.tokens -= 1;
                if previous > 0 {
                    state.owner.owned_by = Some(caller);
                    drop(cs);
                    trace!(mutex = %mutex.id, fibril = %caller, "mutex acquired");
                    self.phase = LockPhase::Done;
                    return Poll::Ready(());
                }

                deadlock::check_for_deadlock(&mut cs, domain, target, caller);
                let ticket = cs.next_ticket();
                if let Some(state) = cs.sync.mutexes.get_mut(mutex.id.arena_index()) {
                    state.waiters.push_back(Waiter {
                        ticket,
                        fibril: caller,
                    });
                }
                cs.set_waits_for(caller, Some(target));
                cs.register_waker(caller, task.waker());
                drop(cs);
                trace!(mutex = %mutex.id, fibril = %caller, "mutex contended, queued");
                self.phase = LockPhase::Waiting(ticket);
                Poll::Pending
            }
            LockPhase::Waiting(ticket) => {
                let now = domain.now();
                let mut cs = domain.lock();
                let mut deadline = ParkDeadline::never();
                match poll_park(&mut cs, now, caller, ticket, &mut deadline, task) {
                    Poll::Ready(_) => {
                        drop(cs);
                        self.phase = LockPhase::Done;
                        Poll::Ready(())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            LockPhase::Done => Poll::Ready(()),
        }
    }
}

impl Drop for LockFuture<'_> {
    fn drop(&mut self) {
        let LockPhase::Waiting(ticket) = self.phase else {
            return;
        };
        let caller = self.cx.fibril_id();
        let mut cs = self.mutex.domain.lock();
        if cs.take_notification(caller, ticket) {
            // Ownership was already handed to us; pass it on.
            if let Err(violation) = release(&mut cs, self.mutex.id, caller) {
                warn!(mutex = %self.mutex.id, %violation, "abandoned hand-off not released");
            }
            return;
        }
        if let Some(state) = cs.sync.mutexes.get_mut(self.mutex.id.arena_index()) {
            if state.waiters.remove(ticket) {
                state.tokens += 1;
            }
        }
        cs.set_waits_for(caller, None);
        trace!(mutex = %self.mutex.id, fibril = %caller, "pending lock abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex as Log;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> impl Future<Output = Poll<F::Output>> + '_ {
        std::future::poll_fn(move |task| Poll::Ready(Pin::new(&mut *fut).poll(task)))
    }

    #[test]
    fn uncontended_lock_and_try_lock() {
        init_test("uncontended_lock_and_try_lock");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        runtime
            .block_on("main", |cx| async move {
                let mutex = Mutex::new(cx.domain());
                crate::assert_with_log!(!mutex.is_locked(), "starts unlocked", false, mutex.is_locked());

                mutex.lock(&cx).await;
                assert!(mutex.is_locked_by_caller(&cx));
                assert_eq!(mutex.owner(), Some(cx.fibril_id()));
                let second = mutex.try_lock(&cx);
                crate::assert_with_log!(!second, "try_lock fails while held", false, second);

                mutex.unlock(&cx);
                assert!(!mutex.is_locked());
                let third = mutex.try_lock(&cx);
                crate::assert_with_log!(third, "try_lock succeeds when free", true, third);
                mutex.unlock(&cx);
            })
            .expect("run");
        crate::test_complete!("uncontended_lock_and_try_lock");
    }

    #[test]
    fn waiters_acquire_in_arrival_order() {
        init_test("waiters_acquire_in_arrival_order");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let order = Arc::new(Log::new(Vec::new()));
        let mutex = Arc::new(Mutex::new(runtime.domain()));

        let holder = Arc::clone(&mutex);
        runtime.spawn("holder", move |cx| async move {
            holder.lock(&cx).await;
            // Let every waiter queue up behind us.
            cx.yield_now().await;
            cx.yield_now().await;
            assert_eq!(holder.waiters(), 3);
            holder.unlock(&cx);
        });
        for name in ["w1", "w2", "w3"] {
            let mutex = Arc::clone(&mutex);
            let order = Arc::clone(&order);
            runtime.spawn(name, move |cx| async move {
                mutex.lock(&cx).await;
                order.lock().push(name);
                cx.yield_now().await;
                mutex.unlock(&cx);
            });
        }

        let report = runtime.run().expect("run");
        let order = order.lock().clone();
        crate::assert_with_log!(
            order == ["w1", "w2", "w3"],
            "FIFO hand-off",
            ["w1", "w2", "w3"],
            order
        );
        assert!(report.is_quiescent());
        assert!(!mutex.is_locked());
        crate::test_complete!("waiters_acquire_in_arrival_order");
    }

    #[test]
    fn abandoned_wait_restores_tokens() {
        init_test("abandoned_wait_restores_tokens");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let mutex = Arc::new(Mutex::new(runtime.domain()));
        let holder = Arc::clone(&mutex);
        runtime
            .block_on("holder", move |cx| async move {
                holder.lock(&cx).await;
                let waiter = Arc::clone(&holder);
                cx.spawn("impatient", move |cx| async move {
                    let mut fut = Box::pin(waiter.lock(&cx));
                    let first = poll_once(&mut fut).await;
                    assert!(first.is_pending());
                    assert_eq!(waiter.waiters(), 1);
                    drop(fut);
                    assert_eq!(waiter.waiters(), 0);
                });
                cx.yield_now().await;
                cx.yield_now().await;
                holder.unlock(&cx);
            })
            .expect("run");
        crate::assert_with_log!(
            !mutex.is_locked(),
            "no phantom owner",
            false,
            mutex.is_locked()
        );
        crate::test_complete!("abandoned_wait_restores_tokens");
    }

    #[test]
    fn abandoned_hand_off_is_passed_on() {
        init_test("abandoned_hand_off_is_passed_on");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let mutex = Arc::new(Mutex::new(runtime.domain()));
        let observed = Arc::new(Log::new(None));

        let root_mutex = Arc::clone(&mutex);
        let root_observed = Arc::clone(&observed);
        runtime
            .block_on("holder", move |cx| async move {
                root_mutex.lock(&cx).await;
                let waiter = Arc::clone(&root_mutex);
                let observed = Arc::clone(&root_observed);
                cx.spawn("late", move |cx| async move {
                    let mut fut = Box::pin(waiter.lock(&cx));
                    assert!(poll_once(&mut fut).await.is_pending());
                    cx.yield_now().await;
                    // The holder unlocked meanwhile and handed us the lock.
                    let handed = waiter.owner() == Some(cx.fibril_id());
                    drop(fut);
                    *observed.lock() = Some((handed, waiter.is_locked()));
                });
                cx.yield_now().await;
                root_mutex.unlock(&cx);
                cx.yield_now().await;
                cx.yield_now().await;
            })
            .expect("run");
        let observed = *observed.lock();
        crate::assert_with_log!(
            observed == Some((true, false)),
            "handed over, then released on drop",
            Some((true, false)),
            observed
        );
        crate::test_complete!("abandoned_hand_off_is_passed_on");
    }
}
