//! Condition variable paired with a fibril [`Mutex`].
//!
//! Waiting releases the mutex and links a wait record on the condition
//! variable inside one critical section, so a signal sent right after the
//! release cannot be missed. Signals are not buffered: `signal` with nobody
//! waiting does nothing.
//!
//! Timeouts are given in microseconds with the historical convention:
//!
//! | `timeout_us` | Behavior                                              |
//! |--------------|-------------------------------------------------------|
//! | `< 0`        | `Err(TimedOut)` immediately; the mutex stays held     |
//! | `0`          | Waits until signalled                                 |
//! | `> 0`        | Waits until signalled or the deadline passes          |
//!
//! In every case the mutex is held again when the wait returns.

use super::fatal;
use super::mutex::{self, Mutex};
use super::wait::{Ticket, WaitQueue, Waiter};
use super::OwnerRef;
use crate::cx::Cx;
use crate::error::{ContractViolation, TimedOut};
use crate::runtime::Domain;
use crate::runtime::park::Park;
use crate::types::{CondvarId, FibrilId};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct CondvarState {
    pub(crate) waiters: WaitQueue,
}

/// A fibril condition variable. Share it between fibrils with an [`Arc`].
#[derive(Debug)]
pub struct Condvar {
    domain: Arc<Domain>,
    id: CondvarId,
}

impl Condvar {
    /// Creates a condition variable in `domain`.
    #[must_use]
    pub fn new(domain: &Arc<Domain>) -> Self {
        let id = CondvarId::from_arena(domain.lock().sync.condvars.insert(CondvarState {
            waiters: WaitQueue::new(),
        }));
        trace!(condvar = %id, "condvar created");
        Self {
            domain: Arc::clone(domain),
            id,
        }
    }

    /// Handle of this condition variable's record.
    #[must_use]
    pub fn id(&self) -> CondvarId {
        self.id
    }

    /// Waits until signalled.
    ///
    /// Aborts the process if the caller does not hold `mutex`.
    pub async fn wait(&self, cx: &Cx, mutex: &Mutex) {
        let _ = self.wait_timeout(cx, mutex, 0).await;
    }

    /// Waits until signalled or until `timeout_us` microseconds pass.
    ///
    /// Aborts the process if the caller does not hold `mutex` or if `mutex`
    /// belongs to another domain.
    ///
    /// # Errors
    ///
    /// Returns [`TimedOut`] if the deadline passed before a signal arrived,
    /// or right away if `timeout_us` is negative.
    pub async fn wait_timeout(&self, cx: &Cx, mutex: &Mutex, timeout_us: i64) -> Result<(), TimedOut> {
        let caller = cx.fibril_id();
        if !Arc::ptr_eq(mutex.domain(), &self.domain) || !Arc::ptr_eq(cx.domain(), &self.domain) {
            fatal::violation(
                self.domain.lock(),
                &self.domain,
                caller,
                ContractViolation::ForeignDomain {
                    operation: "Condvar::wait_timeout",
                },
            );
        }
        if !mutex.is_locked_by_caller(cx) {
            fatal::violation(
                self.domain.lock(),
                &self.domain,
                caller,
                ContractViolation::LockNotHeld {
                    primitive: OwnerRef::Mutex(mutex.id()),
                    caller,
                    operation: "Condvar::wait_timeout",
                },
            );
        }
        if timeout_us < 0 {
            return Err(TimedOut::new(cx.now()));
        }
        let deadline = (timeout_us > 0)
            .then(|| cx.now().saturating_add_micros(timeout_us.unsigned_abs()));

        let ticket = {
            let mut cs = self.domain.lock();
            if let Err(violation) = mutex::release(&mut cs, mutex.id(), caller) {
                fatal::violation(cs, &self.domain, caller, violation);
            }
            let ticket = cs.next_ticket();
            let Some(state) = cs.sync.condvars.get_mut(self.id.arena_index()) else {
                let violation = ContractViolation::StalePrimitive {
                    primitive: format!("condvar {}", self.id),
                };
                fatal::violation(cs, &self.domain, caller, violation);
            };
            state.waiters.push_back(Waiter {
                ticket,
                fibril: caller,
            });
            ticket
        };
        trace!(condvar = %self.id, mutex = %mutex.id(), fibril = %caller, ?deadline, "condvar wait");

        let mut linked = LinkedWait {
            condvar: self,
            fibril: caller,
            ticket,
            linked: true,
        };
        Park::new(cx, ticket, deadline).await;
        let timed_out = linked.finish();

        mutex.lock(cx).await;
        if timed_out {
            trace!(condvar = %self.id, fibril = %caller, "condvar wait timed out");
            Err(TimedOut::new(cx.now()))
        } else {
            Ok(())
        }
    }

    /// Wakes the oldest waiter, if any.
    pub fn signal(&self) {
        let mut cs = self.domain.lock();
        let next = cs
            .sync
            .condvars
            .get_mut(self.id.arena_index())
            .and_then(|state| state.waiters.pop_front());
        if let Some(waiter) = next {
            trace!(condvar = %self.id, to = %waiter.fibril, "condvar signal");
            cs.notify(waiter);
        }
    }

    /// Wakes every fibril waiting right now.
    pub fn broadcast(&self) {
        let mut cs = self.domain.lock();
        let woken: SmallVec<[Waiter; 4]> = cs
            .sync
            .condvars
            .get_mut(self.id.arena_index())
            .map(|state| state.waiters.drain().collect())
            .unwrap_or_default();
        trace!(condvar = %self.id, woken = woken.len(), "condvar broadcast");
        for waiter in woken {
            cs.notify(waiter);
        }
    }

    /// Number of fibrils currently waiting.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.domain
            .lock()
            .sync
            .condvars
            .get(self.id.arena_index())
            .map_or(0, |state| state.waiters.len())
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        let mut cs = self.domain.lock();
        if let Some(state) = cs.sync.condvars.remove(self.id.arena_index()) {
            if !state.waiters.is_empty() {
                warn!(
                    condvar = %self.id,
                    waiters = state.waiters.len(),
                    "condvar dropped with waiting fibrils"
                );
            }
        }
    }
}

/// A wait record linked on a condvar queue for the duration of one park.
///
/// If the wait is abandoned mid-park the record is unlinked on drop; the
/// mutex is not re-acquired in that case.
struct LinkedWait<'a> {
    condvar: &'a Condvar,
    fibril: FibrilId,
    ticket: Ticket,
    linked: bool,
}

impl LinkedWait<'_> {
    /// Unlinks the record. Returns true if it was still queued, meaning no
    /// signal reached it.
    fn finish(&mut self) -> bool {
        self.linked = false;
        let mut cs = self.condvar.domain.lock();
        cs.take_notification(self.fibril, self.ticket);
        cs.sync
            .condvars
            .get_mut(self.condvar.id.arena_index())
            .is_some_and(|state| state.waiters.remove(self.ticket))
    }
}

impl Drop for LinkedWait<'_> {
    fn drop(&mut self) {
        if self.linked {
            let _ = self.finish();
        }
    }
}
