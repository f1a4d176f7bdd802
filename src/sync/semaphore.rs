//! Counting semaphore with FIFO hand-off.
//!
//! The count doubles as queue length: `count >= 0` is the number of free
//! tokens, `count < 0` means `-count` fibrils are queued. A token produced
//! while fibrils are queued goes straight to the oldest of them.
//!
//! Semaphores carry no owner, so they never take part in deadlock detection.
//!
//! # Example
//!
//! ```
//! use fibril_sync::runtime::{Runtime, RuntimeConfig};
//! use fibril_sync::sync::Semaphore;
//!
//! let mut runtime = Runtime::new(RuntimeConfig::new());
//! runtime
//!     .block_on("main", |cx| async move {
//!         let sem = Semaphore::new(cx.domain(), 1);
//!         sem.down(&cx).await;
//!         assert_eq!(sem.count(), 0);
//!         sem.up();
//!     })
//!     .unwrap();
//! ```

use super::fatal;
use super::wait::{Ticket, WaitQueue, Waiter};
use crate::cx::Cx;
use crate::error::ContractViolation;
use crate::runtime::Domain;
use crate::runtime::domain::DomainState;
use crate::runtime::park::{ParkDeadline, poll_park};
use crate::types::SemaphoreId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct SemaphoreState {
    pub(crate) count: i64,
    pub(crate) waiters: WaitQueue,
}

fn up_locked(state: &mut DomainState, id: SemaphoreId) {
    let Some(sem) = state.sync.semaphores.get_mut(id.arena_index()) else {
        return;
    };
    sem.count += 1;
    if sem.count <= 0 {
        match sem.waiters.pop_front() {
            Some(next) => {
                trace!(semaphore = %id, to = %next.fibril, "semaphore token handed off");
                state.notify(next);
            }
            None => warn!(semaphore = %id, count = sem.count, "semaphore count without waiters"),
        }
    }
}

/// A counting semaphore. Share it between fibrils with an [`Arc`].
#[derive(Debug)]
pub struct Semaphore {
    domain: Arc<Domain>,
    id: SemaphoreId,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` tokens.
    #[must_use]
    pub fn new(domain: &Arc<Domain>, permits: u32) -> Self {
        let id = SemaphoreId::from_arena(domain.lock().sync.semaphores.insert(SemaphoreState {
            count: i64::from(permits),
            waiters: WaitQueue::new(),
        }));
        trace!(semaphore = %id, permits, "semaphore created");
        Self {
            domain: Arc::clone(domain),
            id,
        }
    }

    /// Handle of this semaphore's record.
    #[must_use]
    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Produces one token, satisfying exactly one queued `down` if any.
    /// Never blocks.
    pub fn up(&self) {
        let mut cs = self.domain.lock();
        up_locked(&mut cs, self.id);
    }

    /// Consumes one token, waiting in FIFO order if none is free.
    pub fn down<'a>(&'a self, cx: &'a Cx) -> DownFuture<'a> {
        DownFuture {
            semaphore: self,
            cx,
            phase: DownPhase::Init,
        }
    }

    /// Free tokens if non-negative, minus the number of queued fibrils
    /// otherwise.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.domain
            .lock()
            .sync
            .semaphores
            .get(self.id.arena_index())
            .map_or(0, |sem| sem.count)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let mut cs = self.domain.lock();
        if let Some(state) = cs.sync.semaphores.remove(self.id.arena_index()) {
            if !state.waiters.is_empty() {
                warn!(
                    semaphore = %self.id,
                    waiters = state.waiters.len(),
                    "semaphore dropped with queued fibrils"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownPhase {
    Init,
    Waiting(Ticket),
    Done,
}

/// Future returned by [`Semaphore::down`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct DownFuture<'a> {
    semaphore: &'a Semaphore,
    cx: &'a Cx,
    phase: DownPhase,
}

impl Future for DownFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        let semaphore = self.semaphore;
        let caller = self.cx.fibril_id();
        let domain = &semaphore.domain;

        match self.phase {
            DownPhase::Init => {
                let mut cs = domain.lock();
                let Some(sem) = cs.sync.semaphores.get_mut(semaphore.id.arena_index()) else {
                    let violation = ContractViolation::StalePrimitive {
                        primitive: format!("semaphore {}", semaphore.id),
                    };
                    return fatal::violation(cs, domain, caller, violation);
                };
                sem.count -= 1;
                if sem.count >= 0 {
                    drop(cs);
                    self.phase = DownPhase::Done;
                    return Poll::Ready(());
                }
                let ticket = cs.next_ticket();
                if let Some(sem) = cs.sync.semaphores.get_mut(semaphore.id.arena_index()) {
                    sem.waiters.push_back(Waiter {
                        ticket,
                        fibril: caller,
                    });
                }
                cs.register_waker(caller, task.waker());
                drop(cs);
                trace!(semaphore = %semaphore.id, fibril = %caller, "semaphore empty, queued");
                self.phase = DownPhase::Waiting(ticket);
                Poll::Pending
            }
            DownPhase::Waiting(ticket) => {
                let now = domain.now();
                let mut cs = domain.lock();
                let mut deadline = ParkDeadline::never();
                match poll_park(&mut cs, now, caller, ticket, &mut deadline, task) {
                    Poll::Ready(_) => {
                        drop(cs);
                        self.phase = DownPhase::Done;
                        Poll::Ready(())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            DownPhase::Done => Poll::Ready(()),
        }
    }
}

impl Drop for DownFuture<'_> {
    fn drop(&mut self) {
        let DownPhase::Waiting(ticket) = self.phase else {
            return;
        };
        let caller = self.cx.fibril_id();
        let id = self.semaphore.id;
        let mut cs = self.semaphore.domain.lock();
        if cs.take_notification(caller, ticket) {
            // A token was already handed to us; produce it again.
            up_locked(&mut cs, id);
            return;
        }
        if let Some(sem) = cs.sync.semaphores.get_mut(id.arena_index()) {
            if sem.waiters.remove(ticket) {
                sem.count += 1;
            }
        }
        trace!(semaphore = %id, fibril = %caller, "pending down abandoned");
    }
}
