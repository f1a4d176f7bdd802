//! Park/notify: the suspension half of every blocking operation.
//!
//! A blocked operation links a wait record (a [`Ticket`]) into some queue
//! under the global lock, then parks on that ticket. Whoever dequeues the
//! record calls [`DomainState::notify`]. A park may additionally carry a
//! deadline, in which case it also resolves once domain time reaches it.
//! The deadline stays armed only while the park is still waiting.

use super::domain::DomainState;
use crate::cx::Cx;
use crate::sync::wait::Ticket;
use crate::types::{FibrilId, Time};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// How a park ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkOutcome {
    /// The ticket was notified.
    Notified,
    /// The deadline passed first.
    TimedOut,
}

/// Deadline bookkeeping for one park.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParkDeadline {
    deadline: Option<Time>,
    armed: bool,
}

impl ParkDeadline {
    pub(crate) const fn new(deadline: Option<Time>) -> Self {
        Self {
            deadline,
            armed: false,
        }
    }

    pub(crate) const fn never() -> Self {
        Self::new(None)
    }

    /// Removes the armed deadline of `ticket`, if any.
    pub(crate) fn disarm(&mut self, state: &mut DomainState, ticket: Ticket) {
        if self.armed {
            state.deadlines.disarm(ticket);
            self.armed = false;
        }
    }
}

/// Polls one park step inside an already-held critical section.
///
/// A delivered notification always wins over an expired deadline.
pub(crate) fn poll_park(
    state: &mut DomainState,
    now: Time,
    fibril: FibrilId,
    ticket: Ticket,
    deadline: &mut ParkDeadline,
    task: &Context<'_>,
) -> Poll<ParkOutcome> {
    if state.take_notification(fibril, ticket) {
        deadline.disarm(state, ticket);
        return Poll::Ready(ParkOutcome::Notified);
    }
    if let Some(at) = deadline.deadline {
        if now >= at {
            deadline.disarm(state, ticket);
            return Poll::Ready(ParkOutcome::TimedOut);
        }
        if !deadline.armed {
            state.deadlines.arm(ticket, fibril, at);
            deadline.armed = true;
        }
    }
    state.register_waker(fibril, task.waker());
    Poll::Pending
}

/// Future parking the current fibril on `ticket`.
#[derive(Debug)]
pub(crate) struct Park<'a> {
    cx: &'a Cx,
    ticket: Ticket,
    deadline: ParkDeadline,
}

impl<'a> Park<'a> {
    pub(crate) const fn new(cx: &'a Cx, ticket: Ticket, deadline: Option<Time>) -> Self {
        Self {
            cx,
            ticket,
            deadline: ParkDeadline::new(deadline),
        }
    }
}

impl Future for Park<'_> {
    type Output = ParkOutcome;

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<ParkOutcome> {
        let this = &mut *self;
        let cx = this.cx;
        let domain = cx.domain();
        let now = domain.now();
        let mut cs = domain.lock();
        poll_park(
            &mut cs,
            now,
            cx.fibril_id(),
            this.ticket,
            &mut this.deadline,
            task,
        )
    }
}

impl Drop for Park<'_> {
    fn drop(&mut self) {
        if self.deadline.armed {
            let cx = self.cx;
            let mut cs = cx.domain().lock();
            self.deadline.disarm(&mut cs, self.ticket);
        }
    }
}
