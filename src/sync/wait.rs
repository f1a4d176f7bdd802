//! Wait records and FIFO wait queues.
//!
//! A blocked fibril is represented in a primitive's queue by a [`Waiter`]:
//! its fibril ID plus the [`Ticket`] it is parked on. The record is owned by
//! the blocked operation's future; the queue only holds its identity. A
//! record leaves the queue either because a releaser popped and notified it,
//! or because the waiter unlinked itself (timeout, future dropped).

use crate::types::FibrilId;
use std::collections::VecDeque;

/// Identity of one wakeup event, unique within a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Ticket(u64);

impl Ticket {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// One queued wait record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub(crate) ticket: Ticket,
    pub(crate) fibril: FibrilId,
}

/// FIFO queue of wait records.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    records: VecDeque<Waiter>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            records: VecDeque::with_capacity(4),
        }
    }

    pub(crate) fn push_back(&mut self, waiter: Waiter) {
        self.records.push_back(waiter);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.records.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&Waiter> {
        self.records.front()
    }

    /// Unlinks the record parked on `ticket`. Returns false if it was
    /// already dequeued.
    pub(crate) fn remove(&mut self, ticket: Ticket) -> bool {
        match self.records.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                self.records.remove(pos);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, ticket: Ticket) -> bool {
        self.records.iter().any(|w| w.ticket == ticket)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Takes every record queued right now, oldest first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Waiter> + '_ {
        self.records.drain(..)
    }
}
