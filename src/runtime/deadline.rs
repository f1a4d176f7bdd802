//! Armed park deadlines.
//!
//! A time-bounded park arms its ticket here. The entry is disarmed as soon as
//! the park stops waiting: a notification is delivered, the park observes its
//! own timeout, or the parking future is dropped. Only armed entries ever
//! wake a fibril or hold the idle run loop back.

use crate::sync::wait::Ticket;
use crate::types::{FibrilId, Time};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy)]
struct Armed {
    fibril: FibrilId,
    deadline: Time,
}

/// Deadlines of the parks that are still waiting, ordered by time.
#[derive(Debug, Default)]
pub(crate) struct Deadlines {
    by_time: BTreeSet<(Time, Ticket)>,
    armed: HashMap<Ticket, Armed>,
}

impl Deadlines {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }

    /// Wakes `fibril` at `deadline` unless `ticket` is disarmed first.
    pub(crate) fn arm(&mut self, ticket: Ticket, fibril: FibrilId, deadline: Time) {
        if let Some(previous) = self.armed.insert(ticket, Armed { fibril, deadline }) {
            self.by_time.remove(&(previous.deadline, ticket));
        }
        self.by_time.insert((deadline, ticket));
    }

    /// Forgets the deadline of `ticket`. Returns whether one was armed.
    pub(crate) fn disarm(&mut self, ticket: Ticket) -> bool {
        match self.armed.remove(&ticket) {
            Some(entry) => {
                self.by_time.remove(&(entry.deadline, ticket));
                true
            }
            None => false,
        }
    }

    /// Earliest armed deadline.
    pub(crate) fn next_deadline(&self) -> Option<Time> {
        self.by_time.first().map(|&(deadline, _)| deadline)
    }

    /// Disarms every deadline `<= now` and returns the fibrils to wake,
    /// earliest first. Equal deadlines come out in ticket order.
    pub(crate) fn pop_expired(&mut self, now: Time) -> Vec<FibrilId> {
        let mut due = Vec::new();
        while let Some(&(deadline, ticket)) = self.by_time.first() {
            if deadline > now {
                break;
            }
            self.by_time.pop_first();
            if let Some(entry) = self.armed.remove(&ticket) {
                due.push(entry.fibril);
            }
        }
        due
    }
}
