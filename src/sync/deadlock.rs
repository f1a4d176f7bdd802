//! Ownership-chain deadlock detection.
//!
//! Mutexes and reader-writer locks record their (nominal) owner; every
//! fibril records the ownership primitive it is queued on. Before a fibril
//! queues on primitive `P`, the chain
//!
//! ```text
//! P.owned_by -> that fibril's waits_for -> its owned_by -> ...
//! ```
//!
//! is walked. Reaching the fibril about to block means it would wait for
//! itself forever; the process aborts with the full chain printed.
//!
//! Semaphores and condition variables carry no owner and never appear in a
//! chain.

use crate::runtime::Domain;
use crate::runtime::domain::{CriticalSection, DomainState};
use crate::sync::fatal;
use crate::types::{FibrilId, MutexId, RwLockId};
use core::fmt;
use serde_json::json;

/// A primitive that carries ownership information.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerRef {
    /// A mutex.
    Mutex(MutexId),
    /// A reader-writer lock (owner is the nominal owner).
    RwLock(RwLockId),
}

impl fmt::Debug for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutex(id) => write!(f, "mutex {id}"),
            Self::RwLock(id) => write!(f, "rwlock {id}"),
        }
    }
}

/// Ownership record embedded in mutex and rwlock state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OwnerInfo {
    pub(crate) owned_by: Option<FibrilId>,
}

/// One hop of an ownership chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    /// The primitive at this hop.
    pub primitive: OwnerRef,
    /// Its owner.
    pub owner: FibrilId,
    /// Diagnostic name of the owner.
    pub owner_name: String,
    /// What the owner itself waits for; `None` on the closing hop.
    pub owner_waits_for: Option<OwnerRef>,
}

/// A detected ownership cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockReport {
    /// The fibril that was about to block.
    pub fibril: FibrilId,
    /// Its diagnostic name.
    pub fibril_name: String,
    /// The primitive it was about to block on.
    pub waits_for: OwnerRef,
    /// Hops from `waits_for` back to `fibril`.
    pub chain: Vec<ChainLink>,
}

impl DeadlockReport {
    /// Structured form for the `tracing` error event.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let chain: Vec<_> = self
            .chain
            .iter()
            .map(|link| {
                json!({
                    "primitive": link.primitive.to_string(),
                    "owner": link.owner.to_string(),
                    "owner_name": link.owner_name,
                    "owner_waits_for": link.owner_waits_for.map(|p| p.to_string()),
                })
            })
            .collect();
        json!({
            "fibril": self.fibril.to_string(),
            "fibril_name": self.fibril_name,
            "waits_for": self.waits_for.to_string(),
            "chain": chain,
        })
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Deadlock detected.")?;
        write!(
            f,
            "Fibril {} ({}) waits for primitive {}.",
            self.fibril, self.fibril_name, self.waits_for
        )?;
        for link in &self.chain {
            write!(
                f,
                "\nPrimitive {} is owned by fibril {} ({}).",
                link.primitive, link.owner, link.owner_name
            )?;
            if let Some(next) = link.owner_waits_for {
                write!(
                    f,
                    "\nFibril {} ({}) waits for primitive {next}.",
                    link.owner, link.owner_name
                )?;
            }
        }
        Ok(())
    }
}

/// Walks the ownership chain starting at `target` and returns the cycle if
/// it leads back to `fibril`.
///
/// The walk stops at an unowned primitive, at an owner that is not waiting,
/// or at an owner that has exited. It never visits more hops than there are
/// live fibrils.
pub(crate) fn find_cycle(
    state: &DomainState,
    target: OwnerRef,
    fibril: FibrilId,
) -> Option<DeadlockReport> {
    let bound = state.fibrils.len() + 1;
    let mut chain = Vec::new();
    let mut current = Some(target);

    while let Some(primitive) = current {
        let owner = state.owner_of(primitive)?;
        let closes = owner == fibril;
        let owner_waits_for = if closes {
            None
        } else {
            state.fibril(owner).and_then(|rec| rec.waits_for)
        };
        chain.push(ChainLink {
            primitive,
            owner,
            owner_name: state.fibril_name(owner),
            owner_waits_for,
        });
        if closes {
            return Some(DeadlockReport {
                fibril,
                fibril_name: state.fibril_name(fibril),
                waits_for: target,
                chain,
            });
        }
        if chain.len() >= bound {
            return None;
        }
        current = owner_waits_for;
    }
    None
}

/// Aborts the process if `fibril` blocking on `target` closes a cycle.
pub(crate) fn check_for_deadlock(
    cs: &mut CriticalSection<'_>,
    domain: &Domain,
    target: OwnerRef,
    fibril: FibrilId,
) {
    if let Some(report) = find_cycle(cs, target, fibril) {
        cs.release();
        fatal::deadlock(domain, &report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ClockMode, Domain};
    use crate::sync::mutex::MutexState;
    use crate::test_utils::init_test_logging;
    use std::sync::Arc;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    struct Fixture {
        domain: Arc<Domain>,
        fibrils: Vec<FibrilId>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let domain = Domain::new(ClockMode::Virtual);
        let fibrils = names
            .iter()
            .map(|name| domain.spawn(*name, |_cx| async {}))
            .collect();
        Fixture { domain, fibrils }
    }

    fn owned_mutex(state: &mut DomainState, owner: Option<FibrilId>) -> OwnerRef {
        let mut record = MutexState::new();
        record.owner.owned_by = owner;
        OwnerRef::Mutex(MutexId::from_arena(state.sync.mutexes.insert(record)))
    }

    #[test]
    fn two_fibril_cycle_is_found_with_full_chain() {
        init_test("two_fibril_cycle_is_found_with_full_chain");
        let fx = fixture(&["A", "B"]);
        let (a, b) = (fx.fibrils[0], fx.fibrils[1]);
        let mut cs = fx.domain.lock();
        let m1 = owned_mutex(&mut cs, Some(a));
        let m2 = owned_mutex(&mut cs, Some(b));
        // B waits for m1 (owned by A); A now tries m2 (owned by B).
        cs.set_waits_for(b, Some(m1));

        let report = find_cycle(&cs, m2, a).expect("cycle");
        crate::assert_with_log!(
            report.chain.len() == 2,
            "two hops",
            2,
            report.chain.len()
        );
        assert_eq!(report.chain[0].owner, b);
        assert_eq!(report.chain[0].owner_waits_for, Some(m1));
        assert_eq!(report.chain[1].owner, a);
        assert_eq!(report.chain[1].owner_waits_for, None);

        let text = report.to_string();
        crate::test_section!("rendering");
        assert!(text.starts_with("Deadlock detected.\n"), "{text}");
        assert!(text.contains(&format!("Fibril {a} (A) waits for primitive {m2}.")), "{text}");
        assert!(text.contains(&format!("Primitive {m2} is owned by fibril {b} (B).")), "{text}");
        assert!(text.contains(&format!("Fibril {b} (B) waits for primitive {m1}.")), "{text}");
        assert!(text.contains(&format!("Primitive {m1} is owned by fibril {a} (A).")), "{text}");
        assert_eq!(report.to_json()["chain"].as_array().map(Vec::len), Some(2));
        crate::test_complete!("two_fibril_cycle_is_found_with_full_chain");
    }

    #[test]
    fn self_ownership_is_a_one_hop_cycle() {
        init_test("self_ownership_is_a_one_hop_cycle");
        let fx = fixture(&["solo"]);
        let solo = fx.fibrils[0];
        let mut cs = fx.domain.lock();
        let m = owned_mutex(&mut cs, Some(solo));
        let report = find_cycle(&cs, m, solo).expect("recursive lock is a cycle");
        assert_eq!(report.chain.len(), 1);
        crate::test_complete!("self_ownership_is_a_one_hop_cycle");
    }

    #[test]
    fn chain_without_cycle_ends_cleanly() {
        init_test("chain_without_cycle_ends_cleanly");
        let fx = fixture(&["A", "B", "C"]);
        let (a, b, c) = (fx.fibrils[0], fx.fibrils[1], fx.fibrils[2]);
        let mut cs = fx.domain.lock();
        let m1 = owned_mutex(&mut cs, Some(b));
        let m2 = owned_mutex(&mut cs, Some(c));
        let unowned = owned_mutex(&mut cs, None);

        crate::test_section!("owner not waiting");
        cs.set_waits_for(b, Some(m2));
        assert!(find_cycle(&cs, m1, a).is_none());

        crate::test_section!("chain ends at an unowned primitive");
        cs.set_waits_for(c, Some(unowned));
        assert!(find_cycle(&cs, m1, a).is_none());

        crate::test_section!("chain ends at an exited owner");
        cs.fibrils.remove(c.arena_index());
        assert!(find_cycle(&cs, m1, a).is_none());
        crate::test_complete!("chain_without_cycle_ends_cleanly");
    }
}
