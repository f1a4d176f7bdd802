//! Error types.
//!
//! Outcomes fall into three groups that are never conflated:
//!
//! - **Ordinary outcomes** such as [`TimedOut`]: regular return values that
//!   callers branch on. Nothing in this crate retries automatically.
//! - **Runtime errors** ([`RunError`], [`ConfigError`]): the run loop could
//!   not drive the requested work to completion, or a configuration value
//!   did not parse.
//! - **Contract violations** ([`ContractViolation`]): programming bugs such as
//!   unlocking a mutex the caller does not own. These are never returned;
//!   they are reported and the process aborts (see [`crate::sync::fatal`]).

use crate::sync::OwnerRef;
use crate::types::{FibrilId, Time};
use core::fmt;

/// A condition-variable wait ended because its deadline passed (or because
/// a negative timeout was requested) rather than because it was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    at: Time,
}

impl TimedOut {
    /// Creates a timeout observed at `at`.
    #[must_use]
    pub const fn new(at: Time) -> Self {
        Self { at }
    }

    /// Domain time at which the wait gave up.
    #[must_use]
    pub const fn at(&self) -> Time {
        self.at
    }
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait timed out at {:?}", self.at)
    }
}

impl std::error::Error for TimedOut {}

/// Errors returned by the fibril run loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Every remaining fibril is blocked and no timer is pending, so the
    /// root fibril can never complete.
    #[error("runtime stalled with {blocked} blocked fibril(s) before the root fibril completed")]
    Stalled {
        /// Fibrils still alive when the run loop gave up.
        blocked: usize,
    },
    /// The configured step limit was reached.
    #[error("step limit of {limit} polls exceeded")]
    StepLimitExceeded {
        /// The configured limit.
        limit: u64,
    },
}

/// Errors parsing runtime configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The clock name is not one of `virtual`, `lab`, `monotonic`, `wall`.
    #[error("unknown clock mode {0:?}")]
    UnknownClockMode(String),
}

/// A broken usage contract. Reporting one aborts the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// `unlock` called by a fibril that does not own the primitive.
    #[error("fibril {caller} unlocked {primitive} owned by {owner:?}")]
    UnlockByNonOwner {
        /// The primitive being released.
        primitive: OwnerRef,
        /// The calling fibril.
        caller: FibrilId,
        /// The recorded owner at the time of the call.
        owner: Option<FibrilId>,
    },
    /// `read_unlock` with no readers holding the lock.
    #[error("fibril {caller} read-unlocked {primitive} which has no readers")]
    ReadUnlockWithoutReaders {
        /// The reader-writer lock.
        primitive: OwnerRef,
        /// The calling fibril.
        caller: FibrilId,
    },
    /// `write_unlock` while the lock is not write-held by the caller.
    #[error("fibril {caller} write-unlocked {primitive} ({writers} writer(s), owner {owner:?})")]
    WriteUnlockNotHeld {
        /// The reader-writer lock.
        primitive: OwnerRef,
        /// The calling fibril.
        caller: FibrilId,
        /// Writers recorded on the lock.
        writers: u32,
        /// The recorded owner.
        owner: Option<FibrilId>,
    },
    /// A condition-variable wait or timer operation requiring the caller to
    /// hold a mutex was called without it.
    #[error("fibril {caller} does not hold {primitive} in {operation}")]
    LockNotHeld {
        /// The mutex that should be held.
        primitive: OwnerRef,
        /// The calling fibril.
        caller: FibrilId,
        /// The operation that required the lock.
        operation: &'static str,
    },
    /// A handle whose record has already been removed from its domain.
    #[error("{primitive} used after its record was removed")]
    StalePrimitive {
        /// Description of the stale handle.
        primitive: String,
    },
    /// Two primitives from different domains were combined.
    #[error("{operation} combines primitives from different domains")]
    ForeignDomain {
        /// The offending operation.
        operation: &'static str,
    },
    /// A wait queue disagreed with its primitive's counters.
    #[error("wait queue of {primitive} is inconsistent with its counters")]
    CorruptQueue {
        /// The primitive whose bookkeeping broke.
        primitive: String,
    },
    /// `Timer::set` while the timer is armed or being torn down.
    #[error("timer set in state {state:?}; only NotSet or Fired may be armed")]
    TimerSetWhileArmed {
        /// State at the time of the call.
        state: crate::sync::TimerState,
    },
    /// `Timer::destroy` while the timer is armed or being torn down.
    #[error("timer destroyed in state {state:?}; clear it first")]
    TimerDestroyWhileArmed {
        /// State at the time of the call.
        state: crate::sync::TimerState,
    },
    /// A timer's own handler tried to clear or destroy it, which would wait
    /// for itself forever.
    #[error("fibril {caller} tried to {operation} a timer from inside its own handler")]
    TimerSelfWait {
        /// The handler fibril.
        caller: FibrilId,
        /// `clear` or `destroy`.
        operation: &'static str,
    },
    /// The companion fibril found a state it can never be in while running.
    #[error("timer companion observed impossible state {state:?}")]
    TimerCompanionState {
        /// The impossible state.
        state: crate::sync::TimerState,
    },
}
