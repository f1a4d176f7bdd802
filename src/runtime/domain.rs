//! The cooperative scheduling domain.
//!
//! A [`Domain`] is the context object every primitive and every [`Cx`] holds.
//! It owns:
//!
//! - the **global lock**: one `parking_lot::Mutex` around [`DomainState`],
//!   which serializes all primitive metadata in the domain;
//! - the fibril table (`waits_for`, `is_writer`, waker, pending notification);
//! - the primitive tables the ownership-chain detector walks;
//! - the armed park deadlines, the clock, and the inbox of freshly spawned fibrils.
//!
//! Critical sections are entered with [`Domain::lock`]. Wakers queued by
//! `notify` inside a critical section fire only after the lock is released.

use super::config::ClockMode;
use super::deadline::Deadlines;
use super::waker::{WakeSource, WakerState};
use crate::cx::Cx;
use crate::sync::table::SyncTables;
use crate::sync::wait::{Ticket, Waiter};
use crate::sync::OwnerRef;
use crate::types::{FibrilId, Time};
use crate::util::Arena;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::Waker;
use std::time::Instant;
use tracing::{debug, warn};

/// A boxed fibril body.
pub(crate) type FibrilFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fibril registered by [`Domain::spawn`] but not yet admitted by the run loop.
pub(crate) struct SpawnedFibril {
    pub(crate) id: FibrilId,
    pub(crate) future: FibrilFuture,
}

/// Per-fibril bookkeeping owned by the domain.
#[derive(Debug)]
pub(crate) struct FibrilRecord {
    pub(crate) name: String,
    /// Ownership primitive this fibril is queued on, if any.
    pub(crate) waits_for: Option<OwnerRef>,
    /// Role while queued on a reader-writer lock.
    pub(crate) is_writer: bool,
    waker: Option<Waker>,
    notified: Option<Ticket>,
}

impl FibrilRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            waits_for: None,
            is_writer: false,
            waker: None,
            notified: None,
        }
    }
}

/// Everything guarded by the global lock.
#[derive(Debug)]
pub(crate) struct DomainState {
    pub(crate) fibrils: Arena<FibrilRecord>,
    pub(crate) sync: SyncTables,
    pub(crate) deadlines: Deadlines,
    next_ticket: u64,
    pending_wakes: SmallVec<[Waker; 4]>,
}

impl DomainState {
    fn new() -> Self {
        Self {
            fibrils: Arena::new(),
            sync: SyncTables::default(),
            deadlines: Deadlines::new(),
            next_ticket: 0,
            pending_wakes: SmallVec::new(),
        }
    }

    /// Allocates a fresh wakeup event.
    pub(crate) fn next_ticket(&mut self) -> Ticket {
        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket = self.next_ticket.wrapping_add(1);
        ticket
    }

    pub(crate) fn fibril(&self, id: FibrilId) -> Option<&FibrilRecord> {
        self.fibrils.get(id.arena_index())
    }

    pub(crate) fn fibril_name(&self, id: FibrilId) -> String {
        self.fibril(id)
            .map_or_else(|| String::from("<exited>"), |rec| rec.name.clone())
    }

    pub(crate) fn set_waits_for(&mut self, id: FibrilId, target: Option<OwnerRef>) {
        if let Some(rec) = self.fibrils.get_mut(id.arena_index()) {
            rec.waits_for = target;
        }
    }

    pub(crate) fn set_is_writer(&mut self, id: FibrilId, is_writer: bool) {
        if let Some(rec) = self.fibrils.get_mut(id.arena_index()) {
            rec.is_writer = is_writer;
        }
    }

    /// Current owner of an ownership primitive.
    pub(crate) fn owner_of(&self, target: OwnerRef) -> Option<FibrilId> {
        self.sync.owner_info(target).and_then(|info| info.owned_by)
    }

    /// Remembers the waker to fire when `id` is notified.
    pub(crate) fn register_waker(&mut self, id: FibrilId, waker: &Waker) {
        let Some(rec) = self.fibrils.get_mut(id.arena_index()) else {
            return;
        };
        match &mut rec.waker {
            Some(existing) if existing.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }
    }

    /// Delivers the wakeup event of `waiter`. The waiter's fibril becomes
    /// runnable once the current critical section ends.
    pub(crate) fn notify(&mut self, waiter: Waiter) {
        self.deadlines.disarm(waiter.ticket);
        let Some(rec) = self.fibrils.get_mut(waiter.fibril.arena_index()) else {
            warn!(fibril = %waiter.fibril, "notify for exited fibril dropped");
            return;
        };
        rec.notified = Some(waiter.ticket);
        if let Some(waker) = rec.waker.take() {
            self.pending_wakes.push(waker);
        }
    }

    /// Consumes a delivered notification for `ticket`.
    pub(crate) fn take_notification(&mut self, id: FibrilId, ticket: Ticket) -> bool {
        let Some(rec) = self.fibrils.get_mut(id.arena_index()) else {
            return false;
        };
        if rec.notified == Some(ticket) {
            rec.notified = None;
            true
        } else {
            false
        }
    }
}

/// A held global lock. Wakers queued while it is held fire on release.
pub(crate) struct CriticalSection<'a> {
    guard: Option<MutexGuard<'a, DomainState>>,
}

impl CriticalSection<'_> {
    /// Leaves the critical section early; used before fatal reporting so the
    /// printer never runs under the global lock.
    pub(crate) fn release(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            let wakes = std::mem::take(&mut guard.pending_wakes);
            drop(guard);
            for waker in wakes {
                waker.wake();
            }
        }
    }
}

impl Deref for CriticalSection<'_> {
    type Target = DomainState;

    fn deref(&self) -> &DomainState {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("critical section used after release"),
        }
    }
}

impl DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut DomainState {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("critical section used after release"),
        }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
enum Clock {
    Virtual { now: AtomicU64 },
    Monotonic { origin: Instant },
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Virtual => Self::Virtual {
                now: AtomicU64::new(0),
            },
            ClockMode::Monotonic => Self::Monotonic {
                origin: Instant::now(),
            },
        }
    }

    fn now(&self) -> Time {
        match self {
            Self::Virtual { now } => Time::from_nanos(now.load(Ordering::Acquire)),
            Self::Monotonic { origin } => {
                let nanos = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
                Time::from_nanos(nanos)
            }
        }
    }

    fn mode(&self) -> ClockMode {
        match self {
            Self::Virtual { .. } => ClockMode::Virtual,
            Self::Monotonic { .. } => ClockMode::Monotonic,
        }
    }
}

/// One cooperative scheduling domain.
///
/// Obtained from [`Runtime::domain`](super::Runtime::domain) or
/// [`Cx::domain`]; primitives are created against it and share its global
/// lock.
pub struct Domain {
    state: Mutex<DomainState>,
    wakers: Arc<WakerState>,
    spawned: Mutex<Vec<SpawnedFibril>>,
    clock: Clock,
    reporting_fatal: AtomicBool,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("clock", &self.clock.mode())
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}

impl Domain {
    pub(crate) fn new(clock: ClockMode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DomainState::new()),
            wakers: Arc::new(WakerState::new()),
            spawned: Mutex::new(Vec::new()),
            clock: Clock::new(clock),
            reporting_fatal: AtomicBool::new(false),
        })
    }

    /// Enters the critical section.
    pub(crate) fn lock(&self) -> CriticalSection<'_> {
        CriticalSection {
            guard: Some(self.state.lock()),
        }
    }

    /// Current domain time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Which clock drives this domain.
    #[must_use]
    pub fn clock_mode(&self) -> ClockMode {
        self.clock.mode()
    }

    /// Diagnostic name of a live fibril.
    #[must_use]
    pub fn fibril_name(&self, id: FibrilId) -> Option<String> {
        self.lock().fibril(id).map(|rec| rec.name.clone())
    }

    /// Creates a fibril running `entry` and marks it ready.
    ///
    /// The fibril starts on the run loop's next iteration; spawning from
    /// inside a fibril never runs the child synchronously.
    pub fn spawn<F, Fut>(self: &Arc<Self>, name: impl Into<String>, entry: F) -> FibrilId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = {
            let mut cs = self.lock();
            FibrilId::from_arena(cs.fibrils.insert(FibrilRecord::new(name.clone())))
        };
        let future: FibrilFuture = Box::pin(entry(Cx::new(id, Arc::clone(self))));
        self.spawned.lock().push(SpawnedFibril { id, future });
        debug!(fibril = %id, name = %name, "fibril spawned");
        self.wakers.wake(id, WakeSource::Spawn);
        id
    }

    pub(crate) fn wakers(&self) -> &Arc<WakerState> {
        &self.wakers
    }

    pub(crate) fn take_spawned(&self) -> Vec<SpawnedFibril> {
        std::mem::take(&mut *self.spawned.lock())
    }

    /// Removes the record of a finished fibril.
    pub(crate) fn retire(&self, id: FibrilId) {
        let mut cs = self.lock();
        let still_owned = cs.sync.owned_by(id);
        if let Some(rec) = cs.fibrils.remove(id.arena_index()) {
            if still_owned.is_empty() {
                debug!(fibril = %id, name = %rec.name, "fibril finished");
            } else {
                warn!(
                    fibril = %id,
                    name = %rec.name,
                    owned = ?still_owned,
                    "fibril finished while owning primitives"
                );
            }
        }
    }

    /// Moves the virtual clock forward. No-op under the monotonic clock.
    pub(crate) fn advance_to(&self, deadline: Time) {
        if let Clock::Virtual { now } = &self.clock {
            now.fetch_max(deadline.as_nanos(), Ordering::AcqRel);
        }
    }

    /// Claims the fatal printer. Returns false if a report is already being
    /// printed in this domain.
    pub(crate) fn begin_fatal_report(&self) -> bool {
        !self.reporting_fatal.swap(true, Ordering::AcqRel)
    }
}
