//! Deferred-callback timer.
//!
//! A [`Timer`] runs a callback once, a given delay after it was armed. It is
//! built entirely from the other primitives: a companion fibril waits on a
//! [`Condvar`] under the timer's [`Mutex`] with a timeout equal to the time
//! left until the armed deadline, and runs the callback when that wait times
//! out with the timer still armed.
//!
//! # State Machine
//!
//! ```text
//!            set                 delay elapses
//! NotSet ----------> Active -----------------------> Fired
//!   ^                  |                               |
//!   |      clear       |            set                |
//!   +------------------+<------------------------------+ (back to Active)
//!
//! NotSet | Fired --destroy--> Cleanup --companion exits--> Clean
//! ```
//!
//! The timer's data is only touched by fibrils holding the timer lock. The
//! lock is either private to the timer or supplied by the caller, so a timer
//! can be armed atomically with other state guarded by the same mutex.
//!
//! The callback runs in the companion fibril without the lock held. It may
//! re-arm the timer, but it must not clear or destroy it: that would wait
//! for the handler, which is itself.

use super::fatal;
use super::{Condvar, Mutex, OwnerRef};
use crate::cx::Cx;
use crate::error::ContractViolation;
use crate::runtime::Domain;
use crate::types::{FibrilId, Time};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Lifecycle of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not armed.
    NotSet,
    /// Armed; the callback runs once the delay elapses.
    Active,
    /// The callback was started.
    Fired,
    /// `destroy` asked the companion fibril to exit.
    Cleanup,
    /// The companion fibril has exited.
    Clean,
}

/// A boxed timer callback.
pub type TimerCallback = Box<dyn FnOnce(Cx) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct TimerData {
    state: TimerState,
    delay: Duration,
    deadline: Option<Time>,
    callback: Option<TimerCallback>,
    handler: Option<FibrilId>,
}

impl TimerData {
    fn reset(&mut self) {
        self.delay = Duration::ZERO;
        self.deadline = None;
        self.callback = None;
    }
}

struct TimerShared {
    lock: Arc<Mutex>,
    cv: Condvar,
    // Guarded by `lock`; the inner mutex only provides interior mutability.
    data: parking_lot::Mutex<TimerData>,
}

impl TimerShared {
    fn state(&self) -> TimerState {
        self.data.lock().state
    }

    fn handler(&self) -> Option<FibrilId> {
        self.data.lock().handler
    }

    /// Condvar timeout for the armed deadline; `-1` once it has passed.
    fn remaining_us(&self, now: Time) -> i64 {
        let Some(deadline) = self.data.lock().deadline else {
            return -1;
        };
        let remaining = deadline.duration_since(now);
        if remaining.is_zero() {
            return -1;
        }
        let micros = remaining.as_nanos().div_ceil(1_000);
        i64::try_from(micros).unwrap_or(i64::MAX)
    }

    fn deadline_reached(&self, now: Time) -> bool {
        self.data.lock().deadline.is_some_and(|deadline| now >= deadline)
    }

    fn require_lock(&self, cx: &Cx, operation: &'static str) {
        if !self.lock.is_locked_by_caller(cx) {
            let domain = cx.domain();
            fatal::violation(
                domain.lock(),
                domain,
                cx.fibril_id(),
                ContractViolation::LockNotHeld {
                    primitive: OwnerRef::Mutex(self.lock.id()),
                    caller: cx.fibril_id(),
                    operation,
                },
            );
        }
    }
}

/// Body of the companion fibril.
async fn companion(cx: Cx, shared: Arc<TimerShared>) {
    shared.lock.lock(&cx).await;
    loop {
        let state = shared.state();
        match state {
            TimerState::NotSet | TimerState::Fired => shared.cv.wait(&cx, &shared.lock).await,
            TimerState::Active => {
                let timeout_us = shared.remaining_us(cx.now());
                let result = shared.cv.wait_timeout(&cx, &shared.lock, timeout_us).await;
                let still_active = shared.state() == TimerState::Active;
                if result.is_err() && still_active && shared.deadline_reached(cx.now()) {
                    let callback = {
                        let mut data = shared.data.lock();
                        data.state = TimerState::Fired;
                        data.handler = Some(cx.fibril_id());
                        data.callback.take()
                    };
                    debug!(fibril = %cx.fibril_id(), now = ?cx.now(), "timer fired");
                    shared.lock.unlock(&cx);
                    if let Some(callback) = callback {
                        callback(cx.clone()).await;
                    }
                    shared.lock.lock(&cx).await;
                    shared.data.lock().handler = None;
                    // Wake clear/destroy callers waiting for the handler.
                    shared.cv.broadcast();
                }
            }
            TimerState::Cleanup => break,
            TimerState::Clean => {
                let domain = cx.domain();
                fatal::violation(
                    domain.lock(),
                    domain,
                    cx.fibril_id(),
                    ContractViolation::TimerCompanionState { state },
                );
            }
        }
    }

    shared.data.lock().state = TimerState::Clean;
    shared.cv.broadcast();
    shared.lock.unlock(&cx);
    trace!(fibril = %cx.fibril_id(), "timer companion exited");
}

/// A deferred-callback timer backed by a companion fibril.
pub struct Timer {
    shared: Arc<TimerShared>,
    companion: FibrilId,
    destroyed: bool,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("state", &self.shared.state())
            .field("companion", &self.companion)
            .field("lock", &self.shared.lock.id())
            .finish()
    }
}

impl Timer {
    /// Creates a timer and spawns its companion fibril.
    ///
    /// With `lock: None` the timer gets a private mutex; otherwise it shares
    /// the supplied one, which must belong to `domain`.
    #[must_use]
    pub fn create(domain: &Arc<Domain>, lock: Option<Arc<Mutex>>) -> Self {
        let lock = lock.unwrap_or_else(|| Arc::new(Mutex::new(domain)));
        if !Arc::ptr_eq(lock.domain(), domain) {
            fatal::detached_violation(
                domain,
                ContractViolation::ForeignDomain {
                    operation: "Timer::create",
                },
            );
        }
        let shared = Arc::new(TimerShared {
            lock,
            cv: Condvar::new(domain),
            data: parking_lot::Mutex::new(TimerData {
                state: TimerState::NotSet,
                delay: Duration::ZERO,
                deadline: None,
                callback: None,
                handler: None,
            }),
        });
        let companion_shared = Arc::clone(&shared);
        let companion = domain.spawn("timer", move |cx| companion(cx, companion_shared));
        debug!(companion = %companion, "timer created");
        Self {
            shared,
            companion,
            destroyed: false,
        }
    }

    /// The mutex guarding this timer; hold it for the `_locked` variants.
    #[must_use]
    pub fn lock(&self) -> &Arc<Mutex> {
        &self.shared.lock
    }

    /// Current state, read without the timer lock.
    #[must_use]
    pub fn state(&self) -> TimerState {
        self.shared.state()
    }

    /// Delay of the current arming.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.shared.data.lock().delay
    }

    /// The companion fibril.
    #[must_use]
    pub fn companion(&self) -> FibrilId {
        self.companion
    }

    /// Arms the timer to run `callback` after `delay`.
    ///
    /// Aborts the process unless the timer is `NotSet` or `Fired`.
    pub async fn set<F, Fut>(&self, cx: &Cx, delay: Duration, callback: F)
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.lock.lock(cx).await;
        self.set_locked(cx, delay, callback);
        self.shared.lock.unlock(cx);
    }

    /// Like [`set`](Self::set), for callers already holding the timer lock.
    ///
    /// Aborts the process if the caller does not hold the lock.
    pub fn set_locked<F, Fut>(&self, cx: &Cx, delay: Duration, callback: F)
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.require_lock(cx, "Timer::set_locked");
        let callback: TimerCallback = Box::new(move |cx| Box::pin(callback(cx)));
        let now = cx.now();
        let previous = {
            let mut data = self.shared.data.lock();
            let previous = data.state;
            if matches!(previous, TimerState::NotSet | TimerState::Fired) {
                data.state = TimerState::Active;
                data.delay = delay;
                data.deadline = Some(now.saturating_add(delay));
                data.callback = Some(callback);
            }
            previous
        };
        if !matches!(previous, TimerState::NotSet | TimerState::Fired) {
            let domain = cx.domain();
            fatal::violation(
                domain.lock(),
                domain,
                cx.fibril_id(),
                ContractViolation::TimerSetWhileArmed { state: previous },
            );
        }
        trace!(companion = %self.companion, ?delay, "timer armed");
        self.shared.cv.broadcast();
    }

    /// Disarms the timer and returns the state it had: `NotSet`, `Active`
    /// (cancelled before firing) or `Fired`.
    ///
    /// Waits for a running callback to finish first. Aborts the process if
    /// called from the timer's own callback.
    pub async fn clear(&self, cx: &Cx) -> TimerState {
        self.shared.lock.lock(cx).await;
        let previous = self.clear_locked(cx).await;
        self.shared.lock.unlock(cx);
        previous
    }

    /// Like [`clear`](Self::clear), for callers already holding the timer
    /// lock. The lock is released while waiting for a running callback.
    pub async fn clear_locked(&self, cx: &Cx) -> TimerState {
        self.shared.require_lock(cx, "Timer::clear_locked");
        self.wait_for_handler(cx, "clear").await;
        let previous = {
            let mut data = self.shared.data.lock();
            let previous = data.state;
            data.state = TimerState::NotSet;
            data.reset();
            previous
        };
        self.shared.cv.broadcast();
        trace!(companion = %self.companion, ?previous, "timer cleared");
        previous
    }

    /// Stops the companion fibril and frees the timer.
    ///
    /// Aborts the process unless the timer is `NotSet` or `Fired`, or if
    /// called from the timer's own callback.
    pub async fn destroy(mut self, cx: &Cx) {
        let shared = Arc::clone(&self.shared);
        shared.lock.lock(cx).await;
        if shared.handler() == Some(cx.fibril_id()) {
            self.self_wait(cx, "destroy");
        }
        let state = shared.state();
        if !matches!(state, TimerState::NotSet | TimerState::Fired) {
            let domain = cx.domain();
            fatal::violation(
                domain.lock(),
                domain,
                cx.fibril_id(),
                ContractViolation::TimerDestroyWhileArmed { state },
            );
        }
        shared.data.lock().state = TimerState::Cleanup;
        shared.cv.broadcast();
        while shared.state() != TimerState::Clean {
            shared.cv.wait(cx, &shared.lock).await;
        }
        shared.lock.unlock(cx);
        self.destroyed = true;
        debug!(companion = %self.companion, "timer destroyed");
    }

    async fn wait_for_handler(&self, cx: &Cx, operation: &'static str) {
        while let Some(handler) = self.shared.handler() {
            if handler == cx.fibril_id() {
                self.self_wait(cx, operation);
            }
            self.shared.cv.wait(cx, &self.shared.lock).await;
        }
    }

    fn self_wait(&self, cx: &Cx, operation: &'static str) -> ! {
        let domain = cx.domain();
        fatal::violation(
            domain.lock(),
            domain,
            cx.fibril_id(),
            ContractViolation::TimerSelfWait {
                caller: cx.fibril_id(),
                operation,
            },
        )
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let mut data = self.shared.data.lock();
        if matches!(data.state, TimerState::Cleanup | TimerState::Clean) {
            return;
        }
        warn!(
            companion = %self.companion,
            state = ?data.state,
            "timer dropped without destroy; asking companion to exit"
        );
        data.state = TimerState::Cleanup;
        data.reset();
        drop(data);
        self.shared.cv.broadcast();
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

    type FireLog = Arc<Log<Vec<Time>>>;

    fn recorder(log: &FireLog) -> impl FnOnce(Cx) -> std::future::Ready<()> + Send + 'static {
        let log = Arc::clone(log);
        move |cx| {
            log.lock().push(cx.now());
            std::future::ready(())
        }
    }

    #[test]
    fn clear_before_delay_cancels() {
        init_test("clear_before_delay_cancels");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let fired: FireLog = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&fired);
        let previous = runtime
            .block_on("main", move |cx| async move {
                let timer = Timer::create(cx.domain(), None);
                timer.set(&cx, Duration::from_millis(100), recorder(&log)).await;
                assert_eq!(timer.state(), TimerState::Active);
                cx.sleep(Duration::from_millis(40)).await;
                let previous = timer.clear(&cx).await;
                cx.sleep(Duration::from_millis(200)).await;
                timer.destroy(&cx).await;
                previous
            })
            .expect("run");
        crate::assert_with_log!(
            previous == TimerState::Active,
            "cleared while armed",
            TimerState::Active,
            previous
        );
        assert!(fired.lock().is_empty(), "callback must not run");
        crate::test_complete!("clear_before_delay_cancels");
    }

    #[test]
    fn fires_after_delay_then_clear_reports_fired() {
        init_test("fires_after_delay_then_clear_reports_fired");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let fired: FireLog = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&fired);
        let (previous, after) = runtime
            .block_on("main", move |cx| async move {
                let timer = Timer::create(cx.domain(), None);
                timer.set(&cx, Duration::from_millis(100), recorder(&log)).await;
                cx.sleep(Duration::from_millis(150)).await;
                let previous = timer.clear(&cx).await;
                let after = timer.state();
                timer.destroy(&cx).await;
                (previous, after)
            })
            .expect("run");
        crate::assert_with_log!(
            previous == TimerState::Fired,
            "fired before clear",
            TimerState::Fired,
            previous
        );
        assert_eq!(after, TimerState::NotSet);
        let fired = fired.lock().clone();
        crate::assert_with_log!(
            fired == [Time::from_millis(100)],
            "callback ran once at the deadline",
            [Time::from_millis(100)],
            fired
        );
        crate::test_complete!("fires_after_delay_then_clear_reports_fired");
    }

    #[test]
    fn zero_delay_fires_promptly() {
        init_test("zero_delay_fires_promptly");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let fired: FireLog = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&fired);
        runtime
            .block_on("main", move |cx| async move {
                let timer = Timer::create(cx.domain(), None);
                timer.set(&cx, Duration::ZERO, recorder(&log)).await;
                cx.sleep(Duration::from_millis(1)).await;
                assert_eq!(timer.state(), TimerState::Fired);
                timer.destroy(&cx).await;
            })
            .expect("run");
        assert_eq!(fired.lock().as_slice(), [Time::ZERO]);
        crate::test_complete!("zero_delay_fires_promptly");
    }

    fn rearming(timer: Arc<Timer>, log: FireLog) -> TimerCallback {
        Box::new(move |cx| {
            Box::pin(async move {
                let count = {
                    let mut fired = log.lock();
                    fired.push(cx.now());
                    fired.len()
                };
                if count < 3 {
                    let next = rearming(Arc::clone(&timer), Arc::clone(&log));
                    timer.set(&cx, Duration::from_millis(10), next).await;
                }
            })
        })
    }

    #[test]
    fn callback_can_rearm_its_timer() {
        init_test("callback_can_rearm_its_timer");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let fired: FireLog = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&fired);
        runtime
            .block_on("main", move |cx| async move {
                let timer = Arc::new(Timer::create(cx.domain(), None));
                let first = rearming(Arc::clone(&timer), Arc::clone(&log));
                timer.set(&cx, Duration::from_millis(10), first).await;
                cx.sleep(Duration::from_millis(100)).await;
                assert_eq!(timer.state(), TimerState::Fired);
                let timer = Arc::try_unwrap(timer).expect("callbacks released the timer");
                timer.destroy(&cx).await;
            })
            .expect("run");
        let fired = fired.lock().clone();
        crate::assert_with_log!(
            fired == [Time::from_millis(10), Time::from_millis(20), Time::from_millis(30)],
            "three chained firings",
            [Time::from_millis(10), Time::from_millis(20), Time::from_millis(30)],
            fired
        );
        crate::test_complete!("callback_can_rearm_its_timer");
    }

    #[test]
    fn shared_lock_allows_locked_variants() {
        init_test("shared_lock_allows_locked_variants");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let fired: FireLog = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&fired);
        runtime
            .block_on("main", move |cx| async move {
                let guard = Arc::new(Mutex::new(cx.domain()));
                let timer = Timer::create(cx.domain(), Some(Arc::clone(&guard)));
                assert!(Arc::ptr_eq(timer.lock(), &guard));

                guard.lock(&cx).await;
                timer.set_locked(&cx, Duration::from_millis(5), recorder(&log));
                assert_eq!(timer.delay(), Duration::from_millis(5));
                guard.unlock(&cx);

                cx.sleep(Duration::from_millis(10)).await;
                guard.lock(&cx).await;
                let previous = timer.clear_locked(&cx).await;
                assert!(guard.is_locked_by_caller(&cx));
                guard.unlock(&cx);
                assert_eq!(previous, TimerState::Fired);
                timer.destroy(&cx).await;
            })
            .expect("run");
        assert_eq!(fired.lock().len(), 1);
        crate::test_complete!("shared_lock_allows_locked_variants");
    }

    #[test]
    fn clear_locked_waits_for_running_handler() {
        init_test("clear_locked_waits_for_running_handler");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let events: Arc<Log<Vec<(&'static str, Time)>>> = Arc::new(Log::new(Vec::new()));
        let log = Arc::clone(&events);
        let (previous, still_held) = runtime
            .block_on("main", move |cx| async move {
                let timer = Timer::create(cx.domain(), None);
                let handler_log = Arc::clone(&log);
                timer
                    .set(&cx, Duration::from_millis(10), move |cx: Cx| async move {
                        handler_log.lock().push(("handler start", cx.now()));
                        cx.sleep(Duration::from_millis(30)).await;
                        handler_log.lock().push(("handler done", cx.now()));
                    })
                    .await;

                cx.sleep(Duration::from_millis(20)).await;
                assert_eq!(timer.state(), TimerState::Fired);
                timer.lock().lock(&cx).await;
                let previous = timer.clear_locked(&cx).await;
                log.lock().push(("cleared", cx.now()));
                let still_held = timer.lock().is_locked_by_caller(&cx);
                timer.lock().unlock(&cx);
                timer.destroy(&cx).await;
                (previous, still_held)
            })
            .expect("run");

        crate::assert_with_log!(
            previous == TimerState::Fired && still_held,
            "clear reports Fired and returns holding the lock",
            (TimerState::Fired, true),
            (previous, still_held)
        );
        let events = events.lock().clone();
        let expected = [
            ("handler start", Time::from_millis(10)),
            ("handler done", Time::from_millis(40)),
            ("cleared", Time::from_millis(40)),
        ];
        crate::assert_with_log!(
            events == expected,
            "clear returned only after the handler finished",
            expected,
            events
        );
        crate::test_complete!("clear_locked_waits_for_running_handler");
    }

    #[test]
    fn dropped_timer_lets_companion_exit() {
        init_test("dropped_timer_lets_companion_exit");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let companion = runtime
            .block_on("main", |cx| async move {
                let timer = Timer::create(cx.domain(), None);
                cx.yield_now().await;
                let companion = timer.companion();
                drop(timer);
                companion
            })
            .expect("run");
        let report = runtime.run().expect("run");
        crate::assert_with_log!(
            report.is_quiescent(),
            "companion exited",
            true,
            report.is_quiescent()
        );
        assert!(runtime.domain().fibril_name(companion).is_none());
        crate::test_complete!("dropped_timer_lets_companion_exit");
    }
}
