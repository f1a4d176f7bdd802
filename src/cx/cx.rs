//! The capability context type.
//!
//! `Cx` is the token that grants a fibril access to its domain:
//! - Querying identity (fibril ID, diagnostic name)
//! - Reading domain time
//! - Spawning, yielding and sleeping
//!
//! # Capability Model
//!
//! Every blocking operation in this crate takes a `&Cx`. The context names
//! the calling fibril explicitly, which is what ownership tracking and the
//! deadlock detector key on; there is no thread-local "current fibril".
//!
//! # Thread Safety
//!
//! `Cx` is `Send + Sync` and cheap to clone. The semantic contract is that a
//! `Cx` belongs to the fibril it was handed to: passing it to another fibril
//! makes that fibril act under the wrong identity, which ownership checks
//! will report as a contract violation.

use crate::runtime::Domain;
use crate::runtime::park::Park;
use crate::runtime::waker::WakeSource;
use crate::types::{FibrilId, Time};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// The capability context for a fibril.
///
/// A `Cx` is provided to each fibril by [`Domain::spawn`]. It grants access
/// to:
///
/// - **Identity**: the fibril's [`FibrilId`]
/// - **Domain**: the scheduling domain every primitive is created against
/// - **Time**: virtual or monotonic domain time
///
/// # Example
///
/// ```
/// use fibril_sync::runtime::{Runtime, RuntimeConfig};
/// use fibril_sync::sync::Mutex;
///
/// let mut runtime = Runtime::new(RuntimeConfig::new());
/// let held = runtime
///     .block_on("main", |cx| async move {
///         let mutex = Mutex::new(cx.domain());
///         mutex.lock(&cx).await;
///         let held = mutex.is_locked_by_caller(&cx);
///         mutex.unlock(&cx);
///         held
///     })
///     .unwrap();
/// assert!(held);
/// ```
#[derive(Debug, Clone)]
pub struct Cx {
    fibril: FibrilId,
    domain: Arc<Domain>,
}

impl Cx {
    pub(crate) fn new(fibril: FibrilId, domain: Arc<Domain>) -> Self {
        Self { fibril, domain }
    }

    /// Returns the calling fibril's ID.
    #[inline]
    #[must_use]
    pub fn fibril_id(&self) -> FibrilId {
        self.fibril
    }

    /// Returns the domain this fibril runs in.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Returns the fibril's diagnostic name.
    #[must_use]
    pub fn name(&self) -> String {
        self.domain
            .fibril_name(self.fibril)
            .unwrap_or_else(|| self.fibril.to_string())
    }

    /// Current domain time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.domain.now()
    }

    /// Spawns a sibling fibril in the same domain.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, entry: F) -> FibrilId
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.domain.spawn(name, entry)
    }

    /// Gives every other runnable fibril a turn.
    ///
    /// The fibril goes to the back of the woken queue, behind everything
    /// already runnable.
    pub fn yield_now(&self) -> Yield<'_> {
        Yield {
            cx: self,
            yielded: false,
        }
    }

    /// Suspends the fibril for `duration` of domain time.
    pub async fn sleep(&self, duration: Duration) {
        let ticket = self.domain.lock().next_ticket();
        let deadline = self.now().saturating_add(duration);
        // Nobody holds this ticket, so only the deadline can end the park.
        Park::new(self, ticket, Some(deadline)).await;
    }
}

/// Future returned by [`Cx::yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Yield<'a> {
    cx: &'a Cx,
    yielded: bool,
}

impl Future for Yield<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _task: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        let cx = self.cx;
        cx.domain.wakers().wake(cx.fibril, WakeSource::Yield);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::test_utils::init_test_logging;
    use crate::types::Time;
    use std::time::Duration;

    #[test]
    fn cx_reports_identity_and_name() {
        init_test_logging();
        crate::test_phase!("cx_reports_identity_and_name");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let (id, name) = runtime
            .block_on("worker-7", |cx| async move { (cx.fibril_id(), cx.name()) })
            .expect("run");
        crate::assert_with_log!(name == "worker-7", "name", "worker-7", name);
        assert_eq!(id.to_string(), "F0.0");
        crate::test_complete!("cx_reports_identity_and_name");
    }

    #[test]
    fn yield_runs_every_other_ready_fibril_first() {
        init_test_logging();
        crate::test_phase!("yield_runs_every_other_ready_fibril_first");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let order = runtime
            .block_on("main", |cx| async move {
                let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
                for name in ["a", "b"] {
                    let log = std::sync::Arc::clone(&log);
                    cx.spawn(name, move |_cx| async move {
                        log.lock().push(name);
                    });
                }
                log.lock().push("main before");
                cx.yield_now().await;
                log.lock().push("main after");
                let order = log.lock().clone();
                order
            })
            .expect("run");
        crate::assert_with_log!(
            order == ["main before", "a", "b", "main after"],
            "yielding fibril resumes after the spawned ones",
            ["main before", "a", "b", "main after"],
            order
        );
        crate::test_complete!("yield_runs_every_other_ready_fibril_first");
    }

    #[test]
    fn sleeps_interleave_by_deadline() {
        init_test_logging();
        crate::test_phase!("sleeps_interleave_by_deadline");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let order = runtime
            .block_on("main", |cx| async move {
                let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
                for (name, ms) in [("slow", 20u64), ("fast", 5)] {
                    let log = std::sync::Arc::clone(&log);
                    cx.spawn(name, move |cx| async move {
                        cx.sleep(Duration::from_millis(ms)).await;
                        log.lock().push((name, cx.now()));
                    });
                }
                cx.sleep(Duration::from_millis(50)).await;
                let order = log.lock().clone();
                order
            })
            .expect("run");
        crate::assert_with_log!(
            order == [("fast", Time::from_millis(5)), ("slow", Time::from_millis(20))],
            "woken in deadline order at their deadlines",
            [("fast", Time::from_millis(5)), ("slow", Time::from_millis(20))],
            order
        );
        crate::test_complete!("sleeps_interleave_by_deadline");
    }
}
