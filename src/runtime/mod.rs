//! Single-threaded cooperative fibril runtime.
//!
//! The [`Runtime`] owns the futures of every fibril in one [`Domain`] and
//! drives them:
//!
//! 1. admit fibrils spawned since the last iteration;
//! 2. wake fibrils whose park deadline has passed;
//! 3. poll woken fibrils in FIFO wake order;
//! 4. when nothing is runnable, move time to the next deadline (virtual
//!    clock) or sleep until it (monotonic clock); with no deadline pending,
//!    stop.
//!
//! Exactly one fibril runs at a time, so primitive logic inside a domain is
//! never concurrent with itself.

pub mod config;
pub(crate) mod deadline;
pub(crate) mod domain;
pub(crate) mod park;
pub mod waker;

pub use config::{CLOCK_ENV, ClockMode, MAX_STEPS_ENV, RuntimeConfig};
pub use domain::Domain;

use crate::cx::Cx;
use crate::error::RunError;
use crate::types::{FibrilId, Time};
use domain::FibrilFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace};
use waker::WakeSource;

/// Summary of one [`Runtime::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Fibril polls performed.
    pub steps: u64,
    /// Fibrils that ran to completion.
    pub completed: u64,
    /// Fibrils still alive (all of them blocked) when the run stopped.
    pub blocked: usize,
    /// Domain time when the run stopped.
    pub time_end: Time,
}

impl RunReport {
    /// True if no fibril was left blocked.
    #[must_use]
    pub const fn is_quiescent(&self) -> bool {
        self.blocked == 0
    }

    /// JSON summary for logs and test artifacts.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "steps": self.steps,
            "completed": self.completed,
            "blocked": self.blocked,
            "time_end_ns": self.time_end.as_nanos(),
            "quiescent": self.is_quiescent(),
        })
    }
}

/// Drives every fibril of one domain on the calling thread.
pub struct Runtime {
    config: RuntimeConfig,
    domain: Arc<Domain>,
    fibrils: HashMap<FibrilId, FibrilFuture>,
    steps: u64,
    completed: u64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("domain", &self.domain)
            .field("fibrils", &self.fibrils.len())
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime with a fresh domain.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let domain = Domain::new(config.clock);
        Self {
            config,
            domain,
            fibrils: HashMap::new(),
            steps: 0,
            completed: 0,
        }
    }

    /// The domain whose fibrils this runtime drives.
    #[must_use]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Current domain time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.domain.now()
    }

    /// Spawns a fibril; it first runs during the next `run`/`block_on`.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, entry: F) -> FibrilId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.domain.spawn(name, entry)
    }

    /// Runs until every fibril has finished or is blocked with no pending
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::StepLimitExceeded`] if the configured step limit
    /// is reached first.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        self.steps = 0;
        self.completed = 0;
        self.drive(&|| false)?;
        let report = RunReport {
            steps: self.steps,
            completed: self.completed,
            blocked: self.fibrils.len(),
            time_end: self.domain.now(),
        };
        debug!(
            steps = report.steps,
            completed = report.completed,
            blocked = report.blocked,
            "run finished"
        );
        Ok(report)
    }

    /// Spawns a root fibril and runs until it completes, returning its
    /// output. Other fibrils that are still alive at that point stay
    /// suspended in this runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Stalled`] if every fibril blocked before the root
    /// completed, or [`RunError::StepLimitExceeded`].
    pub fn block_on<F, Fut, T>(&mut self, name: impl Into<String>, entry: F) -> Result<T, RunError>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(parking_lot::Mutex::new(None));
        let output = Arc::clone(&slot);
        self.domain.spawn(name, move |cx| {
            let body = entry(cx);
            async move {
                let value = body.await;
                *output.lock() = Some(value);
            }
        });

        self.steps = 0;
        self.completed = 0;
        self.drive(&|| slot.lock().is_some())?;
        let value = slot.lock().take();
        value.ok_or(RunError::Stalled {
            blocked: self.fibrils.len(),
        })
    }

    fn drive(&mut self, done: &dyn Fn() -> bool) -> Result<(), RunError> {
        loop {
            if done() {
                return Ok(());
            }
            self.admit_spawned();
            self.fire_expired_timers();

            let woken = self.domain.wakers().drain_woken();
            if woken.is_empty() {
                let next_deadline = self.domain.lock().deadlines.next_deadline();
                match next_deadline {
                    Some(deadline) => self.wait_until(deadline),
                    None => return Ok(()),
                }
                continue;
            }

            for id in woken {
                if done() {
                    return Ok(());
                }
                if let Some(limit) = self.config.max_steps {
                    if self.steps >= limit {
                        return Err(RunError::StepLimitExceeded { limit });
                    }
                }
                self.poll_fibril(id);
            }
        }
    }

    fn admit_spawned(&mut self) {
        for spawned in self.domain.take_spawned() {
            self.fibrils.insert(spawned.id, spawned.future);
        }
    }

    fn fire_expired_timers(&self) {
        let now = self.domain.now();
        let expired = self.domain.lock().deadlines.pop_expired(now);
        for id in expired {
            self.domain.wakers().wake(id, WakeSource::Timer);
        }
    }

    fn wait_until(&self, deadline: Time) {
        match self.domain.clock_mode() {
            ClockMode::Virtual => {
                trace!(?deadline, "idle, advancing virtual clock");
                self.domain.advance_to(deadline);
            }
            ClockMode::Monotonic => {
                let remaining = deadline.duration_since(self.domain.now());
                trace!(?remaining, "idle, sleeping until next deadline");
                std::thread::sleep(remaining);
            }
        }
    }

    fn poll_fibril(&mut self, id: FibrilId) {
        // Stale wakes for finished fibrils are dropped here.
        let Some(mut future) = self.fibrils.remove(&id) else {
            return;
        };
        let waker = self.domain.wakers().waker_for(id);
        let mut task = Context::from_waker(&waker);
        self.steps += 1;
        match future.as_mut().poll(&mut task) {
            Poll::Ready(()) => {
                self.completed += 1;
                self.domain.retire(id);
            }
            Poll::Pending => {
                self.fibrils.insert(id, future);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn block_on_returns_root_output() {
        init_test("block_on_returns_root_output");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let value = runtime.block_on("root", |cx| async move {
            cx.yield_now().await;
            41 + 1
        });
        crate::assert_with_log!(value == Ok(42), "root output", Ok::<i32, RunError>(42), value);
        crate::test_complete!("block_on_returns_root_output");
    }

    #[test]
    fn fibrils_run_in_wake_order() {
        init_test("fibrils_run_in_wake_order");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            runtime.spawn(name, move |cx| async move {
                log.lock().push(format!("{name}1"));
                cx.yield_now().await;
                log.lock().push(format!("{name}2"));
            });
        }
        let report = runtime.run().expect("run");
        let order = log.lock().clone();
        crate::assert_with_log!(
            order == ["a1", "b1", "c1", "a2", "b2", "c2"],
            "round robin through yields",
            ["a1", "b1", "c1", "a2", "b2", "c2"],
            order
        );
        assert_eq!(report.completed, 3);
        assert!(report.is_quiescent());
        crate::test_complete!("fibrils_run_in_wake_order");
    }

    #[test]
    fn idle_runtime_jumps_to_next_deadline() {
        init_test("idle_runtime_jumps_to_next_deadline");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let woke_at = runtime
            .block_on("sleeper", |cx| async move {
                cx.sleep(Duration::from_secs(30)).await;
                cx.now()
            })
            .expect("run");
        crate::assert_with_log!(
            woke_at == Time::from_secs(30),
            "virtual time jumped",
            Time::from_secs(30),
            woke_at
        );
        crate::test_complete!("idle_runtime_jumps_to_next_deadline");
    }

    #[test]
    fn child_spawned_from_fibril_runs_later() {
        init_test("child_spawned_from_fibril_runs_later");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let root_log = Arc::clone(&log);
        runtime
            .block_on("parent", move |cx| async move {
                let child_log = Arc::clone(&root_log);
                cx.spawn("child", move |_cx| async move {
                    child_log.lock().push("child");
                });
                root_log.lock().push("parent");
                cx.yield_now().await;
                root_log.lock().push("parent again");
            })
            .expect("run");
        let order = log.lock().clone();
        assert_eq!(order, ["parent", "child", "parent again"]);
        crate::test_complete!("child_spawned_from_fibril_runs_later");
    }

    #[test]
    fn step_limit_stops_runaway_fibrils() {
        init_test("step_limit_stops_runaway_fibrils");
        let mut runtime = Runtime::new(RuntimeConfig::new().max_steps(10));
        runtime.spawn("spinner", |cx| async move {
            loop {
                cx.yield_now().await;
            }
        });
        let err = runtime.run().expect_err("must hit the limit");
        crate::assert_with_log!(
            err == RunError::StepLimitExceeded { limit: 10 },
            "limit reported",
            RunError::StepLimitExceeded { limit: 10 },
            err
        );
        crate::test_complete!("step_limit_stops_runaway_fibrils");
    }

    #[test]
    fn report_json_has_counters() {
        init_test("report_json_has_counters");
        let mut runtime = Runtime::new(RuntimeConfig::new());
        runtime.spawn("noop", |_cx| async {});
        let report = runtime.run().expect("run");
        let json = report.to_json();
        assert_eq!(json["completed"], 1);
        assert_eq!(json["blocked"], 0);
        assert_eq!(json["quiescent"], true);
        crate::test_complete!("report_json_has_counters");
    }
}
