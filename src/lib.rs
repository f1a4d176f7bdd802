//! Fibril synchronization primitives with ownership-chain deadlock detection.
//!
//! Fibrils are cooperatively scheduled lightweight threads. This crate
//! provides the primitives they coordinate through, a small run loop that
//! drives them, and a deadlock detector that follows "waits for" and
//! "owned by" edges before any fibril parks on a lock.
//!
//! # Layout
//!
//! - [`runtime`]: the [`Domain`](runtime::Domain) holding all shared state
//!   behind one global lock, plus the [`Runtime`](runtime::Runtime) run loop
//!   with a virtual or monotonic clock
//! - [`cx`]: the per-fibril [`Cx`] handle passed to every fibril entry point
//! - [`sync`]: [`Mutex`](sync::Mutex), [`RwLock`](sync::RwLock),
//!   [`Condvar`](sync::Condvar), [`Semaphore`](sync::Semaphore) and
//!   [`Timer`](sync::Timer)
//! - [`error`]: ordinary outcomes, run-loop errors and contract violations
//! - [`types`]: identifiers and domain time
//!
//! # Example
//!
//! ```
//! use fibril_sync::runtime::{Runtime, RuntimeConfig};
//! use fibril_sync::sync::Mutex;
//! use std::sync::Arc;
//!
//! let mut runtime = Runtime::new(RuntimeConfig::new());
//! let mutex = Arc::new(Mutex::new(runtime.domain()));
//! for name in ["a", "b"] {
//!     let mutex = Arc::clone(&mutex);
//!     runtime.spawn(name, move |cx| async move {
//!         mutex.lock(&cx).await;
//!         cx.yield_now().await;
//!         mutex.unlock(&cx);
//!     });
//! }
//! let report = runtime.run().unwrap();
//! assert_eq!(report.completed, 2);
//! ```
//!
//! # Fatal Conditions
//!
//! Deadlocks and misuse (unlocking a lock the caller does not hold, clearing
//! a timer from its own callback, ...) are programming errors: they are
//! reported on stderr with a backtrace and the process aborts.

pub mod cx;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cx::Cx;
pub use error::{ConfigError, ContractViolation, RunError, TimedOut};
pub use runtime::{ClockMode, Runtime, RuntimeConfig};
pub use types::{FibrilId, Time};
