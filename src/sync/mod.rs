//! Fibril synchronization primitives.
//!
//! Every primitive lives in a [`Domain`](crate::runtime::Domain): its record
//! sits in the domain's tables and is only touched under the domain's global
//! lock. Handles ([`Mutex`], [`RwLock`], ...) are thin wrappers around a
//! record id.
//!
//! # Primitives
//!
//! - [`Mutex`]: FIFO hand-off mutex, owner tracked for deadlock detection
//! - [`RwLock`]: reader-writer lock where a new reader may join readers
//!   already holding the lock
//! - [`Condvar`]: condition variable with optional timeouts, used with a
//!   [`Mutex`]
//! - [`Semaphore`]: counting semaphore without an owner
//! - [`Timer`]: deferred callback run by a companion fibril
//!
//! # Waiting
//!
//! Blocking operations return futures. A fibril that must wait is appended
//! to the primitive's FIFO queue and parked; the releasing fibril hands the
//! primitive directly to the oldest eligible waiter. Dropping a pending
//! future unlinks its queue entry, or passes the primitive on if it had
//! already been handed over.
//!
//! # Fatal Conditions
//!
//! Before a fibril parks on a [`Mutex`] or [`RwLock`], the chain of owners
//! starting at that primitive is walked. If it leads back to the caller the
//! [`DeadlockReport`] is printed and the process aborts. Contract violations
//! such as unlocking a mutex the caller does not hold abort the same way
//! (see [`fatal`]).

mod condvar;
mod deadlock;
pub mod fatal;
mod mutex;
mod rwlock;
mod semaphore;
pub(crate) mod table;
mod timer;
pub(crate) mod wait;

pub use condvar::Condvar;
pub use deadlock::{ChainLink, DeadlockReport, OwnerRef};
pub use mutex::{LockFuture, Mutex};
pub use rwlock::{AccessMode, RwLock, RwLockFuture};
pub use semaphore::{DownFuture, Semaphore};
pub use timer::{Timer, TimerCallback, TimerState};
