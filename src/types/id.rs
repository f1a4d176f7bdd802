//! Identifier types and time.
//!
//! Fibrils and primitives are addressed by generational handles into their
//! domain's tables. A handle outliving its record never resolves to another
//! record that happens to reuse the slot.

use crate::util::ArenaIndex;
use core::fmt;
use std::time::Duration;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ArenaIndex);

        impl $name {
            /// Wraps an arena index.
            #[inline]
            #[must_use]
            pub const fn from_arena(index: ArenaIndex) -> Self {
                Self(index)
            }

            /// Returns the underlying arena index.
            #[inline]
            #[must_use]
            pub const fn arena_index(self) -> ArenaIndex {
                self.0
            }

            /// Builds an identifier from raw parts (tests only).
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(index: u32, generation: u32) -> Self {
                Self(ArenaIndex::new(index, generation))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}.{}"), self.0.index(), self.0.generation())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

arena_id!(
    /// Identity of a fibril within its domain.
    FibrilId,
    "F"
);
arena_id!(
    /// Handle of a mutex record.
    MutexId,
    "M"
);
arena_id!(
    /// Handle of a reader-writer lock record.
    RwLockId,
    "RW"
);
arena_id!(
    /// Handle of a condition variable record.
    CondvarId,
    "CV"
);
arena_id!(
    /// Handle of a semaphore record.
    SemaphoreId,
    "S"
);

/// A point in domain time, in nanoseconds since the domain was created.
///
/// Under the virtual clock this only advances when every fibril is blocked;
/// under the monotonic clock it follows [`std::time::Instant`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

impl Time {
    /// The domain epoch.
    pub const ZERO: Self = Self(0);

    /// Creates a time from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from seconds since the epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a duration, saturating at the far future.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Adds a microsecond count, saturating at the far future.
    #[must_use]
    pub const fn saturating_add_micros(self, micros: u64) -> Self {
        Self(self.0.saturating_add(micros.saturating_mul(1_000)))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}
