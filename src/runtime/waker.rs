//! Fibril wakers.
//!
//! A waker only records "this fibril may make progress" in a FIFO queue; the
//! run loop drains the queue and polls fibrils in wake order. Duplicate wakes
//! before the next drain collapse into one.

use crate::types::FibrilId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::task::{Wake, Waker};
use tracing::trace;

/// What made a fibril runnable. Only used for trace attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// The fibril was just spawned.
    Spawn,
    /// A park deadline expired.
    Timer,
    /// A primitive notified the fibril.
    Explicit,
    /// The fibril yielded and asked to run again.
    Yield,
}

impl WakeSource {
    const fn label(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Timer => "timer",
            Self::Explicit => "explicit",
            Self::Yield => "yield",
        }
    }
}

#[derive(Debug, Default)]
struct WokenQueue {
    order: VecDeque<FibrilId>,
    queued: HashSet<FibrilId>,
}

/// Shared record of woken fibrils.
#[derive(Debug, Default)]
pub struct WakerState {
    woken: Mutex<WokenQueue>,
}

impl WakerState {
    /// Creates an empty waker state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the waker handed to `fibril` when it is polled.
    #[must_use]
    pub fn waker_for(self: &Arc<Self>, fibril: FibrilId) -> Waker {
        Waker::from(Arc::new(FibrilWaker {
            state: Arc::clone(self),
            fibril,
        }))
    }

    /// Marks `fibril` runnable.
    pub fn wake(&self, fibril: FibrilId, source: WakeSource) {
        let mut woken = self.woken.lock();
        if woken.queued.insert(fibril) {
            woken.order.push_back(fibril);
            trace!(fibril = %fibril, wake_source = source.label(), "fibril woken");
        }
    }

    /// Drains woken fibrils in wake order.
    pub fn drain_woken(&self) -> Vec<FibrilId> {
        let mut woken = self.woken.lock();
        woken.queued.clear();
        woken.order.drain(..).collect()
    }

    /// True if any fibril is waiting to be polled.
    #[must_use]
    pub fn has_woken(&self) -> bool {
        !self.woken.lock().order.is_empty()
    }
}

struct FibrilWaker {
    state: Arc<WakerState>,
    fibril: FibrilId,
}

impl Wake for FibrilWaker {
    fn wake(self: Arc<Self>) {
        self.state.wake(self.fibril, WakeSource::Explicit);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.state.wake(self.fibril, WakeSource::Explicit);
    }
}
