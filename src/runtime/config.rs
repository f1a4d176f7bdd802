//! Runtime configuration.
//!
//! # Defaults
//!
//! | Field | Default | Environment override |
//! |-------|---------|----------------------|
//! | `clock` | [`ClockMode::Virtual`] | `FIBRIL_SYNC_CLOCK=virtual\|monotonic` |
//! | `max_steps` | `None` (unbounded) | `FIBRIL_SYNC_MAX_STEPS=<polls>` |
//!
//! `RuntimeConfig` uses a move-based builder style:
//!
//! ```
//! use fibril_sync::runtime::{ClockMode, RuntimeConfig};
//!
//! let config = RuntimeConfig::new()
//!     .clock(ClockMode::Monotonic)
//!     .max_steps(1_000_000);
//! assert_eq!(config.max_steps, Some(1_000_000));
//! ```

use crate::error::ConfigError;
use std::str::FromStr;

/// Environment variable selecting the clock.
pub const CLOCK_ENV: &str = "FIBRIL_SYNC_CLOCK";
/// Environment variable bounding the number of polls per run.
pub const MAX_STEPS_ENV: &str = "FIBRIL_SYNC_MAX_STEPS";

/// Source of domain time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Time stands still while any fibril is runnable and jumps to the next
    /// deadline when all are blocked. Runs are deterministic.
    #[default]
    Virtual,
    /// Wall-clock monotonic time; the run loop sleeps until the next
    /// deadline when idle.
    Monotonic,
}

impl FromStr for ClockMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtual" | "lab" => Ok(Self::Virtual),
            "monotonic" | "wall" => Ok(Self::Monotonic),
            other => Err(ConfigError::UnknownClockMode(other.to_owned())),
        }
    }
}

/// Configuration for a [`Runtime`](super::Runtime).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Clock driving park deadlines.
    pub clock: ClockMode,
    /// Upper bound on fibril polls per `run`/`block_on` call.
    pub max_steps: Option<u64>,
}

impl RuntimeConfig {
    /// Default configuration: virtual clock, no step limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(CLOCK_ENV) {
            match raw.parse() {
                Ok(clock) => config.clock = clock,
                Err(err) => tracing::warn!(env = CLOCK_ENV, %err, "ignoring clock override"),
            }
        }
        if let Ok(raw) = std::env::var(MAX_STEPS_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(limit) => config.max_steps = Some(limit),
                Err(err) => tracing::warn!(env = MAX_STEPS_ENV, %err, "ignoring step limit override"),
            }
        }
        config
    }

    /// Selects the clock.
    #[must_use]
    pub fn clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Bounds the number of polls per run.
    #[must_use]
    pub fn max_steps(mut self, limit: u64) -> Self {
        self.max_steps = Some(limit);
        self
    }
}
