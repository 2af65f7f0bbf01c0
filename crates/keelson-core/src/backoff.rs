//! Backoff policies.
//!
//! A backoff maps a retry index to a wait duration. Loops keep one
//! `BackOff` each and move its index with `increment` on success and
//! `reset` on failure; error handlers call `value` directly with a
//! consecutive-error count.
//!
//! Two policies are supported, selected from a configuration string:
//!
//! - `"1500"`: constant, every index waits 1500 ms.
//! - `"1000:60000:10"`: bounded power law from 1000 ms to 60000 ms,
//!   reached after 10 steps with a quadratic ease-in.

use std::fmt;
use std::time::Duration;

use tracing::warn;

/// Used when both the configured and the fallback strings are malformed.
const LAST_RESORT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Constant(Duration),
    PowerLaw {
        min: Duration,
        max: Duration,
        steps: u32,
    },
}

/// A backoff policy plus the index its owner is currently at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackOff {
    policy: Policy,
    index: u32,
}

impl BackOff {
    /// Same wait for every index.
    pub fn constant(value: Duration) -> Self {
        Self {
            policy: Policy::Constant(value),
            index: 0,
        }
    }

    /// Quadratic ease-in from `min` (index 0) to `max` (index `steps`).
    ///
    /// Returns `None` when `min > max` or `steps == 0`.
    pub fn power_law(min: Duration, max: Duration, steps: u32) -> Option<Self> {
        if min > max || steps == 0 {
            return None;
        }
        Some(Self {
            policy: Policy::PowerLaw { min, max, steps },
            index: 0,
        })
    }

    /// Parse a `"min:max:steps"` or bare `"millis"` configuration string.
    pub fn parse(config: &str) -> Option<Self> {
        let parts: Vec<&str> = config.trim().split(':').map(str::trim).collect();
        match parts.as_slice() {
            [value] => value
                .parse::<u64>()
                .ok()
                .map(|ms| Self::constant(Duration::from_millis(ms))),
            [min, max, steps] => {
                let min = min.parse::<u64>().ok()?;
                let max = max.parse::<u64>().ok()?;
                let steps = steps.parse::<u32>().ok()?;
                Self::power_law(Duration::from_millis(min), Duration::from_millis(max), steps)
            }
            _ => None,
        }
    }

    /// Parse `config`, falling back to `default` when it is malformed.
    ///
    /// Never fails: if `default` is malformed as well a one second
    /// constant backoff is used.
    pub fn parse_or(config: &str, default: &str) -> Self {
        if let Some(backoff) = Self::parse(config) {
            return backoff;
        }
        warn!(%config, %default, "malformed backoff configuration, using default");
        Self::parse(default).unwrap_or_else(|| {
            warn!(%default, "malformed default backoff configuration");
            Self::constant(LAST_RESORT)
        })
    }

    /// Wait duration for `index`.
    pub fn value(&self, index: u32) -> Duration {
        match self.policy {
            Policy::Constant(value) => value,
            Policy::PowerLaw { max, steps, .. } if index >= steps => max,
            Policy::PowerLaw { min, max, steps } => {
                let ratio = f64::from(index) / f64::from(steps);
                let span = (max - min).as_secs_f64();
                let value = min + Duration::from_secs_f64(span * ratio * ratio);
                value.clamp(min, max)
            }
        }
    }

    /// Supremum of `value` over every index.
    pub fn max(&self) -> Duration {
        match self.policy {
            Policy::Constant(value) => value,
            Policy::PowerLaw { max, .. } => max,
        }
    }

    /// Advance the index. Returns the index before the call.
    pub fn increment(&mut self) -> u32 {
        let previous = self.index;
        self.index = self.index.saturating_add(1);
        previous
    }

    /// Zero the index. Returns the index before the call.
    pub fn reset(&mut self) -> u32 {
        std::mem::replace(&mut self.index, 0)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Wait duration at the current index.
    pub fn current(&self) -> Duration {
        self.value(self.index)
    }

    /// Wait duration the next `increment` would lead to.
    pub fn next(&self) -> Duration {
        self.value(self.index.saturating_add(1))
    }
}

impl fmt::Display for BackOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.policy {
            Policy::Constant(value) => write!(f, "{}", value.as_millis()),
            Policy::PowerLaw { min, max, steps } => {
                write!(f, "{}:{}:{}", min.as_millis(), max.as_millis(), steps)
            }
        }
    }
}

/// TTL in whole seconds that outlives `period` with 25% headroom.
pub fn ttl_for(period: Duration) -> u64 {
    ((period.as_secs_f64() * 1.25).ceil() as u64).max(1)
}
