//! Hybrid Logical Clock timestamps for message stamping.
//!
//! Every message a context publishes carries one of these, which gives
//! receivers a per-sender total order that survives coarse system clocks:
//! two messages sent within the same millisecond still compare unequal
//! because the counter component breaks the tie.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A Hybrid Logical Clock timestamp.
///
/// Combines wall-clock milliseconds with a logical counter. The counter
/// only advances while the wall clock stands still, so stamps stay close
/// to physical time while remaining strictly monotonic per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Milliseconds since Unix epoch at stamping time.
    millis: u64,
    /// Disambiguates stamps taken within the same millisecond.
    counter: u32,
}

impl HybridTimestamp {
    /// Creates a timestamp at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            millis: wall_clock_millis(),
            counter: 0,
        }
    }

    /// Creates a timestamp from raw components.
    #[must_use]
    pub const fn new(millis: u64, counter: u32) -> Self {
        Self { millis, counter }
    }

    /// Returns the wall-clock component in milliseconds since epoch.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Returns the logical counter component.
    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Produces the next stamp, strictly greater than this one.
    ///
    /// Called once per outbound message. If the wall clock has moved on,
    /// the counter resets; otherwise the counter advances.
    #[must_use]
    pub fn tick(&self) -> Self {
        let now = wall_clock_millis();
        if now > self.millis {
            Self {
                millis: now,
                counter: 0,
            }
        } else {
            Self {
                millis: self.millis,
                counter: self.counter.saturating_add(1),
            }
        }
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}

impl Default for HybridTimestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.millis.cmp(&other.millis) {
            Ordering::Equal => self.counter.cmp(&other.counter),
            other => other,
        }
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.millis, self.counter)
    }
}
