use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(system_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn add(self, duration: Duration) -> Self {
        self.add_millis(duration_ms(duration))
    }

    #[must_use]
    pub fn sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_ms(duration)))
    }

    /// Time remaining until `self`, zero if already passed.
    #[must_use]
    pub fn duration_until(self, now: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(now.0))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }

    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn system_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or(0)
}

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

/// Reads the operating system clock on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Wall clock anchored once and advanced by the tokio timer driver.
///
/// Timestamps and timers observe the same time source, so a paused tokio
/// runtime advances both together.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    origin_wall: UnixTimeMs,
    origin: tokio::time::Instant,
}

impl RuntimeClock {
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(UnixTimeMs::now())
    }

    #[must_use]
    pub fn anchored_at(origin_wall: UnixTimeMs) -> Self {
        Self {
            origin_wall,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> UnixTimeMs {
        self.origin_wall.add(self.origin.elapsed())
    }
}
