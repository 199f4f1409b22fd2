//! [`Clock`] – time source of the bus.
//!
//! Every timestamp handed to a publisher, every request submission time and
//! every QoS timer deadline is read from one shared clock.  Production code
//! uses the monotonic [`SystemClock`]; tests drive a [`ManualClock`] so that
//! latencies and timer deadlines are exact.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rtbus_types::Timestamp;

/// Monotonic source of [`Timestamp`]s.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Monotonic clock counting microseconds since its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let micros = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        Timestamp::from_micros(micros)
    }
}

/// Clock that only moves when told to.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use rtbus_kernel::clock::{Clock, ManualClock};
/// use rtbus_types::Timestamp;
///
/// let clock = ManualClock::new(Timestamp::from_millis(10));
/// clock.advance(Duration::from_millis(5));
/// assert_eq!(clock.now(), Timestamp::from_millis(15));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.as_micros()),
        }
    }

    /// Jump to `t`.  Moving backwards is allowed; callers own the consequences.
    pub fn set(&self, t: Timestamp) {
        self.now.store(t.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        let micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.now.load(Ordering::SeqCst))
    }
}
