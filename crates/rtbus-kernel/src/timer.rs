//! [`TimerService`] – one-shot deadline timers for QoS monitoring.
//!
//! Each topic rate contract, HRT subscriber and HRT request owns a
//! [`QosTimer`].  Arming a timer records an absolute [`Timestamp`] deadline
//! and a callback; when the service observes a clock value at or past the
//! deadline the timer is disarmed and its callback runs.
//!
//! Deadlines are checked either by a background [`TimerThread`]
//! ([`TimerService::spawn`]) or by calling [`TimerService::fire_due`]
//! directly, which is what tests do together with a
//! [`ManualClock`](crate::clock::ManualClock).
//!
//! Callbacks run without the timer table locked, so a callback may re-arm
//! its own (or any other) timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rtbus_types::Timestamp;
use tracing::{debug, trace};

use crate::clock::Clock;

/// Callback run when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Upper bound on how long the timer thread sleeps between clock reads.
const MAX_SLEEP: Duration = Duration::from_millis(10);

// ────────────────────────────────────────────────────────────────────────────
// Internal table
// ────────────────────────────────────────────────────────────────────────────

struct ArmedEntry {
    deadline: Timestamp,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerTable {
    next_key: u64,
    armed: HashMap<u64, ArmedEntry>,
}

impl TimerTable {
    fn next_deadline(&self) -> Option<Timestamp> {
        self.armed.values().map(|e| e.deadline).min()
    }
}

#[derive(Default)]
struct TimerShared {
    table: Mutex<TimerTable>,
    changed: Condvar,
    running: AtomicBool,
}

// ────────────────────────────────────────────────────────────────────────────
// TimerService
// ────────────────────────────────────────────────────────────────────────────

/// Shared table of armed timers.  Cloning yields another handle to the same
/// table.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use rtbus_kernel::timer::TimerService;
/// use rtbus_types::Timestamp;
///
/// let service = TimerService::new();
/// let timer = service.timer();
/// let fired = Arc::new(AtomicUsize::new(0));
/// let counter = fired.clone();
/// timer.arm(Timestamp::from_millis(5), Arc::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// }));
///
/// assert_eq!(service.fire_due(Timestamp::from_millis(4)), 0);
/// assert_eq!(service.fire_due(Timestamp::from_millis(5)), 1);
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// assert!(!timer.is_armed());
/// ```
#[derive(Clone, Default)]
pub struct TimerService {
    shared: Arc<TimerShared>,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("armed", &self.armed_count())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new, disarmed timer.
    pub fn timer(&self) -> QosTimer {
        let mut table = self.shared.table.lock();
        table.next_key += 1;
        QosTimer {
            key: table.next_key,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.shared.table.lock().next_deadline()
    }

    pub fn armed_count(&self) -> usize {
        self.shared.table.lock().armed.len()
    }

    /// Disarm every timer whose deadline is `<= now` and run its callback.
    ///
    /// Callbacks fire in deadline order.  Returns how many fired.
    pub fn fire_due(&self, now: Timestamp) -> usize {
        let mut due: Vec<(Timestamp, TimerCallback)> = {
            let mut table = self.shared.table.lock();
            let keys: Vec<u64> = table
                .armed
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| table.armed.remove(&k))
                .map(|e| (e.deadline, e.callback))
                .collect()
        };
        due.sort_by_key(|(deadline, _)| *deadline);
        for (deadline, callback) in &due {
            trace!(%deadline, %now, "qos timer expired");
            callback();
        }
        due.len()
    }

    /// Start a background thread that fires timers against `clock`.
    pub fn spawn(&self, clock: Arc<dyn Clock>) -> std::io::Result<TimerThread> {
        self.shared.running.store(true, Ordering::SeqCst);
        let service = self.clone();
        let handle = thread::Builder::new()
            .name("rtbus-timers".into())
            .spawn(move || service.run(clock.as_ref()))?;
        debug!("timer thread started");
        Ok(TimerThread {
            service: self.clone(),
            handle: Some(handle),
        })
    }

    fn run(&self, clock: &dyn Clock) {
        while self.shared.running.load(Ordering::SeqCst) {
            self.fire_due(clock.now());

            let mut table = self.shared.table.lock();
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            let sleep = table
                .next_deadline()
                .map(|d| d.saturating_duration_since(clock.now()))
                .unwrap_or(MAX_SLEEP)
                .min(MAX_SLEEP);
            if !sleep.is_zero() {
                self.shared.changed.wait_for(&mut table, sleep);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TimerThread
// ────────────────────────────────────────────────────────────────────────────

/// Handle to the background timer thread.  Stops and joins it on drop.
pub struct TimerThread {
    service: TimerService,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn stop(&mut self) {
        self.service.shared.running.store(false, Ordering::SeqCst);
        {
            let _table = self.service.shared.table.lock();
            self.service.shared.changed.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("timer thread stopped");
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// QosTimer
// ────────────────────────────────────────────────────────────────────────────

/// A single one-shot timer slot.  Disarmed when dropped.
pub struct QosTimer {
    key: u64,
    shared: Arc<TimerShared>,
}

impl fmt::Debug for QosTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QosTimer")
            .field("key", &self.key)
            .field("deadline", &self.deadline())
            .finish()
    }
}

impl QosTimer {
    /// Arm (or re-arm) the timer to fire `callback` at `deadline`.
    pub fn arm(&self, deadline: Timestamp, callback: TimerCallback) {
        let mut table = self.shared.table.lock();
        table
            .armed
            .insert(self.key, ArmedEntry { deadline, callback });
        self.shared.changed.notify_all();
    }

    /// Disarm.  No-op when not armed.
    pub fn reset(&self) {
        self.shared.table.lock().armed.remove(&self.key);
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.shared
            .table
            .lock()
            .armed
            .get(&self.key)
            .map(|e| e.deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.shared.table.lock().armed.contains_key(&self.key)
    }
}

impl Drop for QosTimer {
    fn drop(&mut self) {
        self.reset();
    }
}
