//! Timing-contract helpers shared by hard real-time subscribers and
//! requests.
//!
//! | Item | Purpose |
//! |---|---|
//! | [`LatencyWindow`] | Smallest and largest latency accepted so far under a jitter bound. |
//! | [`critical_delay`] | Offset after which a pending message or request violates its contract. |
//! | [`Recovery`] | What happens on a violation: core panic or a user handler. |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rtbus_types::BusError;
use tracing::warn;

use crate::core::Core;

// ────────────────────────────────────────────────────────────────────────────
// Latency window
// ────────────────────────────────────────────────────────────────────────────

/// Observed latency bounds used for jitter monitoring.
///
/// The window starts empty.  The first sample opens it; later samples only
/// widen it while the spread stays within the jitter bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyWindow {
    bounds: Option<(Duration, Duration)>,
}

impl LatencyWindow {
    /// `(min, max)` once at least one sample has been accepted.
    pub fn bounds(&self) -> Option<(Duration, Duration)> {
        self.bounds
    }

    /// Feed a sample.  Returns `false` when it falls outside the window,
    /// i.e. when it is a jitter violation.
    pub fn record(&mut self, latency: Duration, jitter: Duration) -> bool {
        let Some((mut min, mut max)) = self.bounds else {
            self.bounds = Some((latency, latency));
            return true;
        };
        if latency < min && max - latency <= jitter {
            min = latency;
        }
        if latency > max && latency - min <= jitter {
            max = latency;
        }
        self.bounds = Some((min, max));
        latency >= min && latency <= max
    }

    /// `true` when `latency` would widen the window beyond `jitter`.
    pub fn exceeds(&self, latency: Duration, jitter: Duration) -> bool {
        match self.bounds {
            None => false,
            Some((min, max)) => {
                (latency > min && latency - min > jitter) || (latency < max && max - latency > jitter)
            }
        }
    }
}

/// Delay after the message (or submission) time at which the contract is
/// broken, and the violation reported when it is.
///
/// The jitter bound `min + jitter` is used once the window is open and it is
/// tighter than the deadline (or there is no deadline).  Otherwise the
/// deadline applies.  `None` means nothing is monitored.
pub fn critical_delay(
    deadline: Option<Duration>,
    jitter: Option<Duration>,
    window: &LatencyWindow,
) -> Option<(Duration, BusError)> {
    let jitter_bound = jitter
        .zip(window.bounds())
        .map(|(jitter, (min, _))| min + jitter);
    match (jitter_bound, deadline) {
        (Some(bound), Some(deadline)) if bound < deadline => {
            Some((bound, BusError::JitterViolation))
        }
        (Some(bound), None) => Some((bound, BusError::JitterViolation)),
        (_, Some(deadline)) => Some((deadline, BusError::DeadlineViolation)),
        (None, None) => None,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Recovery
// ────────────────────────────────────────────────────────────────────────────

/// Callback invoked with the first violation of a recoverable contract.
pub type RecoveryHandler = Arc<dyn Fn(BusError) + Send + Sync>;

/// Reaction to a hard real-time contract violation.
#[derive(Clone, Default)]
pub enum Recovery {
    /// Escalate to [`Core::panic`].
    #[default]
    Panic,
    /// Run the handler once; later violations are absorbed until the latch
    /// is cleared.
    Handler(RecoveryHandler),
}

impl fmt::Debug for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Panic => write!(f, "Panic"),
            Recovery::Handler(_) => write!(f, "Handler(..)"),
        }
    }
}

impl Recovery {
    pub fn handler(f: impl Fn(BusError) + Send + Sync + 'static) -> Self {
        Recovery::Handler(Arc::new(f))
    }

    /// Decide what to do about `violation`.  Must be called with the owning
    /// lock held; the returned [`Escalation`] runs after it is released.
    pub(crate) fn escalate(&self, latch: &mut Option<BusError>, violation: BusError) -> Escalation {
        match self {
            Recovery::Panic => Escalation::Panic(violation),
            Recovery::Handler(handler) => {
                if latch.is_some() {
                    return Escalation::None;
                }
                *latch = Some(violation.clone());
                Escalation::Recover(Arc::clone(handler), violation)
            }
        }
    }
}

/// Deferred reaction computed by [`Recovery::escalate`].
#[must_use]
pub(crate) enum Escalation {
    None,
    Panic(BusError),
    Recover(RecoveryHandler, BusError),
}

impl Escalation {
    pub(crate) fn run(self, core: &Core) {
        match self {
            Escalation::None => {}
            Escalation::Panic(reason) => core.panic(reason),
            Escalation::Recover(handler, violation) => {
                warn!(%violation, "qos violation, running recovery handler");
                handler(violation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    #[test]
    fn window_opens_on_first_sample() {
        let mut w = LatencyWindow::default();
        assert_eq!(w.bounds(), None);
        assert!(w.record(us(50), us(10)));
        assert_eq!(w.bounds(), Some((us(50), us(50))));
    }

    #[test]
    fn window_widens_within_jitter_and_flags_outliers() {
        let mut w = LatencyWindow::default();
        w.record(us(50), us(10));
        assert!(w.record(us(45), us(10)));
        assert!(w.record(us(55), us(10)));
        assert_eq!(w.bounds(), Some((us(45), us(55))));
        // 70 - 45 > 10: rejected, window unchanged.
        assert!(!w.record(us(70), us(10)));
        assert!(!w.record(us(30), us(10)));
        assert_eq!(w.bounds(), Some((us(45), us(55))));
    }

    #[test]
    fn exceeds_checks_both_directions() {
        let mut w = LatencyWindow::default();
        assert!(!w.exceeds(us(1_000), us(1)));
        w.record(us(100), us(20));
        w.record(us(110), us(20));
        assert!(!w.exceeds(us(115), us(20)));
        assert!(w.exceeds(us(121), us(20)));
        assert!(w.exceeds(us(89), us(20)));
    }

    #[test]
    fn critical_delay_prefers_tighter_jitter_bound() {
        let mut w = LatencyWindow::default();
        let deadline = Some(Duration::from_millis(100));
        let jitter = Some(Duration::from_millis(5));

        // Window not open yet: deadline applies.
        assert_eq!(
            critical_delay(deadline, jitter, &w),
            Some((Duration::from_millis(100), BusError::DeadlineViolation))
        );

        w.record(Duration::from_millis(20), Duration::from_millis(5));
        assert_eq!(
            critical_delay(deadline, jitter, &w),
            Some((Duration::from_millis(25), BusError::JitterViolation))
        );
        assert_eq!(
            critical_delay(Some(Duration::from_millis(10)), jitter, &w),
            Some((Duration::from_millis(10), BusError::DeadlineViolation))
        );
        assert_eq!(
            critical_delay(None, jitter, &w),
            Some((Duration::from_millis(25), BusError::JitterViolation))
        );
        assert_eq!(critical_delay(None, None, &w), None);
    }

    #[test]
    fn handler_recovery_latches_first_violation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let recovery = Recovery::handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut latch = None;

        let first = recovery.escalate(&mut latch, BusError::RateViolation);
        assert!(matches!(first, Escalation::Recover(_, BusError::RateViolation)));
        assert!(matches!(
            recovery.escalate(&mut latch, BusError::DeadlineViolation),
            Escalation::None
        ));
        assert_eq!(latch, Some(BusError::RateViolation));

        if let Escalation::Recover(handler, v) = first {
            handler(v);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_recovery_always_escalates() {
        let mut latch = None;
        let recovery = Recovery::Panic;
        assert!(matches!(
            recovery.escalate(&mut latch, BusError::JitterViolation),
            Escalation::Panic(BusError::JitterViolation)
        ));
        assert!(latch.is_none());
    }
}
